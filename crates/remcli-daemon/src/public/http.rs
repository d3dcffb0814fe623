//! JSON API handlers for `/v1` and `/v2`.
//!
//! Read routes answer `null` or 404 for missing entities; versioned writes
//! answer `{result: "success" | "version-mismatch", version, …}` so clients
//! can merge and retry.

use crate::daemon::DaemonState;
use crate::router::RecipientFilter;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use remcli_protocol::{Machine, Session, UpdateBody, VersionedValue};
use remcli_store::{SessionUpsert, WriteOutcome};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

const DEFAULT_PAGE_LIMIT: usize = 50;
const DEFAULT_ACTIVE_LIMIT: usize = 20;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub tag: String,
    pub metadata: String,
    #[serde(default)]
    pub agent_state: Option<String>,
    #[serde(default)]
    pub data_encryption_key: Option<String>,
}

/// Create-or-get by tag. Creating emits `new-session`; rebinding an existing
/// tag emits `update-session` with the refreshed metadata.
pub async fn create_session(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Json<Value> {
    let (mut session, upsert) =
        state
            .store
            .create_session(&req.tag, &req.metadata, req.data_encryption_key);

    if let Some(agent_state) = req.agent_state
        && upsert == SessionUpsert::Created
        && let WriteOutcome::Success { .. } = state.store.update_session_agent_state(
            &session.id,
            Some(agent_state),
            session.agent_state_version,
        )
    {
        session = state
            .store
            .get_session(&session.id)
            .unwrap_or(session);
    }

    match upsert {
        SessionUpsert::Created => {
            state.emit_update_with_seq(
                session.seq,
                UpdateBody::NewSession {
                    session: session.clone(),
                },
                &RecipientFilter::UserScopedOnly,
                None,
            );
        }
        SessionUpsert::Rebound => {
            state.emit_update(
                UpdateBody::UpdateSession {
                    session_id: session.id.clone(),
                    metadata: Some(VersionedValue {
                        value: Some(session.metadata.clone()),
                        version: session.metadata_version,
                    }),
                    agent_state: None,
                },
                &RecipientFilter::SessionScoped(session.id.clone()),
                None,
            );
        }
    }

    Json(json!({ "session": session }))
}

pub async fn list_sessions(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    Json(json!({ "sessions": state.store.list_sessions() }))
}

pub async fn get_session(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> Json<Option<Session>> {
    Json(state.store.get_session(&id))
}

pub async fn delete_session(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if !state.store.delete_session(&id) {
        return Err(StatusCode::NOT_FOUND);
    }
    state.emit_update(
        UpdateBody::DeleteSession {
            session_id: id.clone(),
        },
        &RecipientFilter::SessionScoped(id),
        None,
    );
    Ok(Json(json!({ "result": "success" })))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn list_messages(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Value>, StatusCode> {
    if state.store.get_session(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    Ok(Json(json!({ "messages": state.store.list_messages(&id, limit) })))
}

pub async fn active_sessions(
    State(state): State<Arc<DaemonState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(DEFAULT_ACTIVE_LIMIT);
    Json(json!({ "sessions": state.store.list_active_sessions(limit) }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsPageQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub changed_since: Option<u64>,
}

pub async fn sessions_page(
    State(state): State<Arc<DaemonState>>,
    Query(query): Query<SessionsPageQuery>,
) -> Json<Value> {
    let page = state.store.sessions_page(
        query.cursor.as_deref(),
        query.limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        query.changed_since,
    );
    Json(json!({
        "sessions": page.sessions,
        "nextCursor": page.next_cursor,
        "hasMore": page.has_more,
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertMachineRequest {
    pub id: String,
    pub metadata: String,
    #[serde(default)]
    pub daemon_state: Option<String>,
    #[serde(default)]
    pub data_encryption_key: Option<String>,
}

pub async fn upsert_machine(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<UpsertMachineRequest>,
) -> Json<Value> {
    let (machine, created) = state.store.upsert_machine(
        &req.id,
        &req.metadata,
        req.daemon_state,
        req.data_encryption_key,
    );
    if created {
        state.emit_update_with_seq(
            machine.seq,
            UpdateBody::NewMachine {
                machine: machine.clone(),
            },
            &RecipientFilter::MachineScoped(machine.id.clone()),
            None,
        );
    } else {
        state.emit_update(
            UpdateBody::UpdateMachine {
                machine_id: machine.id.clone(),
                metadata: Some(VersionedValue {
                    value: Some(machine.metadata.clone()),
                    version: machine.metadata_version,
                }),
                daemon_state: None,
            },
            &RecipientFilter::MachineScoped(machine.id.clone()),
            None,
        );
    }
    Json(json!({ "machine": machine }))
}

pub async fn list_machines(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    Json(json!({ "machines": state.store.list_machines() }))
}

pub async fn get_machine(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
) -> Json<Option<Machine>> {
    Json(state.store.get_machine(&id))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetadataRequest {
    pub metadata: String,
    pub expected_version: u64,
}

pub async fn update_machine_metadata(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateMetadataRequest>,
) -> Result<Json<Value>, StatusCode> {
    let outcome = state
        .store
        .update_machine_metadata(&id, &req.metadata, req.expected_version);
    match outcome {
        WriteOutcome::Success { version, value } => {
            state.emit_update(
                UpdateBody::UpdateMachine {
                    machine_id: id.clone(),
                    metadata: Some(VersionedValue {
                        value: value.clone(),
                        version,
                    }),
                    daemon_state: None,
                },
                &RecipientFilter::MachineScoped(id),
                None,
            );
            Ok(Json(json!({
                "result": "success",
                "version": version,
                "metadata": value,
            })))
        }
        WriteOutcome::VersionMismatch { version, value } => Ok(Json(json!({
            "result": "version-mismatch",
            "version": version,
            "metadata": value,
        }))),
        WriteOutcome::NotFound => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDaemonStateRequest {
    pub daemon_state: Option<String>,
    pub expected_version: u64,
}

pub async fn update_machine_daemon_state(
    State(state): State<Arc<DaemonState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateDaemonStateRequest>,
) -> Result<Json<Value>, StatusCode> {
    let outcome =
        state
            .store
            .update_machine_daemon_state(&id, req.daemon_state, req.expected_version);
    match outcome {
        WriteOutcome::Success { version, value } => {
            state.emit_update(
                UpdateBody::UpdateMachine {
                    machine_id: id.clone(),
                    metadata: None,
                    daemon_state: Some(VersionedValue {
                        value: value.clone(),
                        version,
                    }),
                },
                &RecipientFilter::MachineScoped(id),
                None,
            );
            Ok(Json(json!({
                "result": "success",
                "version": version,
                "daemonState": value,
            })))
        }
        WriteOutcome::VersionMismatch { version, value } => Ok(Json(json!({
            "result": "version-mismatch",
            "version": version,
            "daemonState": value,
        }))),
        WriteOutcome::NotFound => Err(StatusCode::NOT_FOUND),
    }
}

/// Artifact HTTP routes are stubbed in P2P mode; the WebSocket surface is the
/// real one.
pub async fn artifacts_unsupported() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "result": "error",
            "message": "artifacts are served over the websocket in p2p mode",
        })),
    )
}
