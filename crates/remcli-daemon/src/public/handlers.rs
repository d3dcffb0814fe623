//! Per-frame dispatch for authenticated WebSocket clients.

use crate::daemon::DaemonState;
use crate::router::{ConnId, ConnectionScope, RecipientFilter};
use remcli_protocol::{
    ClientFrame, EphemeralEvent, MessageContent, ServerFrame, UpdateBody, VersionedValue, now_ms,
};
use remcli_store::WriteOutcome;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

/// Handle one client frame. Callback-bearing frames are answered with a
/// `result` frame echoing the client-chosen id.
pub async fn handle_frame(
    state: &Arc<DaemonState>,
    conn: ConnId,
    _scope: &ConnectionScope,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Ping { id } => reply(state, conn, id, json!({})),

        ClientFrame::Message {
            sid,
            message,
            local_id,
        } => {
            let appended =
                state
                    .store
                    .append_message(&sid, MessageContent::encrypted(message), local_id);
            match appended {
                Some(message) => state.emit_update(
                    UpdateBody::NewMessage {
                        session_id: sid.clone(),
                        message,
                    },
                    &RecipientFilter::SessionScoped(sid),
                    Some(conn),
                ),
                None => debug!(conn, %sid, "dropping message for unknown session"),
            }
        }

        ClientFrame::SessionAlive { sid, time, thinking } => {
            if state.store.set_session_active(&sid, true) {
                state.emit_ephemeral(
                    EphemeralEvent::Activity {
                        id: sid.clone(),
                        active: true,
                        active_at: time,
                        thinking: thinking.unwrap_or(false),
                    },
                    &RecipientFilter::SessionScoped(sid),
                    Some(conn),
                );
            }
        }

        ClientFrame::SessionEnd { sid, time } => {
            if state.store.set_session_active(&sid, false) {
                state.emit_ephemeral(
                    EphemeralEvent::Activity {
                        id: sid.clone(),
                        active: false,
                        active_at: time,
                        thinking: false,
                    },
                    &RecipientFilter::SessionScoped(sid),
                    Some(conn),
                );
            }
        }

        ClientFrame::UpdateMetadata {
            id,
            sid,
            metadata,
            expected_version,
        } => {
            let outcome = state
                .store
                .update_session_metadata(&sid, &metadata, expected_version);
            let payload = versioned_payload(&outcome, "metadata");
            if let WriteOutcome::Success { version, value } = outcome {
                state.emit_update(
                    UpdateBody::UpdateSession {
                        session_id: sid.clone(),
                        metadata: Some(VersionedValue { value, version }),
                        agent_state: None,
                    },
                    &RecipientFilter::SessionScoped(sid),
                    Some(conn),
                );
            }
            reply(state, conn, id, payload);
        }

        ClientFrame::UpdateState {
            id,
            sid,
            agent_state,
            expected_version,
        } => {
            let outcome =
                state
                    .store
                    .update_session_agent_state(&sid, agent_state, expected_version);
            let payload = versioned_payload(&outcome, "agentState");
            if let WriteOutcome::Success { version, value } = outcome {
                state.emit_update(
                    UpdateBody::UpdateSession {
                        session_id: sid.clone(),
                        metadata: None,
                        agent_state: Some(VersionedValue { value, version }),
                    },
                    &RecipientFilter::SessionScoped(sid),
                    Some(conn),
                );
            }
            reply(state, conn, id, payload);
        }

        ClientFrame::MachineAlive { machine_id, time } => {
            if state.store.set_machine_active(&machine_id, true) {
                state.emit_ephemeral(
                    EphemeralEvent::MachineActivity {
                        id: machine_id.clone(),
                        active: true,
                        active_at: time.unwrap_or_else(now_ms),
                    },
                    &RecipientFilter::MachineScoped(machine_id),
                    Some(conn),
                );
            }
        }

        ClientFrame::MachineUpdateMetadata {
            id,
            machine_id,
            metadata,
            expected_version,
        } => {
            let outcome =
                state
                    .store
                    .update_machine_metadata(&machine_id, &metadata, expected_version);
            let payload = versioned_payload(&outcome, "metadata");
            if let WriteOutcome::Success { version, value } = outcome {
                state.emit_update(
                    UpdateBody::UpdateMachine {
                        machine_id: machine_id.clone(),
                        metadata: Some(VersionedValue { value, version }),
                        daemon_state: None,
                    },
                    &RecipientFilter::MachineScoped(machine_id),
                    Some(conn),
                );
            }
            reply(state, conn, id, payload);
        }

        ClientFrame::MachineUpdateState {
            id,
            machine_id,
            daemon_state,
            expected_version,
        } => {
            let outcome = state.store.update_machine_daemon_state(
                &machine_id,
                daemon_state,
                expected_version,
            );
            let payload = versioned_payload(&outcome, "daemonState");
            if let WriteOutcome::Success { version, value } = outcome {
                state.emit_update(
                    UpdateBody::UpdateMachine {
                        machine_id: machine_id.clone(),
                        metadata: None,
                        daemon_state: Some(VersionedValue { value, version }),
                    },
                    &RecipientFilter::MachineScoped(machine_id),
                    Some(conn),
                );
            }
            reply(state, conn, id, payload);
        }

        ClientFrame::ArtifactCreate {
            id,
            artifact_id,
            header,
            body,
            data_encryption_key,
        } => {
            match state
                .store
                .create_artifact(&artifact_id, &header, &body, data_encryption_key)
            {
                Some(artifact) => {
                    state.emit_update_with_seq(
                        artifact.seq,
                        UpdateBody::NewArtifact {
                            artifact: artifact.clone(),
                        },
                        &RecipientFilter::UserScopedOnly,
                        Some(conn),
                    );
                    reply(
                        state,
                        conn,
                        id,
                        json!({ "result": "success", "artifact": artifact }),
                    );
                }
                None => reply(
                    state,
                    conn,
                    id,
                    json!({ "result": "error", "message": "artifact already exists" }),
                ),
            }
        }

        ClientFrame::ArtifactRead { id, artifact_id } => {
            let artifact = state.store.get_artifact(&artifact_id);
            reply(
                state,
                conn,
                id,
                json!({ "result": "success", "artifact": artifact }),
            );
        }

        ClientFrame::ArtifactUpdate {
            id,
            artifact_id,
            header,
            header_expected_version,
            body,
            body_expected_version,
        } => {
            let payload =
                update_artifact(state, conn, &artifact_id, header, header_expected_version, body, body_expected_version);
            reply(state, conn, id, payload);
        }

        ClientFrame::ArtifactDelete { id, artifact_id } => {
            let deleted = state.store.delete_artifact(&artifact_id);
            if deleted {
                state.emit_update(
                    UpdateBody::DeleteArtifact {
                        artifact_id: artifact_id.clone(),
                    },
                    &RecipientFilter::UserScopedOnly,
                    Some(conn),
                );
                reply(state, conn, id, json!({ "result": "success" }));
            } else {
                reply(
                    state,
                    conn,
                    id,
                    json!({ "result": "error", "message": "artifact not found" }),
                );
            }
        }

        ClientFrame::UsageReport {
            key,
            session_id,
            tokens,
            cost,
        } => {
            let filter = match &session_id {
                Some(sid) => RecipientFilter::SessionScoped(sid.clone()),
                None => RecipientFilter::UserScopedOnly,
            };
            state.emit_ephemeral(
                EphemeralEvent::Usage {
                    key,
                    session_id,
                    tokens,
                    cost,
                    timestamp: now_ms(),
                },
                &filter,
                Some(conn),
            );
        }

        ClientFrame::RpcRegister { id, method } => match state.rpc.register(&method, conn) {
            Ok(()) => {
                state
                    .router
                    .send_to(conn, ServerFrame::RpcRegistered { method });
                reply(state, conn, id, json!({ "ok": true }));
            }
            Err(err) => {
                state.router.send_to(
                    conn,
                    ServerFrame::RpcError {
                        method,
                        message: err.to_string(),
                    },
                );
                reply(state, conn, id, json!({ "ok": false, "error": err.to_string() }));
            }
        },

        ClientFrame::RpcUnregister { id, method } => match state.rpc.unregister(&method, conn) {
            Ok(()) => {
                state
                    .router
                    .send_to(conn, ServerFrame::RpcUnregistered { method });
                reply(state, conn, id, json!({ "ok": true }));
            }
            Err(err) => {
                state.router.send_to(
                    conn,
                    ServerFrame::RpcError {
                        method,
                        message: err.to_string(),
                    },
                );
                reply(state, conn, id, json!({ "ok": false, "error": err.to_string() }));
            }
        },

        ClientFrame::RpcCall { id, method, params } => {
            // The forward blocks on the owner's ack (30 s budget); run it off
            // the read loop so the caller can keep sending frames meanwhile.
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let payload = match state.rpc.call(&method, params).await {
                    Ok(result) => json!({ "ok": true, "result": result }),
                    Err(err) => json!({ "ok": false, "error": err.to_string() }),
                };
                state
                    .router
                    .send_to(conn, ServerFrame::Result { id, payload });
            });
        }

        ClientFrame::RpcResponse { id, result } => {
            state.rpc.handle_response(conn, id, result);
        }
    }
}

fn update_artifact(
    state: &Arc<DaemonState>,
    conn: ConnId,
    artifact_id: &str,
    header: Option<String>,
    header_expected_version: Option<u64>,
    body: Option<String>,
    body_expected_version: Option<u64>,
) -> Value {
    let mut header_result: Option<VersionedValue> = None;
    let mut body_result: Option<VersionedValue> = None;
    let mut mismatch: Option<Value> = None;

    if let (Some(value), Some(expected)) = (header, header_expected_version) {
        match state.store.update_artifact_header(artifact_id, &value, expected) {
            WriteOutcome::Success { version, value } => {
                header_result = Some(VersionedValue { value, version });
            }
            WriteOutcome::VersionMismatch { version, value } => {
                mismatch = Some(json!({
                    "result": "version-mismatch",
                    "field": "header",
                    "version": version,
                    "header": value,
                }));
            }
            WriteOutcome::NotFound => {
                return json!({ "result": "error", "message": "artifact not found" });
            }
        }
    }

    if mismatch.is_none()
        && let (Some(value), Some(expected)) = (body, body_expected_version)
    {
        match state.store.update_artifact_body(artifact_id, &value, expected) {
            WriteOutcome::Success { version, value } => {
                body_result = Some(VersionedValue { value, version });
            }
            WriteOutcome::VersionMismatch { version, value } => {
                mismatch = Some(json!({
                    "result": "version-mismatch",
                    "field": "body",
                    "version": version,
                    "body": value,
                }));
            }
            WriteOutcome::NotFound => {
                return json!({ "result": "error", "message": "artifact not found" });
            }
        }
    }

    if header_result.is_some() || body_result.is_some() {
        state.emit_update(
            UpdateBody::UpdateArtifact {
                artifact_id: artifact_id.to_string(),
                header: header_result.clone(),
                body: body_result.clone(),
            },
            &RecipientFilter::UserScopedOnly,
            Some(conn),
        );
    }

    match mismatch {
        Some(mismatch) => mismatch,
        None => json!({
            "result": "success",
            "header": header_result,
            "body": body_result,
        }),
    }
}

fn versioned_payload(outcome: &WriteOutcome, field: &str) -> Value {
    let (result, version, value) = match outcome {
        WriteOutcome::Success { version, value } => ("success", version, value),
        WriteOutcome::VersionMismatch { version, value } => ("version-mismatch", version, value),
        WriteOutcome::NotFound => {
            return json!({ "result": "error", "message": "not found" });
        }
    };
    let mut payload = serde_json::Map::new();
    payload.insert("result".to_string(), json!(result));
    payload.insert("version".to_string(), json!(version));
    payload.insert(field.to_string(), json!(value));
    Value::Object(payload)
}

/// Answer a callback-bearing frame.
fn reply(state: &Arc<DaemonState>, conn: ConnId, id: Option<u64>, payload: Value) {
    if let Some(id) = id {
        state.router.send_to(conn, ServerFrame::Result { id, payload });
    }
}
