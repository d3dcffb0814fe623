//! Loopback-only control plane used by the CLI front end and child sessions.
//!
//! No authentication: binding to 127.0.0.1 on an OS-assigned port (recorded
//! in the state file) is the sole protection.

use crate::daemon::DaemonState;
use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use remcli_protocol::{
    SessionStartedReport, SpawnOutcome, SpawnSessionRequest, StopSessionRequest, TrackedChildInfo,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

pub fn router(state: Arc<DaemonState>) -> Router {
    Router::new()
        .route("/session-started", post(session_started))
        .route("/list", get(list_children))
        .route("/spawn-session", post(spawn_session))
        .route("/stop-session", post(stop_session))
        .route("/stop", post(stop_daemon))
        .with_state(state)
}

/// Child self-report: correlates the child's own PID with its tracked entry
/// and resolves any pending spawn request.
async fn session_started(
    State(state): State<Arc<DaemonState>>,
    Json(report): Json<SessionStartedReport>,
) -> Json<Value> {
    state.supervisor.on_child_report(&report);
    Json(json!({}))
}

async fn list_children(State(state): State<Arc<DaemonState>>) -> Json<Vec<TrackedChildInfo>> {
    Json(state.supervisor.list())
}

async fn spawn_session(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<SpawnSessionRequest>,
) -> Json<SpawnOutcome> {
    Json(state.supervisor.spawn(req).await)
}

async fn stop_session(
    State(state): State<Arc<DaemonState>>,
    Json(req): Json<StopSessionRequest>,
) -> Json<Value> {
    let stopped = state.supervisor.stop(&req.session_id).await;
    Json(json!({ "stopped": stopped }))
}

async fn stop_daemon(State(state): State<Arc<DaemonState>>) -> Json<Value> {
    info!("stop requested via control plane");
    state.shutdown.request("control plane stop");
    Json(json!({ "stopping": true }))
}
