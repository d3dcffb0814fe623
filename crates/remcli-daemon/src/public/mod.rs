//! The external surface: bearer-authenticated HTTP under `/v1` and `/v2`, a
//! WebSocket endpoint with its own handshake auth, and the static web app
//! bundle with single-page-app fallback.

mod handlers;
mod http;
mod ws;

use crate::daemon::DaemonState;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};

pub fn router(state: Arc<DaemonState>) -> Router {
    let api = Router::new()
        .route(
            "/v1/sessions",
            post(http::create_session).get(http::list_sessions),
        )
        .route(
            "/v1/sessions/{id}",
            get(http::get_session).delete(http::delete_session),
        )
        .route("/v1/sessions/{id}/messages", get(http::list_messages))
        .route("/v2/sessions", get(http::sessions_page))
        .route("/v2/sessions/active", get(http::active_sessions))
        .route(
            "/v1/machines",
            get(http::list_machines).post(http::upsert_machine),
        )
        .route("/v1/machines/{id}", get(http::get_machine))
        .route(
            "/v1/machines/{id}/metadata",
            post(http::update_machine_metadata),
        )
        .route(
            "/v1/machines/{id}/daemon-state",
            post(http::update_machine_daemon_state),
        )
        // Intentional stubs: artifacts ride the WebSocket in P2P mode.
        .route(
            "/v1/artifacts",
            get(http::artifacts_unsupported).post(http::artifacts_unsupported),
        )
        .route(
            "/v1/artifacts/{id}",
            get(http::artifacts_unsupported)
                .post(http::artifacts_unsupported)
                .delete(http::artifacts_unsupported),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            require_bearer,
        ));

    Router::new()
        .merge(api)
        .route(remcli_protocol::WS_PATH, get(ws::ws_handler))
        .route("/health", get(health))
        .fallback(static_fallback)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health(State(state): State<Arc<DaemonState>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": state.config.cli_version }))
}

/// Bearer check for the JSON API. The WebSocket route performs its own
/// handshake-time verification instead.
async fn require_bearer(
    State(state): State<Arc<DaemonState>>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| remcli_auth::verify_token(token, &state.secret))
        .unwrap_or(false);

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "result": "error", "message": "unauthorized" })),
        )
            .into_response();
    }
    next.run(req).await
}

/// Serve the precompiled web bundle with an `index.html` fallback for SPA
/// routes. API namespaces are excluded so unknown API paths stay 404s.
async fn static_fallback(State(state): State<Arc<DaemonState>>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path.starts_with("/v1/") || path.starts_with("/v2/") || path == "/v1" || path == "/v2" {
        return StatusCode::NOT_FOUND.into_response();
    }

    let web_dir = state.config.web_dir.clone();
    let service = ServeDir::new(&web_dir).fallback(ServeFile::new(web_dir.join("index.html")));
    match service.oneshot(req).await {
        Ok(response) => response.into_response(),
        Err(infallible) => match infallible {},
    }
}
