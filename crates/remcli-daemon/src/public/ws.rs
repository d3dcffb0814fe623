//! WebSocket endpoint: handshake auth, per-connection fan-in/fan-out, and
//! teardown that atomically drops the router registration and any RPC state
//! the connection owned.

use crate::daemon::DaemonState;
use crate::public::handlers;
use crate::router::{ConnectionScope, RecipientFilter};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, Stream, StreamExt};
use remcli_protocol::{AuthHandshake, ClientFrame, ClientType, EphemeralEvent, ServerFrame};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<DaemonState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<DaemonState>) {
    let (mut sink, mut stream) = socket.split();

    let scope = match authenticate(&state, &mut stream).await {
        Ok(scope) => scope,
        Err(message) => {
            let frame = ServerFrame::AuthResult {
                result: "error".to_string(),
                message: Some(message),
            };
            let _ = sink.send(text_frame(&frame)).await;
            let _ = sink.close().await;
            return;
        }
    };

    let ok = ServerFrame::AuthResult {
        result: "ok".to_string(),
        message: None,
    };
    if sink.send(text_frame(&ok)).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let conn_id = state.router.attach(scope.clone(), tx);
    debug!(conn_id, ?scope, "websocket client attached");

    if let ConnectionScope::Machine(machine_id) = &scope {
        state.store.set_machine_active(machine_id, true);
        state.emit_ephemeral(
            EphemeralEvent::MachineStatus {
                machine_id: machine_id.clone(),
                status: "online".to_string(),
            },
            &RecipientFilter::MachineScoped(machine_id.clone()),
            Some(conn_id),
        );
    }

    // Central write loop: everything addressed to this connection funnels
    // through the router's channel.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(text_frame(&frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                debug!(conn_id, %err, "websocket read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => handlers::handle_frame(&state, conn_id, &scope, frame).await,
                Err(err) => debug!(conn_id, %err, "ignoring unparsable client frame"),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Teardown: the router entry and all RPC state owned by this connection
    // go together.
    state.router.detach(conn_id);
    let released = state.rpc.disconnect(conn_id);
    if !released.is_empty() {
        debug!(conn_id, methods = ?released, "released rpc bindings on disconnect");
    }

    if let ConnectionScope::Machine(machine_id) = &scope {
        state.store.set_machine_active(machine_id, false);
        state.emit_ephemeral(
            EphemeralEvent::MachineStatus {
                machine_id: machine_id.clone(),
                status: "offline".to_string(),
            },
            &RecipientFilter::MachineScoped(machine_id.clone()),
            Some(conn_id),
        );
    }

    let _ = write_task.await;
    debug!(conn_id, "websocket client detached");
}

/// Wait for the `auth` object and resolve it to a connection scope.
async fn authenticate(
    state: &DaemonState,
    stream: &mut (impl Stream<Item = Result<Message, axum::Error>> + Unpin),
) -> Result<ConnectionScope, String> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => continue,
            }
        }
        None
    })
    .await
    .map_err(|_| "handshake timed out".to_string())?
    .ok_or_else(|| "connection closed during handshake".to_string())?;

    let handshake: AuthHandshake =
        serde_json::from_str(&first).map_err(|err| format!("invalid auth object: {err}"))?;

    if !remcli_auth::verify_token(&handshake.token, &state.secret) {
        return Err("invalid token".to_string());
    }

    match handshake.client_type {
        ClientType::UserScoped => Ok(ConnectionScope::User),
        ClientType::SessionScoped => handshake
            .session_id
            .map(ConnectionScope::Session)
            .ok_or_else(|| "session-scoped connection requires sessionId".to_string()),
        ClientType::MachineScoped => handshake
            .machine_id
            .map(ConnectionScope::Machine)
            .ok_or_else(|| "machine-scoped connection requires machineId".to_string()),
    }
}

fn text_frame(frame: &ServerFrame) -> Message {
    Message::text(serde_json::to_string(frame).expect("server frames serialise"))
}
