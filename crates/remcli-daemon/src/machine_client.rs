//! The daemon's own machine-scoped client.
//!
//! Connects to the daemon's public WebSocket like any other client and
//! registers the machine RPC methods, so calls from mobile clients are
//! forwarded through the same registry path they would take to any handler.

use crate::daemon::DaemonState;
use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, Stream, StreamExt};
use remcli_protocol::{
    AuthHandshake, ClientFrame, ClientType, ServerFrame, SpawnSessionRequest, WS_PATH,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

const METHODS: &[&str] = &[
    "spawn-remcli-session",
    "stop-session",
    "stop-daemon",
    "read-file",
    "write-file",
    "list-directory",
    "exec-command",
];

/// Keep the machine client connected until shutdown.
pub async fn run(state: Arc<DaemonState>, port: u16, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = connect_once(&state, port, &cancel) => {
                match result {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(%err, "machine client connection lost, reconnecting");
                    }
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// One connection lifetime. Returns `Ok(())` only on requested shutdown.
async fn connect_once(
    state: &Arc<DaemonState>,
    port: u16,
    cancel: &CancellationToken,
) -> Result<()> {
    let url = format!("ws://127.0.0.1:{port}{WS_PATH}");
    let (socket, _) = connect_async(&url)
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    let (mut sink, mut stream) = socket.split();

    let handshake = AuthHandshake {
        token: state.bearer.clone(),
        client_type: ClientType::MachineScoped,
        session_id: None,
        machine_id: Some(state.machine_id.clone()),
    };
    sink.send(Message::text(serde_json::to_string(&handshake)?))
        .await?;

    match read_server_frame(&mut stream).await? {
        ServerFrame::AuthResult { result, message } if result == "ok" => {
            debug!("machine client authenticated");
            let _ = message;
        }
        ServerFrame::AuthResult { message, .. } => {
            bail!("machine client rejected: {}", message.unwrap_or_default());
        }
        other => bail!("unexpected frame during handshake: {other:?}"),
    }

    for (index, method) in METHODS.iter().enumerate() {
        let frame = ClientFrame::RpcRegister {
            id: Some(index as u64 + 1),
            method: method.to_string(),
        };
        sink.send(Message::text(serde_json::to_string(&frame)?))
            .await?;
    }
    info!(methods = METHODS.len(), "machine rpc methods registered");

    // Handler tasks answer out of order; a channel funnels their responses
    // into the single writer.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return Ok(());
            }
            Some(frame) = out_rx.recv() => {
                sink.send(Message::text(serde_json::to_string(&frame)?)).await?;
            }
            msg = stream.next() => {
                let Some(msg) = msg else {
                    bail!("server closed the machine connection");
                };
                let msg = msg.context("machine connection read error")?;
                let Message::Text(text) = msg else { continue };
                let frame: ServerFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(%err, "machine client ignoring unparsable frame");
                        continue;
                    }
                };
                if let ServerFrame::RpcRequest { id, method, params } = frame {
                    let state = Arc::clone(state);
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let result = dispatch(&state, &method, params).await;
                        let _ = out_tx.send(ClientFrame::RpcResponse { id, result });
                    });
                }
            }
        }
    }
}

async fn read_server_frame(
    stream: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Result<ServerFrame> {
    while let Some(msg) = stream.next().await {
        if let Message::Text(text) = msg? {
            return serde_json::from_str(&text).context("unparsable server frame");
        }
    }
    bail!("connection closed before a frame arrived")
}

/// Serve one forwarded RPC. Errors come back as `{success:false, error}` so
/// the remote caller always gets a resolution.
async fn dispatch(state: &Arc<DaemonState>, method: &str, params: Value) -> Value {
    match method {
        "spawn-remcli-session" => match serde_json::from_value::<SpawnSessionRequest>(params) {
            Ok(req) => serde_json::to_value(state.supervisor.spawn(req).await)
                .unwrap_or_else(|err| error_value(&err.to_string())),
            Err(err) => json!({
                "type": "error",
                "errorMessage": format!("invalid spawn request: {err}"),
            }),
        },
        "stop-session" => {
            let session_id = params
                .get("sessionId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let stopped = state.supervisor.stop(&session_id).await;
            json!({ "success": stopped })
        }
        "stop-daemon" => {
            state.shutdown.request("stop-daemon rpc");
            json!({ "success": true })
        }
        "read-file" => read_file(params).await,
        "write-file" => write_file(params).await,
        "list-directory" => list_directory(params).await,
        "exec-command" => exec_command(params).await,
        other => error_value(&format!("unknown machine method: {other}")),
    }
}

async fn read_file(params: Value) -> Value {
    let Some(path) = params.get("path").and_then(Value::as_str) else {
        return error_value("path is required");
    };
    match tokio::fs::read(path).await {
        Ok(bytes) => json!({ "success": true, "contentBase64": STANDARD.encode(bytes) }),
        Err(err) => error_value(&err.to_string()),
    }
}

async fn write_file(params: Value) -> Value {
    let Some(path) = params.get("path").and_then(Value::as_str) else {
        return error_value("path is required");
    };
    let Some(content) = params.get("contentBase64").and_then(Value::as_str) else {
        return error_value("contentBase64 is required");
    };
    let bytes = match STANDARD.decode(content) {
        Ok(bytes) => bytes,
        Err(err) => return error_value(&format!("invalid base64: {err}")),
    };
    if params
        .get("createParents")
        .and_then(Value::as_bool)
        .unwrap_or(false)
        && let Some(parent) = std::path::Path::new(path).parent()
        && let Err(err) = tokio::fs::create_dir_all(parent).await
    {
        return error_value(&err.to_string());
    }
    match tokio::fs::write(path, bytes).await {
        Ok(()) => json!({ "success": true }),
        Err(err) => error_value(&err.to_string()),
    }
}

async fn list_directory(params: Value) -> Value {
    let Some(path) = params.get("path").and_then(Value::as_str) else {
        return error_value("path is required");
    };
    let mut read_dir = match tokio::fs::read_dir(path).await {
        Ok(read_dir) => read_dir,
        Err(err) => return error_value(&err.to_string()),
    };
    let mut entries = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let kind = match entry.file_type().await {
            Ok(file_type) if file_type.is_dir() => "dir",
            Ok(file_type) if file_type.is_symlink() => "symlink",
            _ => "file",
        };
        entries.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "kind": kind,
        }));
    }
    json!({ "success": true, "entries": entries })
}

async fn exec_command(params: Value) -> Value {
    let Some(command) = params.get("command").and_then(Value::as_str) else {
        return error_value("command is required");
    };
    let args: Vec<String> = params
        .get("args")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut cmd = tokio::process::Command::new(command);
    cmd.args(&args);
    if let Some(cwd) = params.get("cwd").and_then(Value::as_str) {
        cmd.current_dir(cwd);
    }
    match cmd.output().await {
        Ok(output) => json!({
            "success": true,
            "exitCode": output.status.code(),
            "stdout": String::from_utf8_lossy(&output.stdout),
            "stderr": String::from_utf8_lossy(&output.stderr),
        }),
        Err(err) => error_value(&err.to_string()),
    }
}

fn error_value(message: &str) -> Value {
    json!({ "success": false, "error": message })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_helpers_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/hello.txt");

        let written = write_file(json!({
            "path": path.display().to_string(),
            "contentBase64": STANDARD.encode(b"hi there"),
            "createParents": true,
        }))
        .await;
        assert_eq!(written["success"], true);

        let read = read_file(json!({ "path": path.display().to_string() })).await;
        assert_eq!(read["success"], true);
        let decoded = STANDARD
            .decode(read["contentBase64"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"hi there");

        let listing = list_directory(json!({ "path": dir.path().join("sub").display().to_string() })).await;
        assert_eq!(listing["success"], true);
        assert_eq!(listing["entries"][0]["name"], "hello.txt");
        assert_eq!(listing["entries"][0]["kind"], "file");
    }

    #[tokio::test]
    async fn helpers_report_missing_params() {
        assert_eq!(read_file(json!({})).await["success"], false);
        assert_eq!(write_file(json!({"path": "/tmp/x"})).await["success"], false);
        assert_eq!(list_directory(json!({})).await["success"], false);
        assert_eq!(exec_command(json!({})).await["success"], false);
    }

    #[tokio::test]
    async fn exec_command_captures_output() {
        let result = exec_command(json!({
            "command": "echo",
            "args": ["hello"],
        }))
        .await;
        assert_eq!(result["success"], true);
        assert_eq!(result["exitCode"], 0);
        assert_eq!(result["stdout"].as_str().unwrap().trim(), "hello");
    }
}
