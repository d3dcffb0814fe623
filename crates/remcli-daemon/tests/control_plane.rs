//! Tests for the loopback control plane.

use remcli_daemon::config::{Args, Config};
use remcli_daemon::control;
use remcli_daemon::daemon::{DaemonState, ShutdownController};
use remcli_daemon::supervisor::Supervisor;
use remcli_daemon::tmux::Tmux;
use remcli_store::Store;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

struct ControlPlane {
    state: Arc<DaemonState>,
    port: u16,
    _root: tempfile::TempDir,
}

async fn start_control_plane() -> ControlPlane {
    let root = tempfile::tempdir().unwrap();
    let args = Args {
        state_dir: Some(root.path().to_path_buf()),
        ..Default::default()
    };
    let config = Config::load(&args).unwrap();
    let supervisor = Arc::new(Supervisor::new(
        Tmux::new("remcli-test"),
        "remcli".to_string(),
        root.path().join("credentials"),
    ));
    let state = DaemonState::new(
        config,
        remcli_auth::generate_secret(),
        "machine-test".to_string(),
        Arc::new(Store::new()),
        supervisor,
        ShutdownController::new(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let app = control::router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    for _ in 0..50 {
        if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    ControlPlane {
        state,
        port,
        _root: root,
    }
}

fn url(plane: &ControlPlane, path: &str) -> String {
    format!("http://127.0.0.1:{}{path}", plane.port)
}

#[tokio::test]
async fn webhook_registers_external_children() {
    let plane = start_control_plane().await;
    let client = reqwest::Client::new();

    // A child the daemon never spawned reports itself.
    let response = client
        .post(url(&plane, "/session-started"))
        .json(&json!({
            "sessionId": "S1",
            "metadata": { "hostPid": 1_999_999_990u32, "agent": "claude" },
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let listed: Value = client
        .get(url(&plane, "/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let children = listed.as_array().unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["pid"], 1_999_999_990u32);
    assert_eq!(children[0]["startedBy"], "external");
    assert_eq!(children[0]["sessionId"], "S1");

    // Stop by session id removes the tracked entry.
    let stopped: Value = client
        .post(url(&plane, "/stop-session"))
        .json(&json!({ "sessionId": "S1" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stopped["stopped"], true);

    let listed: Value = client
        .get(url(&plane, "/list"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.as_array().unwrap().is_empty());

    // Stopping something unknown is a clean false.
    let missing: Value = client
        .post(url(&plane, "/stop-session"))
        .json(&json!({ "sessionId": "nope" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(missing["stopped"], false);
}

#[tokio::test]
async fn spawn_without_approval_asks_for_directory_creation() {
    let plane = start_control_plane().await;
    let client = reqwest::Client::new();
    let missing_dir = plane._root.path().join("workspaces/new-project");

    let outcome: Value = client
        .post(url(&plane, "/spawn-session"))
        .json(&json!({
            "directory": missing_dir.display().to_string(),
            "agent": "claude",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(outcome["type"], "needsDirectoryApproval");
    assert_eq!(outcome["directory"], missing_dir.display().to_string());
    assert!(!missing_dir.exists());
}

#[tokio::test]
async fn stop_endpoint_requests_shutdown() {
    let plane = start_control_plane().await;
    let client = reqwest::Client::new();

    let response: Value = client
        .post(url(&plane, "/stop"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["stopping"], true);
    assert!(plane.state.shutdown.token().is_cancelled());
    assert!(!plane.state.shutdown.is_fatal());
}
