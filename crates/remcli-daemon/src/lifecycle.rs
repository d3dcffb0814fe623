//! Daemon startup, heartbeat, self-upgrade and shutdown orchestration.
//!
//! Exactly one daemon owns the lock file at a time. A new invocation first
//! settles the fate of any previous generation: same version and alive means
//! nothing to do; a version mismatch means the old daemon is told to stop
//! and this one takes over.

use crate::config::{Args, Config};
use crate::control;
use crate::daemon::{DaemonState, ShutdownController, load_or_create_machine_id};
use crate::inhibit::SleepInhibitor;
use crate::machine_client;
use crate::public;
use crate::qr;
use crate::router::RecipientFilter;
use crate::statefile::{
    LockFile, delete_state_file, read_state_file, write_state_file,
};
use crate::supervisor::Supervisor;
use crate::tmux::Tmux;
use crate::tunnel::Tunnel;
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use remcli_protocol::{StateFile, UpdateBody, now_ms, paths};
use remcli_store::{SnapshotWriter, load_snapshot};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const STOP_PREVIOUS_BUDGET: Duration = Duration::from_secs(5);
const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(1);

pub async fn run(args: Args) -> Result<i32> {
    let config = Config::load(&args)?;
    paths::ensure_dir(&paths::daemon_dir(&config.root))?;

    let state_path = paths::state_file_path(&config.root);
    let lock_path = paths::lock_file_path(&config.root);

    match assess_previous(read_state_file(&state_path), &config.cli_version) {
        Assessment::RunningSameVersion { pid } => {
            info!(pid, version = %config.cli_version, "daemon already running, nothing to do");
            return Ok(0);
        }
        Assessment::VersionMismatch { pid, http_port } => {
            info!(pid, "previous daemon generation runs another version, stopping it");
            stop_previous(pid, http_port).await;
            LockFile::remove_stale(&lock_path);
            delete_state_file(&state_path);
        }
        Assessment::StaleFiles => {
            debug!("previous daemon left stale files behind");
            LockFile::remove_stale(&lock_path);
            delete_state_file(&state_path);
        }
        Assessment::NoDaemon => {}
    }

    let lock = match LockFile::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(err) => {
            // Double-daemon safety: somebody else won; leave their state alone.
            info!(%err, "could not acquire the daemon lock, exiting");
            return Ok(0);
        }
    };

    Tmux::ensure_available()?;
    let tmux = Tmux::new(config.tmux_session());
    // Windows surviving from an earlier generation are orphans by definition.
    tmux.kill_session().await;

    let secret = remcli_auth::generate_secret();
    let machine_id = load_or_create_machine_id(&config.root)?;
    let snapshot_path = paths::snapshot_path(&config.root);
    let store = Arc::new(load_snapshot(&snapshot_path));
    let supervisor = Arc::new(Supervisor::new(
        tmux.clone(),
        config.cli_bin.clone(),
        paths::credentials_root(&config.root),
    ));
    let shutdown = ShutdownController::new();
    let state = DaemonState::new(
        config.clone(),
        secret,
        machine_id,
        Arc::clone(&store),
        supervisor,
        shutdown.clone(),
    );

    // Loopback control plane on an OS-assigned port.
    let control_listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("failed to bind control plane")?;
    let http_port = control_listener.local_addr()?.port();
    spawn_server(control_listener, control::router(Arc::clone(&state)), &shutdown);

    // Public plane for LAN (or tunnel) clients.
    let public_listener = tokio::net::TcpListener::bind("0.0.0.0:0")
        .await
        .context("failed to bind public plane")?;
    let p2p_port = public_listener.local_addr()?.port();
    spawn_server(public_listener, public::router(Arc::clone(&state)), &shutdown);

    let p2p_host = detect_lan_host();

    let tunnel = if config.tunnel {
        Tunnel::start(p2p_port).await.unwrap_or_else(|err| {
            warn!(%err, "tunnel startup failed, staying on LAN");
            None
        })
    } else {
        None
    };
    let tunnel_url = tunnel.as_ref().map(|t| t.url.clone());

    let log_path = paths::log_path(&config.root);
    write_state_file(
        &state_path,
        &StateFile {
            pid: std::process::id(),
            http_port,
            p2p_port,
            p2p_host: p2p_host.clone(),
            p2p_shared_secret: remcli_auth::encode_secret(&state.secret),
            tunnel_url: tunnel_url.clone(),
            start_time: now_ms(),
            started_with_cli_version: config.cli_version.clone(),
            last_heartbeat: None,
            log_path: log_path.display().to_string(),
        },
    )?;

    // Record this workstation as a machine so clients can list and target it.
    let metadata = machine_metadata(&config, &p2p_host);
    let (machine, created) = state.store.upsert_machine(&state.machine_id, &metadata, None, None);
    if created {
        state.emit_update_with_seq(
            machine.seq,
            UpdateBody::NewMachine {
                machine: machine.clone(),
            },
            &RecipientFilter::MachineScoped(machine.id.clone()),
            None,
        );
    }

    let snapshot_task = tokio::spawn(
        SnapshotWriter::new(Arc::clone(&store), snapshot_path).run(shutdown.token()),
    );
    tokio::spawn(machine_client::run(
        Arc::clone(&state),
        p2p_port,
        shutdown.token(),
    ));
    tokio::spawn(heartbeat(Arc::clone(&state), state_path.clone()));
    spawn_signal_handler(&shutdown);

    let inhibitor = SleepInhibitor::start(config.inhibit_sleep);

    let endpoint = match &tunnel_url {
        Some(url) => qr::Endpoint::Tunnel { url: url.clone() },
        None => qr::Endpoint::Lan {
            host: p2p_host.clone(),
            port: p2p_port,
        },
    };
    let connect_url = qr::connect_url(&endpoint, &state.secret);
    if config.show_qr {
        qr::display(&connect_url);
    } else {
        info!(url = %connect_url, "connect url");
    }
    info!(
        http_port,
        p2p_port,
        host = %p2p_host,
        version = %config.cli_version,
        experimental = config.experimental,
        "daemon running"
    );

    shutdown.token().cancelled().await;

    // Orderly teardown, with a watchdog that forces exit 1 if it stalls.
    std::thread::spawn(|| {
        std::thread::sleep(SHUTDOWN_WATCHDOG);
        eprintln!("shutdown stalled, forcing exit");
        std::process::exit(1);
    });

    state.supervisor.terminate_all().await;
    tmux.kill_session().await;
    if let Some(tunnel) = tunnel {
        tunnel.stop().await;
    }
    inhibitor.stop().await;
    // The snapshot writer flushes once more on cancellation.
    let _ = snapshot_task.await;
    delete_state_file(&state_path);
    lock.release();

    info!("daemon stopped");
    Ok(if shutdown.is_fatal() { 1 } else { 0 })
}

fn spawn_server(
    listener: tokio::net::TcpListener,
    app: axum::Router,
    shutdown: &ShutdownController,
) {
    let token = shutdown.token();
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(err) = result {
            warn!(%err, "http server exited with error");
        }
    });
}

fn spawn_signal_handler(shutdown: &ShutdownController) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(err) => {
                    warn!(%err, "failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.request("SIGINT");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => shutdown.request("SIGINT"),
                _ = sigterm.recv() => shutdown.request("SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            shutdown.request("SIGINT");
        }
    });
}

/// What to do about a previously recorded daemon.
#[derive(Debug, PartialEq, Eq)]
enum Assessment {
    NoDaemon,
    RunningSameVersion { pid: u32 },
    VersionMismatch { pid: u32, http_port: u16 },
    StaleFiles,
}

fn assess_previous(previous: Option<StateFile>, compiled_version: &str) -> Assessment {
    let Some(previous) = previous else {
        return Assessment::NoDaemon;
    };
    if !process_alive(previous.pid) {
        return Assessment::StaleFiles;
    }
    if previous.started_with_cli_version == compiled_version {
        Assessment::RunningSameVersion { pid: previous.pid }
    } else {
        Assessment::VersionMismatch {
            pid: previous.pid,
            http_port: previous.http_port,
        }
    }
}

/// Ask the old daemon to stop over its control plane, then escalate to
/// SIGTERM if it lingers.
async fn stop_previous(pid: u32, http_port: u16) {
    let url = format!("http://127.0.0.1:{http_port}/stop");
    let client = reqwest::Client::new();
    let posted = tokio::time::timeout(STOP_PREVIOUS_BUDGET, client.post(&url).send()).await;
    if let Ok(Ok(_)) = posted {
        for _ in 0..25 {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
    debug!(pid, "previous daemon still alive, sending SIGTERM");
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    for _ in 0..25 {
        if !process_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    warn!(pid, "previous daemon did not exit, continuing anyway");
}

/// Heartbeat loop: prune children, watch for an on-disk upgrade, verify
/// state-file ownership, and stamp the heartbeat. Ticks never overlap.
async fn heartbeat(state: Arc<DaemonState>, state_path: PathBuf) {
    let token = state.shutdown.token();
    let mut interval = tokio::time::interval(state.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = interval.tick() => {}
        }

        let dead = state.supervisor.prune();
        if !dead.is_empty() {
            debug!(?dead, "pruned exited children");
        }

        if let Some(disk_version) = read_disk_version(&state.config.cli_bin)
            && disk_version != state.config.cli_version
        {
            info!(
                compiled = %state.config.cli_version,
                on_disk = %disk_version,
                "newer package on disk, handing over to a fresh daemon"
            );
            spawn_replacement(&state.config.cli_bin);
            // The replacement reads our state file, stops us, and takes the
            // lock. Park here until that happens.
            std::future::pending::<()>().await;
        }

        match read_state_file(&state_path) {
            Some(current) if current.pid == std::process::id() => {
                let mut current = current;
                current.last_heartbeat = Some(now_ms());
                if let Err(err) = write_state_file(&state_path, &current) {
                    warn!(%err, "failed to stamp heartbeat");
                }
            }
            _ => {
                state
                    .shutdown
                    .request_fatal("state file no longer names this daemon");
                return;
            }
        }
    }
}

/// Disk-side version marker: a `VERSION` file the installer writes beside
/// the CLI binary. Absent file means upgrades cannot be observed here.
fn read_disk_version(cli_bin: &str) -> Option<String> {
    let version_file = Path::new(cli_bin).parent()?.join("VERSION");
    let version = std::fs::read_to_string(version_file).ok()?;
    let version = version.trim();
    (!version.is_empty()).then(|| version.to_string())
}

/// Start a fresh `remcli daemon start`, fully detached from this process.
fn spawn_replacement(cli_bin: &str) {
    let mut cmd = std::process::Command::new(cli_bin);
    cmd.args(["daemon", "start"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    match cmd.spawn() {
        Ok(child) => info!(pid = child.id(), "replacement daemon spawned"),
        Err(err) => warn!(%err, "failed to spawn replacement daemon"),
    }
}

/// Best-effort LAN address for the QR code: the interface the default route
/// would use. No packets are sent.
fn detect_lan_host() -> String {
    std::net::UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

/// Opaque machine metadata blob. The daemon is its own client here, so the
/// payload is plain JSON under the usual base64 wrapping.
fn machine_metadata(config: &Config, host: &str) -> String {
    let metadata = serde_json::json!({
        "host": host,
        "platform": std::env::consts::OS,
        "version": config.cli_version,
    });
    STANDARD.encode(metadata.to_string())
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::DaemonState;
    use crate::supervisor::Supervisor;
    use remcli_store::Store;

    fn state_file(pid: u32, version: &str) -> StateFile {
        StateFile {
            pid,
            http_port: 4100,
            p2p_port: 4200,
            p2p_host: "192.168.1.4".into(),
            p2p_shared_secret: "c2VjcmV0".into(),
            tunnel_url: None,
            start_time: 1,
            started_with_cli_version: version.into(),
            last_heartbeat: None,
            log_path: "/tmp/daemon.log".into(),
        }
    }

    #[test]
    fn assess_previous_covers_the_handoff_matrix() {
        assert_eq!(assess_previous(None, "1.1.0"), Assessment::NoDaemon);

        let own_pid = std::process::id();
        assert_eq!(
            assess_previous(Some(state_file(own_pid, "1.1.0")), "1.1.0"),
            Assessment::RunningSameVersion { pid: own_pid }
        );
        assert_eq!(
            assess_previous(Some(state_file(own_pid, "1.0.0")), "1.1.0"),
            Assessment::VersionMismatch {
                pid: own_pid,
                http_port: 4100
            }
        );
        // A dead pid means leftovers, whatever the recorded version says.
        assert_eq!(
            assess_previous(Some(state_file(1_999_999_997, "1.1.0")), "1.1.0"),
            Assessment::StaleFiles
        );
    }

    #[test]
    fn disk_version_reads_the_installer_marker() {
        let dir = tempfile::tempdir().unwrap();
        let cli = dir.path().join("remcli");
        std::fs::write(&cli, b"#!/bin/sh\n").unwrap();

        assert_eq!(read_disk_version(cli.to_str().unwrap()), None);

        std::fs::write(dir.path().join("VERSION"), "1.1.0\n").unwrap();
        assert_eq!(
            read_disk_version(cli.to_str().unwrap()),
            Some("1.1.0".to_string())
        );

        std::fs::write(dir.path().join("VERSION"), "  \n").unwrap();
        assert_eq!(read_disk_version(cli.to_str().unwrap()), None);
    }

    #[test]
    fn lan_host_detection_always_yields_an_address() {
        let host = detect_lan_host();
        assert!(!host.is_empty());
        assert!(host.parse::<std::net::IpAddr>().is_ok());
    }

    fn test_state(root: &Path, heartbeat: Duration) -> Arc<DaemonState> {
        let args = Args {
            state_dir: Some(root.to_path_buf()),
            ..Default::default()
        };
        let mut config = Config::load(&args).unwrap();
        config.heartbeat_interval = heartbeat;
        let supervisor = Arc::new(Supervisor::new(
            Tmux::new("remcli-test"),
            "remcli".to_string(),
            root.join("credentials"),
        ));
        DaemonState::new(
            config,
            remcli_auth::generate_secret(),
            "machine-test".to_string(),
            Arc::new(Store::new()),
            supervisor,
            ShutdownController::new(),
        )
    }

    #[tokio::test]
    async fn heartbeat_stamps_the_state_file_it_owns() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), Duration::from_millis(20));
        let state_path = root.path().join("daemon.state.json");
        write_state_file(&state_path, &state_file(std::process::id(), "1.0.0")).unwrap();

        let task = tokio::spawn(heartbeat(Arc::clone(&state), state_path.clone()));
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if read_state_file(&state_path)
                .and_then(|s| s.last_heartbeat)
                .is_some()
            {
                break;
            }
        }
        let stamped = read_state_file(&state_path).unwrap();
        assert!(stamped.last_heartbeat.is_some());
        assert!(!state.shutdown.token().is_cancelled());

        state.shutdown.request("test done");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn heartbeat_treats_lost_ownership_as_fatal() {
        let root = tempfile::tempdir().unwrap();
        let state = test_state(root.path(), Duration::from_millis(20));
        let state_path = root.path().join("daemon.state.json");
        // Another daemon's pid in the state file means we lost ownership.
        write_state_file(&state_path, &state_file(std::process::id() + 1, "1.0.0")).unwrap();

        let task = tokio::spawn(heartbeat(Arc::clone(&state), state_path));
        tokio::time::timeout(Duration::from_secs(2), state.shutdown.token().cancelled())
            .await
            .expect("heartbeat should request shutdown");
        assert!(state.shutdown.is_fatal());
        task.await.unwrap();
    }

    #[test]
    fn machine_metadata_is_opaque_base64() {
        let args = Args {
            state_dir: Some(std::path::PathBuf::from("/tmp/remcli-test")),
            ..Default::default()
        };
        let config = Config::load(&args).unwrap();
        let blob = machine_metadata(&config, "192.168.1.4");
        let decoded = STANDARD.decode(blob).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["host"], "192.168.1.4");
    }
}
