//! Child agent process supervision.
//!
//! Children are spawned inside the daemon's tmux session and tracked by OS
//! PID. A freshly spawned child proves itself by posting the session-started
//! webhook to the control plane; the webhook's `hostPid` correlates back to
//! the tracked entry and resolves the pending spawn request.

use crate::tmux::Tmux;
use anyhow::{Result, bail};
use remcli_protocol::{
    SessionId, SessionStartedReport, SpawnOutcome, SpawnSessionRequest, StartedBy,
    TrackedChildInfo,
};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long a spawned child has to post its self-report webhook.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(15);

/// Auth variables that must never leave the daemon with an unexpanded
/// `${VAR}` reference still inside.
const KNOWN_AUTH_VARS: &[&str] = &[
    "CLAUDE_CONFIG_DIR",
    "REMCLI_AGENT_TOKEN",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
];

const DEFAULT_AGENT: &str = "claude";

#[derive(Debug, Clone)]
struct TrackedChild {
    pid: u32,
    started_by: StartedBy,
    session_id: Option<SessionId>,
    tmux_window: Option<String>,
    directory_created: bool,
}

impl TrackedChild {
    fn info(&self) -> TrackedChildInfo {
        TrackedChildInfo {
            pid: self.pid,
            started_by: self.started_by,
            session_id: self.session_id.clone(),
            tmux_window: self.tmux_window.clone(),
            directory_created: self.directory_created,
        }
    }
}

pub struct Supervisor {
    tmux: Tmux,
    cli_bin: String,
    credentials_root: PathBuf,
    children: Mutex<HashMap<u32, TrackedChild>>,
    awaiters: Mutex<HashMap<u32, oneshot::Sender<SessionId>>>,
}

impl Supervisor {
    pub fn new(tmux: Tmux, cli_bin: String, credentials_root: PathBuf) -> Self {
        Self {
            tmux,
            cli_bin,
            credentials_root,
            children: Mutex::new(HashMap::new()),
            awaiters: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn a child agent and wait for its self-report webhook.
    pub async fn spawn(&self, req: SpawnSessionRequest) -> SpawnOutcome {
        let dir = PathBuf::from(&req.directory);
        let mut directory_created = false;
        if !dir.is_dir() {
            if !req.approved_new_directory_creation {
                return SpawnOutcome::NeedsDirectoryApproval {
                    directory: req.directory,
                };
            }
            if let Err(err) = std::fs::create_dir_all(&dir) {
                return SpawnOutcome::Error {
                    error_message: format!("failed to create {}: {err}", dir.display()),
                };
            }
            directory_created = true;
        }

        let agent = req.agent.as_deref().unwrap_or(DEFAULT_AGENT);
        let env = match self.compose_env(req.environment.as_ref(), req.token.as_deref(), agent) {
            Ok(env) => env,
            Err(err) => {
                return SpawnOutcome::Error {
                    error_message: err.to_string(),
                };
            }
        };

        let command = vec![
            self.cli_bin.clone(),
            "--started-by".to_string(),
            "daemon".to_string(),
            "--remote-start".to_string(),
            "--agent".to_string(),
            agent.to_string(),
        ];
        let (window_id, pid) = match self.tmux.spawn_window(agent, &dir, &env, &command).await {
            Ok(spawned) => spawned,
            Err(err) => {
                return SpawnOutcome::Error {
                    error_message: err.to_string(),
                };
            }
        };
        info!(pid, window = %window_id, %agent, "spawned agent child");

        // Track before waiting. If the webhook already raced us, the entry is
        // authoritative for the session id and we only fill in our side.
        {
            let mut children = self.children.lock().expect("children lock poisoned");
            match children.entry(pid) {
                Entry::Occupied(mut entry) => {
                    let child = entry.get_mut();
                    child.started_by = StartedBy::Daemon;
                    child.tmux_window = Some(window_id.clone());
                    child.directory_created = directory_created;
                    if let Some(session_id) = child.session_id.clone() {
                        return SpawnOutcome::Success { session_id };
                    }
                }
                Entry::Vacant(entry) => {
                    entry.insert(TrackedChild {
                        pid,
                        started_by: StartedBy::Daemon,
                        session_id: None,
                        tmux_window: Some(window_id.clone()),
                        directory_created,
                    });
                }
            }
        }

        match self.await_child_report(pid).await {
            Some(session_id) => SpawnOutcome::Success { session_id },
            None => {
                let _ = self.tmux.kill_window(&window_id).await;
                SpawnOutcome::Error {
                    error_message: format!(
                        "spawned child (pid {pid}) did not report a session within {}s",
                        WEBHOOK_TIMEOUT.as_secs()
                    ),
                }
            }
        }
    }

    /// Park on the webhook for `pid`. On expiry the tracked entry is
    /// discarded so the state machine goes straight to exited.
    async fn await_child_report(&self, pid: u32) -> Option<SessionId> {
        let (tx, rx) = oneshot::channel();
        self.awaiters
            .lock()
            .expect("awaiters lock poisoned")
            .insert(pid, tx);

        match tokio::time::timeout(WEBHOOK_TIMEOUT, rx).await {
            Ok(Ok(session_id)) => Some(session_id),
            _ => {
                self.awaiters
                    .lock()
                    .expect("awaiters lock poisoned")
                    .remove(&pid);
                self.children
                    .lock()
                    .expect("children lock poisoned")
                    .remove(&pid);
                None
            }
        }
    }

    /// Child self-report webhook. An existing entry is enriched in place;
    /// `startedBy=daemon` is never downgraded. Unknown PIDs are adopted as
    /// externally started children.
    pub fn on_child_report(&self, report: &SessionStartedReport) {
        let pid = report.metadata.host_pid;
        let session_id = report.session_id.clone();
        {
            let mut children = self.children.lock().expect("children lock poisoned");
            match children.entry(pid) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().session_id = Some(session_id.clone());
                }
                Entry::Vacant(entry) => {
                    entry.insert(TrackedChild {
                        pid,
                        started_by: StartedBy::External,
                        session_id: Some(session_id.clone()),
                        tmux_window: None,
                        directory_created: false,
                    });
                }
            }
        }
        debug!(pid, session_id = %session_id, "child reported session start");

        if let Some(tx) = self
            .awaiters
            .lock()
            .expect("awaiters lock poisoned")
            .remove(&pid)
        {
            let _ = tx.send(session_id);
        }
    }

    /// Stop a child by session id, or by the `PID-<n>` fallback syntax.
    pub async fn stop(&self, session_ref: &str) -> bool {
        let target = {
            let children = self.children.lock().expect("children lock poisoned");
            children
                .values()
                .find(|child| child.session_id.as_deref() == Some(session_ref))
                .cloned()
                .or_else(|| {
                    parse_pid_fallback(session_ref)
                        .and_then(|pid| children.get(&pid).cloned())
                })
        };
        let Some(child) = target else {
            return false;
        };

        self.terminate(&child).await;
        self.children
            .lock()
            .expect("children lock poisoned")
            .remove(&child.pid);
        self.awaiters
            .lock()
            .expect("awaiters lock poisoned")
            .remove(&child.pid);
        true
    }

    async fn terminate(&self, child: &TrackedChild) {
        match (&child.tmux_window, child.started_by) {
            (Some(window), StartedBy::Daemon) => {
                if let Err(err) = self.tmux.kill_window(window).await {
                    debug!(pid = child.pid, %err, "kill-window failed, falling back to SIGTERM");
                    terminate_pid(child.pid);
                }
            }
            _ => terminate_pid(child.pid),
        }
    }

    /// Drop every tracked entry whose process has disappeared. Runs on each
    /// heartbeat tick.
    pub fn prune(&self) -> Vec<u32> {
        let mut children = self.children.lock().expect("children lock poisoned");
        let dead: Vec<u32> = children
            .keys()
            .filter(|pid| !process_alive(**pid))
            .copied()
            .collect();
        for pid in &dead {
            children.remove(pid);
            if self
                .awaiters
                .lock()
                .expect("awaiters lock poisoned")
                .remove(pid)
                .is_some()
            {
                warn!(pid, "child exited before reporting a session");
            }
        }
        dead
    }

    /// Terminate every tracked child. Part of daemon shutdown.
    pub async fn terminate_all(&self) {
        let children: Vec<TrackedChild> = {
            let mut map = self.children.lock().expect("children lock poisoned");
            map.drain().map(|(_, child)| child).collect()
        };
        for child in children {
            self.terminate(&child).await;
        }
        self.awaiters
            .lock()
            .expect("awaiters lock poisoned")
            .clear();
    }

    pub fn list(&self) -> Vec<TrackedChildInfo> {
        let mut out: Vec<TrackedChildInfo> = self
            .children
            .lock()
            .expect("children lock poisoned")
            .values()
            .map(TrackedChild::info)
            .collect();
        out.sort_by_key(|child| child.pid);
        out
    }

    pub fn session_for_pid(&self, pid: u32) -> Option<SessionId> {
        self.children
            .lock()
            .expect("children lock poisoned")
            .get(&pid)
            .and_then(|child| child.session_id.clone())
    }

    /// Build the environment overlay for a child. The base environment is
    /// inherited from the daemon through the multiplexer; the overlay holds
    /// profile variables (with `${VAR}` expansion against the daemon's
    /// environment) and, last, the auth variables so nothing can shadow them.
    fn compose_env(
        &self,
        profile: Option<&HashMap<String, String>>,
        token: Option<&str>,
        agent: &str,
    ) -> Result<HashMap<String, String>> {
        let process_env: HashMap<String, String> = std::env::vars().collect();
        let mut env = HashMap::new();

        if let Some(profile) = profile {
            for (key, value) in profile {
                env.insert(key.clone(), expand_vars(value, &process_env));
            }
        }

        if let Some(token) = token {
            if agent == "claude" {
                let dir = self.credentials_root.join(Uuid::new_v4().to_string());
                std::fs::create_dir_all(&dir)?;
                let credentials = serde_json::json!({ "token": token });
                std::fs::write(
                    dir.join("credentials.json"),
                    serde_json::to_vec(&credentials)?,
                )?;
                env.insert(
                    "CLAUDE_CONFIG_DIR".to_string(),
                    dir.display().to_string(),
                );
            } else {
                env.insert("REMCLI_AGENT_TOKEN".to_string(), token.to_string());
            }
        }

        for var in KNOWN_AUTH_VARS {
            if let Some(value) = env.get(*var)
                && let Some(missing) = first_unexpanded_ref(value)
            {
                bail!(
                    "auth variable {var} still references unset variable {missing} after expansion"
                );
            }
        }

        Ok(env)
    }

    #[cfg(test)]
    fn track_for_test(&self, pid: u32, started_by: StartedBy, session_id: Option<SessionId>) {
        self.children.lock().unwrap().insert(
            pid,
            TrackedChild {
                pid,
                started_by,
                session_id,
                tmux_window: None,
                directory_created: false,
            },
        );
    }
}

fn terminate_pid(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn parse_pid_fallback(session_ref: &str) -> Option<u32> {
    session_ref.strip_prefix("PID-")?.parse().ok()
}

/// Replace `${NAME}` references with values from `env`; unknown references
/// are left in place for the post-expansion check.
fn expand_vars(value: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        match tail.find('}') {
            Some(end) => {
                let name = &tail[..end];
                match env.get(name) {
                    Some(replacement) => out.push_str(replacement),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn first_unexpanded_ref(value: &str) -> Option<&str> {
    let start = value.find("${")?;
    let tail = &value[start + 2..];
    let end = tail.find('}')?;
    Some(&tail[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use remcli_protocol::SessionStartedMetadata;

    fn test_supervisor() -> (Supervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            Tmux::new("remcli-test"),
            "remcli".to_string(),
            dir.path().join("credentials"),
        );
        (supervisor, dir)
    }

    fn report(pid: u32, session_id: &str) -> SessionStartedReport {
        SessionStartedReport {
            session_id: session_id.to_string(),
            metadata: SessionStartedMetadata {
                host_pid: pid,
                extra: serde_json::Map::new(),
            },
        }
    }

    #[test]
    fn expand_vars_resolves_known_and_keeps_unknown() {
        let mut env = HashMap::new();
        env.insert("HOME".to_string(), "/home/u".to_string());
        assert_eq!(expand_vars("${HOME}/bin", &env), "/home/u/bin");
        assert_eq!(expand_vars("${NOPE}/bin", &env), "${NOPE}/bin");
        assert_eq!(expand_vars("a${HOME}b${HOME}c", &env), "a/home/ub/home/uc");
        assert_eq!(expand_vars("broken ${REF", &env), "broken ${REF");
        assert_eq!(first_unexpanded_ref("x${MISSING}y"), Some("MISSING"));
        assert_eq!(first_unexpanded_ref("clean"), None);
    }

    #[test]
    fn compose_env_writes_claude_credentials_dir() {
        let (supervisor, _dir) = test_supervisor();
        let env = supervisor.compose_env(None, Some("tok-1"), "claude").unwrap();
        let config_dir = PathBuf::from(env.get("CLAUDE_CONFIG_DIR").unwrap());
        let written = std::fs::read_to_string(config_dir.join("credentials.json")).unwrap();
        assert!(written.contains("tok-1"));
        assert!(env.get("REMCLI_AGENT_TOKEN").is_none());
    }

    #[test]
    fn compose_env_injects_token_var_for_other_agents() {
        let (supervisor, _dir) = test_supervisor();
        let env = supervisor.compose_env(None, Some("tok-2"), "codex").unwrap();
        assert_eq!(env.get("REMCLI_AGENT_TOKEN").map(String::as_str), Some("tok-2"));
    }

    #[test]
    fn compose_env_rejects_unexpanded_auth_reference() {
        let (supervisor, _dir) = test_supervisor();
        let mut profile = HashMap::new();
        profile.insert(
            "ANTHROPIC_API_KEY".to_string(),
            "${REMCLI_TEST_MISSING_REF}".to_string(),
        );
        let err = supervisor
            .compose_env(Some(&profile), None, "claude")
            .unwrap_err()
            .to_string();
        assert!(err.contains("ANTHROPIC_API_KEY"));
        assert!(err.contains("REMCLI_TEST_MISSING_REF"));
    }

    #[test]
    fn compose_env_auth_overlay_cannot_be_shadowed() {
        let (supervisor, _dir) = test_supervisor();
        let mut profile = HashMap::new();
        profile.insert("REMCLI_AGENT_TOKEN".to_string(), "shadowed".to_string());
        let env = supervisor
            .compose_env(Some(&profile), Some("real"), "codex")
            .unwrap();
        assert_eq!(env.get("REMCLI_AGENT_TOKEN").map(String::as_str), Some("real"));
    }

    #[tokio::test]
    async fn spawn_requires_directory_approval() {
        let (supervisor, dir) = test_supervisor();
        let missing = dir.path().join("not/yet/here");
        let outcome = supervisor
            .spawn(SpawnSessionRequest {
                directory: missing.display().to_string(),
                agent: None,
                token: None,
                environment: None,
                approved_new_directory_creation: false,
            })
            .await;
        assert_eq!(
            outcome,
            SpawnOutcome::NeedsDirectoryApproval {
                directory: missing.display().to_string()
            }
        );
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn webhook_resolves_pending_awaiter() {
        let (supervisor, _dir) = test_supervisor();
        let supervisor = std::sync::Arc::new(supervisor);
        supervisor.track_for_test(4321, StartedBy::Daemon, None);

        let waiting = {
            let supervisor = std::sync::Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.await_child_report(4321).await })
        };
        tokio::task::yield_now().await;

        supervisor.on_child_report(&report(4321, "S1"));
        assert_eq!(waiting.await.unwrap(), Some("S1".to_string()));
        assert_eq!(supervisor.session_for_pid(4321), Some("S1".to_string()));
        let tracked = &supervisor.list()[0];
        assert_eq!(tracked.started_by, StartedBy::Daemon);
    }

    #[tokio::test(start_paused = true)]
    async fn awaiter_expiry_discards_the_tracked_child() {
        let (supervisor, _dir) = test_supervisor();
        let supervisor = std::sync::Arc::new(supervisor);
        supervisor.track_for_test(5555, StartedBy::Daemon, None);

        let waiting = {
            let supervisor = std::sync::Arc::clone(&supervisor);
            tokio::spawn(async move { supervisor.await_child_report(5555).await })
        };
        tokio::task::yield_now().await;
        tokio::time::advance(WEBHOOK_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(waiting.await.unwrap(), None);
        assert!(supervisor.list().is_empty());
    }

    #[test]
    fn webhook_for_unknown_pid_adopts_external_child() {
        let (supervisor, _dir) = test_supervisor();
        supervisor.on_child_report(&report(777, "S9"));
        let children = supervisor.list();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].started_by, StartedBy::External);
        assert_eq!(children[0].session_id.as_deref(), Some("S9"));
    }

    #[test]
    fn webhook_never_downgrades_daemon_children() {
        let (supervisor, _dir) = test_supervisor();
        supervisor.track_for_test(888, StartedBy::Daemon, None);
        supervisor.on_child_report(&report(888, "S2"));
        assert_eq!(supervisor.list()[0].started_by, StartedBy::Daemon);
    }

    #[test]
    fn pid_fallback_syntax_parses() {
        assert_eq!(parse_pid_fallback("PID-1234"), Some(1234));
        assert_eq!(parse_pid_fallback("PID-"), None);
        assert_eq!(parse_pid_fallback("session-1"), None);
    }

    #[tokio::test]
    async fn stop_by_pid_fallback_removes_entry() {
        let (supervisor, _dir) = test_supervisor();
        // An "external" child whose pid is certainly not a live process we
        // would mind signalling.
        supervisor.track_for_test(1_999_999_999, StartedBy::External, Some("S3".into()));
        assert!(supervisor.stop("PID-1999999999").await);
        assert!(supervisor.list().is_empty());
        assert!(!supervisor.stop("PID-1999999999").await);
        assert!(!supervisor.stop("unknown-session").await);
    }

    #[test]
    fn prune_drops_vanished_processes() {
        let (supervisor, _dir) = test_supervisor();
        supervisor.track_for_test(std::process::id(), StartedBy::External, None);
        supervisor.track_for_test(1_999_999_998, StartedBy::External, None);
        let dead = supervisor.prune();
        assert_eq!(dead, vec![1_999_999_998]);
        assert_eq!(supervisor.list().len(), 1);
    }
}
