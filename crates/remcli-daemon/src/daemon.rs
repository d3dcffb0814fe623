//! Shared daemon state handed to every plane and background task.

use crate::config::Config;
use crate::router::{ConnId, EventRouter, RecipientFilter};
use crate::rpc::RpcRegistry;
use crate::supervisor::Supervisor;
use anyhow::{Context, Result};
use remcli_auth::SECRET_BYTES;
use remcli_protocol::{EphemeralEvent, UpdateBody, UpdateEnvelope, now_ms, paths};
use remcli_store::Store;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Coordinates the daemon's orderly teardown. A fatal request marks the run
/// for exit code 1; both kinds funnel through the same cancellation token.
#[derive(Clone)]
pub struct ShutdownController {
    token: CancellationToken,
    fatal: Arc<AtomicBool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request(&self, reason: &str) {
        if !self.token.is_cancelled() {
            info!(reason, "shutdown requested");
        }
        self.token.cancel();
    }

    pub fn request_fatal(&self, reason: &str) {
        if !self.token.is_cancelled() {
            error!(reason, "fatal condition, shutting down");
        }
        self.fatal.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DaemonState {
    pub config: Config,
    pub secret: [u8; SECRET_BYTES],
    pub bearer: String,
    pub machine_id: String,
    pub store: Arc<Store>,
    pub router: Arc<EventRouter>,
    pub rpc: Arc<RpcRegistry>,
    pub supervisor: Arc<Supervisor>,
    pub shutdown: ShutdownController,
}

impl DaemonState {
    pub fn new(
        config: Config,
        secret: [u8; SECRET_BYTES],
        machine_id: String,
        store: Arc<Store>,
        supervisor: Arc<Supervisor>,
        shutdown: ShutdownController,
    ) -> Arc<Self> {
        let bearer = remcli_auth::derive_token(&secret);
        let router = Arc::new(EventRouter::new());
        let rpc = Arc::new(RpcRegistry::new(Arc::clone(&router)));
        Arc::new(Self {
            config,
            secret,
            bearer,
            machine_id,
            store,
            router,
            rpc,
            supervisor,
            shutdown,
        })
    }

    /// Emit an update, allocating the next per-user seq for the envelope.
    pub fn emit_update(&self, body: UpdateBody, filter: &RecipientFilter, skip: Option<ConnId>) {
        let seq = self.store.next_user_seq();
        self.emit_update_with_seq(seq, body, filter, skip);
    }

    /// Emit an update whose seq was already allocated inside the store write
    /// (entity creation reuses the entity's own seq).
    pub fn emit_update_with_seq(
        &self,
        seq: u64,
        body: UpdateBody,
        filter: &RecipientFilter,
        skip: Option<ConnId>,
    ) {
        let envelope = UpdateEnvelope {
            id: Uuid::new_v4().to_string(),
            seq,
            body,
            created_at: now_ms(),
        };
        self.router.emit_update(envelope, filter, skip);
    }

    pub fn emit_ephemeral(
        &self,
        event: EphemeralEvent,
        filter: &RecipientFilter,
        skip: Option<ConnId>,
    ) {
        self.router.emit_ephemeral(event, filter, skip);
    }
}

/// Stable machine identity, minted on first start and persisted.
pub fn load_or_create_machine_id(root: &std::path::Path) -> Result<String> {
    let path = paths::machine_id_path(root);
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let existing = existing.trim();
        if !existing.is_empty() {
            return Ok(existing.to_string());
        }
    }
    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, &id)
        .with_context(|| format!("failed to write machine id to {}", path.display()))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_id_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_machine_id(dir.path()).unwrap();
        let second = load_or_create_machine_id(dir.path()).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[test]
    fn shutdown_controller_records_fatality() {
        let shutdown = ShutdownController::new();
        assert!(!shutdown.is_fatal());
        shutdown.request("test");
        assert!(shutdown.token().is_cancelled());
        assert!(!shutdown.is_fatal());

        let fatal = ShutdownController::new();
        fatal.request_fatal("test");
        assert!(fatal.is_fatal());
    }
}
