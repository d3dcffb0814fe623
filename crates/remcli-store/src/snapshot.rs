//! Best-effort persistence of the store to a single JSON file.
//!
//! The writer is debounced to at most one write per second and owns the file
//! exclusively. Loading tolerates a missing file, an unknown schema version,
//! and a torn or corrupt write by starting fresh.

use crate::store::{Store, StoreInner};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const SCHEMA_VERSION: u32 = 1;
const DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    #[serde(flatten)]
    state: StoreInner,
}

/// Load a store from `path`, or a fresh one when the snapshot is unusable.
pub fn load_snapshot(path: &Path) -> Store {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return Store::new(),
    };
    let snapshot: SnapshotFile = match serde_json::from_slice(&bytes) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(path = %path.display(), %err, "discarding unreadable store snapshot");
            return Store::new();
        }
    };
    if snapshot.version != SCHEMA_VERSION {
        warn!(
            path = %path.display(),
            found = snapshot.version,
            expected = SCHEMA_VERSION,
            "discarding store snapshot with unknown schema version"
        );
        return Store::new();
    }
    Store::from_inner(snapshot.state)
}

/// Serialise the full store state to `path` via temp-file + rename.
pub fn save_snapshot(store: &Store, path: &Path) -> Result<()> {
    let snapshot = SnapshotFile {
        version: SCHEMA_VERSION,
        state: store.export(),
    };
    let bytes = serde_json::to_vec(&snapshot).context("failed to serialise store snapshot")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move snapshot into {}", path.display()))?;
    Ok(())
}

/// Debounced background writer. Wakes on the store's dirty signal, writes at
/// most once per `DEBOUNCE`, and performs a final flush on cancellation.
pub struct SnapshotWriter {
    store: Arc<Store>,
    path: PathBuf,
}

impl SnapshotWriter {
    pub fn new(store: Arc<Store>, path: PathBuf) -> Self {
        Self { store, path }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let dirty = self.store.dirty_handle();
        loop {
            tokio::select! {
                _ = dirty.notified() => {
                    self.write();
                    // Coalesce further changes for the debounce window. The
                    // dirty handle keeps a permit for anything that arrives
                    // while we sleep.
                    tokio::select! {
                        _ = tokio::time::sleep(DEBOUNCE) => {}
                        _ = cancel.cancelled() => {
                            self.write();
                            return;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    self.write();
                    return;
                }
            }
        }
    }

    fn write(&self) {
        match save_snapshot(&self.store, &self.path) {
            Ok(()) => debug!(path = %self.path.display(), "store snapshot written"),
            Err(err) => warn!(%err, "store snapshot write failed"),
        }
    }
}
