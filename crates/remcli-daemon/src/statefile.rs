//! The daemon's on-disk state file and its sibling lock file.
//!
//! The lock is an atomic create-if-absent file containing the owning PID;
//! only the daemon holding it may write the state file.

use anyhow::{Context, Result, bail};
use remcli_protocol::StateFile;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct LockFile {
    path: PathBuf,
    released: bool,
}

impl LockFile {
    /// Exclusive acquisition. Fails when another daemon already holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(path).unwrap_or_default();
                bail!(
                    "lock file {} is held by pid {}",
                    path.display(),
                    holder.trim()
                );
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to create lock file {}", path.display()));
            }
        };
        write!(file, "{}", std::process::id())
            .with_context(|| format!("failed to write pid into {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn holder_pid(path: &Path) -> Option<u32> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Remove a lock left behind by a daemon that is no longer running.
    pub fn remove_stale(path: &Path) {
        if path.exists() {
            debug!(path = %path.display(), "removing stale lock file");
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn release(mut self) {
        self.released = true;
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub fn read_state_file(path: &Path) -> Option<StateFile> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(state) => Some(state),
        Err(err) => {
            debug!(path = %path.display(), %err, "ignoring unreadable state file");
            None
        }
    }
}

pub fn write_state_file(path: &Path, state: &StateFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let bytes = serde_json::to_vec_pretty(state).context("failed to serialise state file")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &bytes).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to move state file into {}", path.display()))?;
    Ok(())
}

pub fn delete_state_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> StateFile {
        StateFile {
            pid: std::process::id(),
            http_port: 4100,
            p2p_port: 4200,
            p2p_host: "192.168.1.5".into(),
            p2p_shared_secret: "c2VjcmV0".into(),
            tunnel_url: None,
            start_time: 1,
            started_with_cli_version: "1.0.0".into(),
            last_heartbeat: None,
            log_path: "/tmp/daemon.log".into(),
        }
    }

    #[test]
    fn lock_is_exclusive_and_carries_the_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.state.json.lock");

        let lock = LockFile::acquire(&path).unwrap();
        assert_eq!(LockFile::holder_pid(&path), Some(std::process::id()));
        assert!(LockFile::acquire(&path).is_err());

        lock.release();
        assert!(!path.exists());
        let _again = LockFile::acquire(&path).unwrap();
    }

    #[test]
    fn dropping_an_unreleased_lock_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.state.json.lock");
        {
            let _lock = LockFile::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn state_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.state.json");
        assert!(read_state_file(&path).is_none());

        write_state_file(&path, &sample_state()).unwrap();
        let read = read_state_file(&path).unwrap();
        assert_eq!(read.p2p_port, 4200);
        assert_eq!(read.started_with_cli_version, "1.0.0");

        std::fs::write(&path, b"not json").unwrap();
        assert!(read_state_file(&path).is_none());
    }
}
