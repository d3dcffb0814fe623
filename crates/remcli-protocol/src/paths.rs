use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Daemon variant, selected with `REMCLI_VARIANT`. The dev variant keeps its
/// state in a separate root so it can run beside a stable daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Stable,
    Dev,
}

impl Variant {
    pub fn from_env() -> Self {
        match std::env::var("REMCLI_VARIANT").as_deref() {
            Ok("dev") => Variant::Dev,
            _ => Variant::Stable,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Variant::Stable => "stable",
            Variant::Dev => "dev",
        }
    }
}

fn root_dir_name(variant: Variant) -> &'static str {
    match variant {
        Variant::Stable => ".remcli",
        Variant::Dev => ".remcli-dev",
    }
}

/// State root for the given variant.
///
/// Priority: `$REMCLI_HOME_DIR` env var, then `~/.remcli` (or `~/.remcli-dev`).
pub fn home_dir(variant: Variant) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("REMCLI_HOME_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME env var not set")?;
    Ok(PathBuf::from(home).join(root_dir_name(variant)))
}

/// Directory holding the daemon's runtime files (state file, lock, log).
pub fn daemon_dir(root: &Path) -> PathBuf {
    root.join("daemon")
}

pub fn state_file_path(root: &Path) -> PathBuf {
    daemon_dir(root).join("daemon.state.json")
}

/// Sibling of the state file; exclusive create-only semantics.
pub fn lock_file_path(root: &Path) -> PathBuf {
    daemon_dir(root).join("daemon.state.json.lock")
}

pub fn log_path(root: &Path) -> PathBuf {
    daemon_dir(root).join("daemon.log")
}

pub fn snapshot_path(root: &Path) -> PathBuf {
    daemon_dir(root).join("store.snapshot.json")
}

pub fn machine_id_path(root: &Path) -> PathBuf {
    root.join("machine-id")
}

/// Parent for the disposable per-spawn credentials directories.
pub fn credentials_root(root: &Path) -> PathBuf {
    root.join("credentials")
}

/// Directory of the precompiled web app bundle.
///
/// Priority: `$REMCLI_WEB_DIR` env var, then `<root>/web`.
pub fn web_bundle_dir(root: &Path) -> PathBuf {
    if let Ok(dir) = std::env::var("REMCLI_WEB_DIR") {
        return PathBuf::from(dir);
    }
    root.join("web")
}

/// Ensure a directory exists with `0700` permissions.
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
    }
    #[cfg(unix)]
    {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_files_share_a_directory() {
        let root = PathBuf::from("/home/u/.remcli");
        let state = state_file_path(&root);
        let lock = lock_file_path(&root);
        assert_eq!(state.parent(), lock.parent());
        assert_eq!(
            lock.file_name().unwrap().to_str().unwrap(),
            "daemon.state.json.lock"
        );
    }

    #[test]
    fn ensure_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn ensure_sets_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("perms");
        ensure_dir(&nested).unwrap();
        let meta = std::fs::metadata(&nested).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o700);
    }
}
