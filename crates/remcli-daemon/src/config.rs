use anyhow::Result;
use clap::Parser;
use remcli_protocol::paths::{self, Variant};
use std::path::PathBuf;
use std::time::Duration;

pub const COMPILED_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "remcli local peer-to-peer control plane daemon")]
pub struct Args {
    /// State directory override (default: ~/.remcli, or $REMCLI_HOME_DIR).
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Directory holding the precompiled web app bundle.
    #[arg(long)]
    pub web_dir: Option<PathBuf>,

    /// Do not start a public tunnel even if one is configured.
    #[arg(long)]
    pub no_tunnel: bool,

    /// Skip rendering the connect QR code.
    #[arg(long)]
    pub no_qr: bool,

    /// Accepts the `daemon start` words the CLI front end passes through.
    #[arg(hide = true, num_args = 0.., value_name = "COMMAND")]
    pub command: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub variant: Variant,
    /// State root; everything the daemon persists lives below this.
    pub root: PathBuf,
    pub web_dir: PathBuf,
    pub experimental: bool,
    pub inhibit_sleep: bool,
    pub tunnel: bool,
    pub show_qr: bool,
    pub heartbeat_interval: Duration,
    /// Resolved `remcli` CLI binary, used for agent spawns and self-upgrade.
    pub cli_bin: String,
    pub cli_version: String,
}

impl Config {
    pub fn load(args: &Args) -> Result<Self> {
        let variant = Variant::from_env();
        let root = match &args.state_dir {
            Some(dir) => dir.clone(),
            None => paths::home_dir(variant)?,
        };
        let web_dir = args
            .web_dir
            .clone()
            .unwrap_or_else(|| paths::web_bundle_dir(&root));

        let heartbeat_interval = std::env::var("REMCLI_HEARTBEAT_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_HEARTBEAT);

        Ok(Self {
            variant,
            root,
            web_dir,
            experimental: env_flag("REMCLI_EXPERIMENTAL"),
            inhibit_sleep: env_flag("REMCLI_INHIBIT_SLEEP"),
            tunnel: env_flag("REMCLI_TUNNEL") && !args.no_tunnel,
            show_qr: !args.no_qr,
            heartbeat_interval,
            cli_bin: resolve_cli_binary(),
            cli_version: COMPILED_VERSION.to_string(),
        })
    }

    /// Name of the tmux session owning this daemon's agent windows.
    pub fn tmux_session(&self) -> String {
        format!("remcli-{}", self.variant.label())
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes")
    )
}

/// Find the `remcli` CLI. Falls back to this daemon binary, which accepts the
/// same `daemon start` invocation.
fn resolve_cli_binary() -> String {
    if let Ok(found) = which::which("remcli") {
        return found.to_string_lossy().to_string();
    }
    if let Ok(exe) = std::env::current_exe() {
        // A replaced binary leaves /proc/self/exe pointing at "<path> (deleted)".
        let exe = exe.to_string_lossy().to_string();
        if let Some(stripped) = exe.strip_suffix(" (deleted)") {
            return stripped.to_string();
        }
        return exe;
    }
    "remcli".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmux_session_carries_the_variant() {
        let args = Args {
            state_dir: Some(PathBuf::from("/tmp/remcli-test")),
            ..Default::default()
        };
        let config = Config::load(&args).unwrap();
        assert!(config.tmux_session().starts_with("remcli-"));
        assert_eq!(config.root, PathBuf::from("/tmp/remcli-test"));
    }

    #[test]
    fn cli_binary_resolution_yields_something_spawnable() {
        assert!(!resolve_cli_binary().is_empty());
    }
}
