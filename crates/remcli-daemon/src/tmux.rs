//! Narrow interface to the terminal multiplexer hosting agent TTYs.
//!
//! Every child runs as the pane process of a window inside one daemon-owned
//! tmux session, so the pane PID reported at spawn time is the child's own
//! OS PID.

use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct Tmux {
    session: String,
}

impl Tmux {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }

    pub fn session_name(&self) -> &str {
        &self.session
    }

    /// Abort early when tmux is not installed.
    pub fn ensure_available() -> Result<()> {
        which::which("tmux").map(|_| ()).context(
            "tmux is required to host agent sessions but was not found on PATH",
        )
    }

    /// Spawn `command` in a new window and report `(window_id, pane_pid)`.
    pub async fn spawn_window(
        &self,
        name: &str,
        cwd: &Path,
        env: &HashMap<String, String>,
        command: &[String],
    ) -> Result<(String, u32)> {
        self.ensure_session().await?;

        let mut cmd = Command::new("tmux");
        cmd.arg("new-window")
            .arg("-d")
            .arg("-P")
            .arg("-F")
            .arg("#{window_id}:#{pane_pid}")
            .arg("-t")
            .arg(&self.session)
            .arg("-n")
            .arg(name)
            .arg("-c")
            .arg(cwd);
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg(shell_command_line(command));

        let output = cmd.output().await.context("failed to run tmux new-window")?;
        if !output.status.success() {
            bail!(
                "tmux new-window failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let printed = String::from_utf8_lossy(&output.stdout);
        let printed = printed.trim();
        let (window_id, pane_pid) = printed
            .split_once(':')
            .with_context(|| format!("unexpected tmux output: {printed}"))?;
        let pane_pid: u32 = pane_pid
            .parse()
            .with_context(|| format!("tmux reported a non-numeric pane pid: {pane_pid}"))?;
        Ok((window_id.to_string(), pane_pid))
    }

    pub async fn kill_window(&self, window_id: &str) -> Result<()> {
        let output = Command::new("tmux")
            .arg("kill-window")
            .arg("-t")
            .arg(format!("{}:{window_id}", self.session))
            .output()
            .await
            .context("failed to run tmux kill-window")?;
        if !output.status.success() {
            bail!(
                "tmux kill-window failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    pub async fn has_session(&self) -> bool {
        Command::new("tmux")
            .arg("has-session")
            .arg("-t")
            .arg(&self.session)
            .output()
            .await
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Tear down the whole daemon session, windows included. Used both for
    /// orphan cleanup at startup and for shutdown.
    pub async fn kill_session(&self) {
        let _ = Command::new("tmux")
            .arg("kill-session")
            .arg("-t")
            .arg(&self.session)
            .output()
            .await;
    }

    async fn ensure_session(&self) -> Result<()> {
        if self.has_session().await {
            return Ok(());
        }
        // A placeholder window keeps the session alive with no children.
        let output = Command::new("tmux")
            .arg("new-session")
            .arg("-d")
            .arg("-s")
            .arg(&self.session)
            .output()
            .await
            .context("failed to run tmux new-session")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Lost the race against a concurrent spawn: the session exists.
            if !stderr.contains("duplicate session") {
                bail!("tmux new-session failed: {}", stderr.trim());
            }
        }
        Ok(())
    }
}

/// POSIX-safe single-quote wrapper for shell tokens.
fn shell_quote(token: &str) -> String {
    if token.is_empty() {
        return "''".to_string();
    }
    let mut out = String::with_capacity(token.len() + 2);
    out.push('\'');
    for ch in token.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn shell_command_line(command: &[String]) -> String {
    command
        .iter()
        .map(|token| shell_quote(token))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_survives_spaces_and_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn command_line_joins_quoted_tokens() {
        let line = shell_command_line(&[
            "remcli".to_string(),
            "--started-by".to_string(),
            "daemon".to_string(),
        ]);
        assert_eq!(line, "'remcli' '--started-by' 'daemon'");
    }
}
