//! Optional public tunnel in front of the public plane.
//!
//! The provider is external: a `cloudflared` child advertises a public URL
//! for the local port on stderr, and that URL is all the daemon keeps.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

const STARTUP_BUDGET: Duration = Duration::from_secs(60);

pub struct Tunnel {
    child: Child,
    pub url: String,
}

impl Tunnel {
    /// Start a tunnel for the public port. `Ok(None)` when no provider is
    /// installed — the daemon then stays LAN-only.
    pub async fn start(port: u16) -> Result<Option<Tunnel>> {
        let Ok(bin) = which::which("cloudflared") else {
            warn!("tunnel requested but cloudflared is not installed, staying on LAN");
            return Ok(None);
        };

        let mut child = Command::new(bin)
            .arg("tunnel")
            .arg("--url")
            .arg(format!("http://127.0.0.1:{port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn cloudflared")?;

        let stderr = child
            .stderr
            .take()
            .context("cloudflared stderr unavailable")?;
        let mut lines = BufReader::new(stderr).lines();

        let url = tokio::time::timeout(STARTUP_BUDGET, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(url) = extract_tunnel_url(&line) {
                    return Some(url);
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        match url {
            Some(url) => {
                info!(%url, "public tunnel established");
                // Keep draining stderr so the child never blocks on a full pipe.
                tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });
                Ok(Some(Tunnel { child, url }))
            }
            None => {
                warn!("cloudflared did not advertise a url in time, staying on LAN");
                let _ = child.kill().await;
                Ok(None)
            }
        }
    }

    pub async fn stop(mut self) {
        let _ = self.child.kill().await;
    }
}

fn extract_tunnel_url(line: &str) -> Option<String> {
    let start = line.find("https://")?;
    let tail = &line[start..];
    let end = tail
        .find(|c: char| c.is_whitespace() || c == '|')
        .unwrap_or(tail.len());
    let candidate = &tail[..end];
    candidate
        .ends_with(".trycloudflare.com")
        .then(|| candidate.to_string())
}
