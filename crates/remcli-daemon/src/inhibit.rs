//! Keep the workstation awake while agent sessions run.

use tokio::process::Child;
use tracing::{debug, warn};

pub struct SleepInhibitor {
    child: Option<Child>,
}

impl SleepInhibitor {
    pub fn start(enabled: bool) -> Self {
        if !enabled {
            return Self { child: None };
        }
        if !cfg!(target_os = "macos") {
            debug!("sleep inhibition is only wired up for macOS, skipping");
            return Self { child: None };
        }
        match tokio::process::Command::new("caffeinate")
            .arg("-dims")
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                debug!("caffeinate started");
                Self { child: Some(child) }
            }
            Err(err) => {
                warn!(%err, "failed to start caffeinate");
                Self { child: None }
            }
        }
    }

    pub async fn stop(mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}
