//! Credential provider backed by an operator-supplied shell command.
//!
//! The command prints a fresh forum cookie on stdout. It is typically a
//! script that drives a logged-in browser profile, so it can be slow.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use postwatch_forum::CredentialProvider;
use postwatch_scheduler::ConfigStore;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(90);

/// Environment variable telling the command to reload its session first.
pub const FORCE_RELOAD_ENV: &str = "POSTWATCH_FORCE_RELOAD";

/// Runs the credential command. At most one run is in flight; a second
/// caller waits for the first to finish.
pub struct CommandCredentialProvider {
    config: Arc<ConfigStore>,
    timeout: Duration,
    refresh_lock: Mutex<()>,
}

impl CommandCredentialProvider {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self {
            config,
            timeout: COMMAND_TIMEOUT,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, command: &str, force_reload: bool) -> Option<String> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env(FORCE_RELOAD_ENV, if force_reload { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to spawn credential command");
                return None;
            }
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "credential command timed out");
                return None;
            }
        };

        if !output.status.success() {
            warn!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "credential command failed"
            );
            return None;
        }

        let cookie = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if cookie.is_empty() {
            warn!("credential command printed no cookie");
            return None;
        }
        Some(cookie)
    }
}

#[async_trait]
impl CredentialProvider for CommandCredentialProvider {
    async fn refresh(&self, force_reload: bool) -> bool {
        let _running = self.refresh_lock.lock().await;
        let command = self.config.snapshot().await.credentials.command;
        if command.trim().is_empty() {
            warn!("credential refresh requested but no credential command is configured");
            return false;
        }

        let Some(cookie) = self.run(&command, force_reload).await else {
            return false;
        };

        match self.config.set_cookie(cookie).await {
            Ok(()) => {
                info!(force_reload, "forum cookie refreshed");
                true
            }
            Err(e) => {
                warn!(error = %e, "failed to store refreshed cookie");
                false
            }
        }
    }

    async fn is_connected(&self) -> bool {
        !self.config.snapshot().await.credentials.command.trim().is_empty()
    }
}
