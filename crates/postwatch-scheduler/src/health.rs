//! Session health across one cycle's polls.

use postwatch_forum::CredentialProvider;
use tracing::{info, warn};

/// Outcome of the end-of-cycle health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    /// At least one source returned fresh data.
    Healthy,
    /// Every source was stale, so a refresh was requested.
    Refreshed { succeeded: bool },
}

/// Tracks whether any source in a cycle saw a fully authorized session.
#[derive(Debug, Default)]
pub struct CookieHealth {
    visited: usize,
    fresh: usize,
}

impl CookieHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_fresh(&mut self) {
        self.visited += 1;
        self.fresh += 1;
    }

    pub fn record_stale(&mut self) {
        self.visited += 1;
    }

    /// A failed poll counts as not fresh.
    pub fn record_failure(&mut self) {
        self.visited += 1;
    }

    /// True iff at least one source was visited and none was fresh.
    pub fn all_stale(&self) -> bool {
        self.visited > 0 && self.fresh == 0
    }

    /// Request a forced refresh when every source was stale. A provider
    /// that cannot refresh counts as a failed refresh.
    pub async fn conclude(&self, provider: &dyn CredentialProvider) -> HealthVerdict {
        if !self.all_stale() {
            return HealthVerdict::Healthy;
        }
        if !provider.is_connected().await {
            warn!(
                sources = self.visited,
                "no source returned fresh data and no credential refresh is available"
            );
            return HealthVerdict::Refreshed { succeeded: false };
        }

        warn!(sources = self.visited, "no source returned fresh data, refreshing credentials");
        let succeeded = provider.refresh(true).await;
        info!(succeeded, "credential refresh finished");
        HealthVerdict::Refreshed { succeeded }
    }
}
