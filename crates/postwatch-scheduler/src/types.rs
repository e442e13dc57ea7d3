//! Pipeline types.

use std::fmt;
use std::str::FromStr;

use postwatch_ledger::LedgerKey;
use serde::{Deserialize, Serialize};

use crate::{OutgoingMessage, Transport, TransportError};

/// A chat that receives pushes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Destination {
    /// A group chat.
    Group(String),
    /// A one-to-one chat.
    Direct(String),
}

impl Destination {
    pub fn chat_id(&self) -> &str {
        match self {
            Destination::Group(id) | Destination::Direct(id) => id,
        }
    }

    /// Ledger scope name.
    pub fn scope(&self) -> &'static str {
        match self {
            Destination::Group(_) => "group",
            Destination::Direct(_) => "private",
        }
    }

    /// Ledger key for `item_id` delivered to this destination.
    pub fn ledger_key(&self, item_id: &str) -> LedgerKey {
        LedgerKey::new(self.scope(), self.chat_id(), item_id)
    }

    /// Send `message` through the transport call matching this destination.
    pub async fn send(
        &self,
        transport: &dyn Transport,
        message: &OutgoingMessage,
    ) -> Result<(), TransportError> {
        match self {
            Destination::Group(id) => transport.send_group(id, message).await,
            Destination::Direct(id) => transport.send_direct(id, message).await,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Group(id) => write!(f, "group:{}", id),
            Destination::Direct(id) => write!(f, "direct:{}", id),
        }
    }
}

impl FromStr for Destination {
    type Err = String;

    /// Parse `group:<id>` or `direct:<id>` (`private:<id>` is accepted too).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected group:<id> or direct:<id>, got {:?}", s))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(format!("missing chat id in {:?}", s));
        }
        match kind.trim() {
            "group" => Ok(Destination::Group(id.to_string())),
            "direct" | "private" => Ok(Destination::Direct(id.to_string())),
            other => Err(format!("unknown destination kind {:?}", other)),
        }
    }
}

/// How a cycle walks sources and destinations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushMode {
    /// Poll a source, deliver to its subscribers, move to the next source.
    Immediate,
    /// Poll every source first, then deliver from the cached results.
    #[default]
    Batch,
}

impl FromStr for PushMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "immediate" => Ok(PushMode::Immediate),
            "batch" => Ok(PushMode::Batch),
            other => Err(format!("unknown push mode {:?}", other)),
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cycle did not start.
    Skipped(SkipReason),
    /// The cycle stopped before delivering.
    Aborted(AbortReason),
    /// The cycle ran to the end.
    Completed(CycleReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle is still running.
    AlreadyRunning,
    /// Pushing is switched off in the configuration.
    Disabled,
    /// The local hour is inside the quiet window.
    QuietHours,
    /// Nobody subscribes to anything.
    NoSubscriptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// A poll exhausted its retries and the credentials were refreshed.
    CredentialsRefreshed,
    /// No source returned fresh data; a refresh was attempted.
    AllStale { refresh_succeeded: bool },
    /// Shutdown was requested between two steps.
    Stopped,
}

/// Counters for a completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Sources a poll was attempted for.
    pub sources_polled: usize,
    /// Sources whose poll failed.
    pub sources_failed: usize,
    /// Sources that answered with a stale session.
    pub sources_stale: usize,
    /// Items rendered and sent.
    pub delivered: usize,
    /// Items skipped for being too old.
    pub suppressed: usize,
    /// Deliveries that failed.
    pub failed: usize,
    /// Items already delivered earlier.
    pub skipped_seen: usize,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Skipped(reason) => write!(f, "skipped ({:?})", reason),
            CycleOutcome::Aborted(AbortReason::CredentialsRefreshed) => {
                write!(f, "aborted: credentials refreshed")
            }
            CycleOutcome::Aborted(AbortReason::AllStale { refresh_succeeded }) => write!(
                f,
                "aborted: all sources stale (refresh {})",
                if *refresh_succeeded { "succeeded" } else { "failed" }
            ),
            CycleOutcome::Aborted(AbortReason::Stopped) => write!(f, "aborted: stopped"),
            CycleOutcome::Completed(r) => write!(
                f,
                "completed: {} polled, {} failed, {} stale, {} delivered, {} suppressed, {} delivery failures, {} already delivered",
                r.sources_polled,
                r.sources_failed,
                r.sources_stale,
                r.delivered,
                r.suppressed,
                r.failed,
                r.skipped_seen
            ),
        }
    }
}
