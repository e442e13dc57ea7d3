//! Delivered marks and retry counters per (destination, item).

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::{LedgerError, LedgerStore};

/// Key prefix shared by every ledger entry.
const PREFIX: &str = "postwatch";

/// Identifies one item for one destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    scope: String,
    chat_id: String,
    item_id: String,
}

impl LedgerKey {
    /// `scope` names the destination kind (`group` or `private`).
    pub fn new(
        scope: impl Into<String>,
        chat_id: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            scope: scope.into(),
            chat_id: chat_id.into(),
            item_id: item_id.into(),
        }
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// Store key of the delivered mark.
    pub fn delivered_key(&self) -> String {
        format!("{}:pushed:{}:{}:{}", PREFIX, self.scope, self.chat_id, self.item_id)
    }

    /// Store key of the retry counter.
    pub fn retry_key(&self) -> String {
        format!("{}:retry:{}:{}:{}", PREFIX, self.scope, self.chat_id, self.item_id)
    }
}

/// Lifetimes and the retry cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerPolicy {
    /// How long a delivered mark suppresses the item.
    pub delivered_ttl: Duration,
    /// How long a retry counter survives.
    pub retry_ttl: Duration,
    /// Counter value at which failures stop incrementing it.
    pub max_retries: u32,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            delivered_ttl: Duration::from_secs(72 * 3600),
            retry_ttl: Duration::from_secs(24 * 3600),
            max_retries: 3,
        }
    }
}

/// What a recorded failure did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Counter incremented to `attempt`; the item is retried next cycle.
    Scheduled { attempt: u32 },
    /// Counter already at the cap and left untouched.
    ///
    /// The item is still not delivered, so the next cycle attempts it again.
    CapReached { attempts: u32 },
}

/// Number of marks removed by a bulk clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearCounts {
    pub delivered: usize,
    pub retries: usize,
}

/// Dedup and retry bookkeeping on top of a [`LedgerStore`].
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    policy: LedgerPolicy,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_policy(store, LedgerPolicy::default())
    }

    pub fn with_policy(store: Arc<dyn LedgerStore>, policy: LedgerPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn is_delivered(&self, key: &LedgerKey) -> Result<bool, LedgerError> {
        Ok(self.store.get(&key.delivered_key()).await?.is_some())
    }

    /// Mark the item delivered for the policy's delivered lifetime.
    pub async fn mark_delivered(&self, key: &LedgerKey) -> Result<(), LedgerError> {
        self.store
            .set(&key.delivered_key(), "1", self.policy.delivered_ttl)
            .await
    }

    /// Current retry count, 0 when absent or unreadable.
    pub async fn retry_count(&self, key: &LedgerKey) -> Result<u32, LedgerError> {
        Ok(self
            .store
            .get(&key.retry_key())
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    /// Increment the retry counter, restarting its lifetime. Returns the new count.
    pub async fn bump_retry(&self, key: &LedgerKey) -> Result<u32, LedgerError> {
        let next = self.retry_count(key).await?.saturating_add(1);
        self.store
            .set(&key.retry_key(), &next.to_string(), self.policy.retry_ttl)
            .await?;
        Ok(next)
    }

    /// Apply the failure policy for one render/deliver attempt.
    ///
    /// Below the cap the delivered mark is dropped and the counter bumped.
    /// At the cap nothing changes; the item stays undelivered and remains
    /// eligible on later cycles.
    pub async fn record_failure(&self, key: &LedgerKey) -> Result<RetryOutcome, LedgerError> {
        let count = self.retry_count(key).await?;
        if count >= self.policy.max_retries {
            return Ok(RetryOutcome::CapReached { attempts: count });
        }

        self.store.delete(&key.delivered_key()).await?;
        let attempt = self.bump_retry(key).await?;
        debug!(item = %key.item_id(), attempt, "recorded delivery failure");
        Ok(RetryOutcome::Scheduled { attempt })
    }

    /// Remove both marks for one item. Returns true if it was marked delivered.
    pub async fn clear(&self, key: &LedgerKey) -> Result<bool, LedgerError> {
        let delivered = self.store.delete(&key.delivered_key()).await?;
        self.store.delete(&key.retry_key()).await?;
        Ok(delivered)
    }

    /// Remove every mark whose `<scope>:<chat>:<item>` part matches `pattern`.
    pub async fn clear_all(&self, pattern: &str) -> Result<ClearCounts, LedgerError> {
        let delivered = self
            .delete_matching(&format!("{}:pushed:{}", PREFIX, pattern))
            .await?;
        let retries = self
            .delete_matching(&format!("{}:retry:{}", PREFIX, pattern))
            .await?;
        Ok(ClearCounts { delivered, retries })
    }

    /// Remove every mark held for one destination.
    pub async fn clear_destination(
        &self,
        scope: &str,
        chat_id: &str,
    ) -> Result<ClearCounts, LedgerError> {
        self.clear_all(&format!("{}:{}:*", scope, chat_id)).await
    }

    /// Remove every mark in the ledger.
    pub async fn clear_everything(&self) -> Result<ClearCounts, LedgerError> {
        self.clear_all("*").await
    }

    /// Drop expired marks from the store. Returns how many were dropped.
    pub async fn purge_expired(&self) -> Result<usize, LedgerError> {
        self.store.purge_expired().await
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize, LedgerError> {
        let keys = self.store.keys(pattern).await?;
        for key in &keys {
            self.store.delete(key).await?;
        }
        Ok(keys.len())
    }
}
