//! Operator commands.

use std::sync::Arc;

use postwatch_forum::{PollResult, PostItem};
use postwatch_ledger::ClearCounts;
use tracing::info;

use crate::{AdminError, Deliverer, Destination, PipelineDeps, PostMeta, Removal};

/// Result of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeReport {
    /// The source's newest post, now marked delivered for the destination.
    pub newest: Option<PostItem>,
}

/// Subscription management and ledger maintenance.
pub struct Admin {
    deps: PipelineDeps,
    deliverer: Arc<Deliverer>,
}

impl Admin {
    /// `deliverer` should be the scheduler's, so rendering stays serialized.
    pub fn new(deps: PipelineDeps, deliverer: Arc<Deliverer>) -> Self {
        Self { deps, deliverer }
    }

    async fn fetch(&self, source: &str) -> Result<PollResult, AdminError> {
        let config = self.deps.config.snapshot().await;
        self.deps
            .poller
            .poll(source, &config.session(), config.max_retries)
            .await
            .map_err(|error| AdminError::SourceUnavailable {
                source_id: source.to_string(),
                error,
            })
    }

    /// Follow `source` from `destination`.
    ///
    /// The source must be fetchable. Its current newest post is marked
    /// delivered so subscribing does not push an old post.
    #[tracing::instrument(skip(self, destination), fields(destination = %destination))]
    pub async fn subscribe(
        &self,
        destination: &Destination,
        source: &str,
    ) -> Result<SubscribeReport, AdminError> {
        if self
            .deps
            .subscriptions
            .list(destination)
            .await
            .iter()
            .any(|s| s == source)
        {
            return Err(AdminError::AlreadySubscribed(source.to_string()));
        }

        let result = self.fetch(source).await?;
        if !self.deps.subscriptions.add(destination, source).await? {
            return Err(AdminError::AlreadySubscribed(source.to_string()));
        }

        let newest = result.newest().cloned();
        if let Some(item) = &newest {
            self.deps
                .ledger
                .mark_delivered(&destination.ledger_key(&item.id))
                .await?;
        }
        info!(source, newest = ?newest.as_ref().map(|i| &i.id), "subscribed");
        Ok(SubscribeReport { newest })
    }

    /// Stop following `source` from `destination`.
    pub async fn unsubscribe(&self, destination: &Destination, source: &str) -> Result<(), AdminError> {
        match self.deps.subscriptions.remove(destination, source).await? {
            Removal::Removed => {
                info!(%destination, source, "unsubscribed");
                Ok(())
            }
            Removal::NotSubscribed => Err(AdminError::NotSubscribed(source.to_string())),
            Removal::NoSubscriptions => Err(AdminError::NoSubscriptions),
        }
    }

    /// Sources followed by `destination`.
    pub async fn list(&self, destination: &Destination) -> Vec<String> {
        self.deps.subscriptions.list(destination).await
    }

    /// Push a post to `destination` right now, bypassing the ledger.
    ///
    /// With a topic id that topic is rendered; without one, the newest post
    /// of the destination's first subscription.
    pub async fn test_push(
        &self,
        destination: &Destination,
        topic_id: Option<u64>,
    ) -> Result<(), AdminError> {
        let session = self.deps.config.snapshot().await.session();

        if let Some(topic_id) = topic_id {
            let url = self.deps.poller.site().topic_url(topic_id);
            self.deliverer.push_url(destination, &url, &session).await?;
            return Ok(());
        }

        let source = self
            .list(destination)
            .await
            .into_iter()
            .next()
            .ok_or(AdminError::NoSubscriptions)?;
        let result = self.fetch(&source).await?;
        let item = result.newest().ok_or_else(|| AdminError::NoPosts(source.clone()))?;
        self.deliverer
            .push(destination, &PostMeta::from(item), &session)
            .await?;
        Ok(())
    }

    /// Forget which of `source`'s current posts were delivered to `destination`.
    ///
    /// Returns how many delivered posts were reset.
    pub async fn reset_source(&self, destination: &Destination, source: &str) -> Result<usize, AdminError> {
        let result = self.fetch(source).await?;
        if result.items.is_empty() {
            return Err(AdminError::NoPosts(source.to_string()));
        }

        let mut count = 0;
        for item in &result.items {
            let key = destination.ledger_key(&item.id);
            if self.deps.ledger.is_delivered(&key).await? {
                self.deps.ledger.clear(&key).await?;
                count += 1;
            }
        }
        info!(%destination, source, count, "reset delivery marks");
        Ok(count)
    }

    /// Forget every delivery and retry mark held for `destination`.
    pub async fn reset_destination(&self, destination: &Destination) -> Result<ClearCounts, AdminError> {
        let counts = self
            .deps
            .ledger
            .clear_destination(destination.scope(), destination.chat_id())
            .await?;
        info!(%destination, delivered = counts.delivered, retries = counts.retries, "reset destination");
        Ok(counts)
    }

    /// Mark a post delivered to `destination`.
    ///
    /// A numeric `target` is a topic id; anything else is a source whose
    /// newest post gets marked. Returns the marked item id.
    pub async fn mark_delivered(&self, destination: &Destination, target: &str) -> Result<String, AdminError> {
        let item_id = match target.parse::<u64>() {
            Ok(topic_id) => self.deps.poller.site().item_id(topic_id),
            Err(_) => {
                let result = self.fetch(target).await?;
                result
                    .newest()
                    .map(|item| item.id.clone())
                    .ok_or_else(|| AdminError::NoPosts(target.to_string()))?
            }
        };

        self.deps
            .ledger
            .mark_delivered(&destination.ledger_key(&item_id))
            .await?;
        info!(%destination, item = %item_id, "marked delivered");
        Ok(item_id)
    }

    /// Forget every delivery and retry mark.
    pub async fn clear_all(&self) -> Result<ClearCounts, AdminError> {
        let counts = self.deps.ledger.clear_everything().await?;
        info!(delivered = counts.delivered, retries = counts.retries, "cleared all delivery marks");
        Ok(counts)
    }

    /// Force a credential refresh. Returns whether it succeeded.
    pub async fn refresh_credentials(&self) -> bool {
        self.deps.credentials.refresh(true).await
    }
}
