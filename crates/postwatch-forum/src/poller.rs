//! Source poller: fetch with retry, parse, refresh credentials on exhaustion.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use tracing::{info, warn};

use crate::{
    CredentialProvider, FetchRequest, Fetcher, ForumSite, PollError, PollResult, Session,
    parse_topic_list,
};

/// Delay between fetch attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Polls one source at a time.
pub struct SourcePoller {
    fetcher: Arc<dyn Fetcher>,
    credentials: Arc<dyn CredentialProvider>,
    site: ForumSite,
    retry_delay: Duration,
}

impl SourcePoller {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        credentials: Arc<dyn CredentialProvider>,
        site: ForumSite,
    ) -> Self {
        Self {
            fetcher,
            credentials,
            site,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the delay between attempts.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn site(&self) -> &ForumSite {
        &self.site
    }

    /// Poll `source_id`, making at most `retry_budget` attempts.
    ///
    /// When every attempt fails the credential provider is asked for a forced
    /// refresh. A successful refresh is reported as
    /// [`PollError::CredentialsRefreshed`]; otherwise the last fetch error is
    /// returned.
    #[tracing::instrument(skip(self, session), fields(source = %source_id))]
    pub async fn poll(
        &self,
        source_id: &str,
        session: &Session,
        retry_budget: u32,
    ) -> Result<PollResult, PollError> {
        let attempts = retry_budget.max(1);
        let request = FetchRequest {
            source_id: source_id.to_string(),
            session: session.clone(),
        };
        let mut delay = Constant::new(self.retry_delay);

        let mut attempt = 0;
        let error = loop {
            attempt += 1;
            match self.fetcher.fetch(&request).await {
                Ok(payload) => return Ok(parse_topic_list(&payload, &self.site)),
                Err(e) if attempt >= attempts => break e,
                Err(e) => {
                    let wait = delay.next_backoff().unwrap_or(self.retry_delay);
                    warn!(
                        attempt,
                        attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "fetch failed, retrying"
                    );
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        };

        warn!(attempts, error = %error, "fetch attempts exhausted, requesting credential refresh");
        if self.credentials.refresh(true).await {
            info!("credentials refreshed, current cycle should stop and wait for the next one");
            return Err(PollError::CredentialsRefreshed);
        }

        Err(PollError::Fetch {
            source_id: source_id.to_string(),
            error,
        })
    }
}
