//! Error types for the forum poller.

use thiserror::Error;

/// Errors that can occur while fetching a topic listing.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The forum answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// The request did not complete in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// HTTP transport failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The configured proxy could not be used.
    #[error("invalid proxy configuration: {0}")]
    Proxy(String),
}

/// Errors surfaced by [`crate::SourcePoller::poll`].
#[derive(Debug, Error)]
pub enum PollError {
    /// Every attempt failed and no credential refresh happened.
    #[error("failed to fetch {source_id}: {error}")]
    Fetch {
        source_id: String,
        #[source]
        error: FetchError,
    },

    /// Every attempt failed and the credentials were refreshed as a result.
    ///
    /// Not a failure of the source itself: the rest of the current cycle runs
    /// on stale assumptions and must stop.
    #[error("credentials were refreshed, current cycle must stop")]
    CredentialsRefreshed,
}

impl PollError {
    /// Whether this error asks the caller to abort the current cycle.
    pub fn is_credentials_refreshed(&self) -> bool {
        matches!(self, PollError::CredentialsRefreshed)
    }
}
