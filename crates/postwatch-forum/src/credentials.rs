//! Seam to whatever keeps the forum session's credentials alive.

use async_trait::async_trait;

/// Obtains fresh forum credentials.
///
/// `refresh` is a blocking request from the caller's point of view: it returns
/// once new credentials are in place (`true`) or the attempt failed (`false`).
/// A provider that is not connected to its backing session returns `false`.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Refresh credentials. `force_reload` asks the provider to reload the
    /// underlying session before reading credentials from it.
    async fn refresh(&self, force_reload: bool) -> bool;

    /// Whether the provider currently has a session to refresh from.
    async fn is_connected(&self) -> bool;
}
