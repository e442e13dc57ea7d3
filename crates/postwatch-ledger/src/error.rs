//! Error types for the ledger.

use thiserror::Error;

/// Errors that can occur in ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// IO error while reading or writing a snapshot.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A key pattern could not be compiled.
    #[error("invalid key pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Backing store rejected the operation.
    #[error("store error: {0}")]
    Store(String),
}
