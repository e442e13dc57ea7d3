//! Error types for the push pipeline.

use std::path::PathBuf;

use postwatch_forum::PollError;
use postwatch_ledger::LedgerError;
use thiserror::Error;

/// Errors from a [`Renderer`](crate::Renderer).
#[derive(Debug, Error)]
pub enum RenderError {
    /// No rendering backend is attached.
    #[error("renderer not connected")]
    NotConnected,

    /// The backend answered but could not render the page.
    #[error("render failed: {0}")]
    Failed(String),

    /// The backend's reply could not be understood.
    #[error("invalid render response: {0}")]
    InvalidResponse(String),
}

/// Errors from a [`Transport`](crate::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never reached the chat backend.
    #[error("transport request failed: {0}")]
    Request(String),

    /// The chat backend refused the message.
    #[error("message rejected (status {status}): {message}")]
    Rejected { status: i64, message: String },
}

/// Errors while delivering one item to one destination.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Rendering failed.
    #[error(transparent)]
    Render(#[from] RenderError),

    /// Sending failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Ledger read or write failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Errors from the subscription store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the subscription file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The subscription file is not valid TOML.
    #[error("invalid subscription file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The subscriptions could not be serialized.
    #[error("failed to serialize subscriptions: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Errors from the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML.
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors from operator commands.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The source could not be fetched.
    #[error("could not fetch user {source_id}")]
    SourceUnavailable {
        source_id: String,
        #[source]
        error: PollError,
    },

    /// The destination already follows the source.
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),

    /// The destination does not follow the source.
    #[error("not subscribed to {0}")]
    NotSubscribed(String),

    /// The destination has no subscriptions at all.
    #[error("no subscriptions")]
    NoSubscriptions,

    /// The source has no posts.
    #[error("user {0} has no posts")]
    NoPosts(String),

    /// Test delivery failed.
    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    /// Ledger read or write failed.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Subscription store error.
    #[error(transparent)]
    Store(#[from] StoreError),
}
