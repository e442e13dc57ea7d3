//! Push scheduler and delivery pipeline for postwatch.
//!
//! One cycle polls every subscribed source, checks session health, and
//! delivers each source's newest post to the destinations subscribed to it:
//!
//! - **Scheduler**: cycle gating (overlap, push switch, quiet hours) and the
//!   immediate and batch push modes
//! - **Delivery**: dedup check, age filter, render, compose, send, and the
//!   retry bookkeeping on failure
//! - **Health**: credential refresh when no source returned fresh data
//! - **Stores**: TOML-backed configuration and subscriptions with `reload()`
//! - **Admin**: subscribe, reset and the other operator commands

mod admin;
mod config;
mod delivery;
mod error;
mod health;
mod pacing;
mod scheduler;
mod subscriptions;
mod types;

pub use admin::{Admin, SubscribeReport};
pub use config::{
    ConfigStore, CredentialsConfig, OneBotConfig, PacingConfig, PushConfig, QuietHours,
    RendererConfig,
};
pub use delivery::{
    DeliveryContext, DeliveryResult, Deliverer, MessageShape, OutgoingMessage, PostMeta,
    RenderRequest, Rendered, Renderer, Transport, compose_message,
};
pub use error::{AdminError, ConfigError, DeliveryError, RenderError, StoreError, TransportError};
pub use health::{CookieHealth, HealthVerdict};
pub use pacing::{Jitter, PacingPolicy};
pub use scheduler::{LocalClock, PipelineDeps, PushScheduler};
pub use subscriptions::{Removal, SubscriptionSet, SubscriptionStore};
pub use types::{AbortReason, CycleOutcome, CycleReport, Destination, PushMode, SkipReason};
