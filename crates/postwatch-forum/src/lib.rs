//! Forum source poller for postwatch.
//!
//! This crate turns a subscribed author into an ordered list of posts:
//!
//! - **Fetcher**: HTTP access to the forum's per-author topic listing
//! - **Parsing**: topic listing payload into [`PostItem`]s plus a freshness flag
//! - **Poller**: retry with a fixed delay, then a credential refresh when the
//!   retry budget is exhausted
//! - **Credentials**: the seam to whatever keeps the forum session alive

mod credentials;
mod error;
mod fetcher;
mod parse;
mod poller;
mod types;

pub use credentials::CredentialProvider;
pub use error::{FetchError, PollError};
pub use fetcher::{DEFAULT_USER_AGENT, Fetcher, HttpFetcher, ProxyConfig};
pub use parse::parse_topic_list;
pub use poller::{DEFAULT_RETRY_DELAY, SourcePoller};
pub use types::{FetchRequest, ForumSite, PollResult, PostItem, Session};
