//! Delivery dedup and retry ledger for postwatch.
//!
//! The ledger records, per (destination, item), whether the item was already
//! delivered and how many delivery attempts failed. Both marks live in a
//! TTL-capable key-value store and expire on their own:
//!
//! - delivered marks after 72 hours,
//! - retry counters after 24 hours.

mod error;
mod ledger;
mod store;

pub use error::LedgerError;
pub use ledger::{ClearCounts, Ledger, LedgerKey, LedgerPolicy, RetryOutcome};
pub use store::{FileStore, LedgerStore, MemoryStore};
