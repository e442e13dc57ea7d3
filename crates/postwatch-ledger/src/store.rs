//! TTL-capable key-value stores backing the ledger.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::LedgerError;

/// Source of the current time for expiry checks.
pub(crate) type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Key-value store with per-key expiry and wildcard enumeration.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get a live value.
    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError>;

    /// Set a value that expires after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LedgerError>;

    /// Delete a key. Returns true if a live value was removed.
    async fn delete(&self, key: &str) -> Result<bool, LedgerError>;

    /// List live keys matching `pattern`, where `*` matches any run of characters.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, LedgerError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, LedgerError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

fn glob_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body))
}

/// In-memory store.
///
/// Thread-safe; expired entries are dropped lazily on access and by
/// [`LedgerStore::purge_expired`].
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Clock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    /// Create a store that reads time from `clock`.
    pub(crate) fn with_clock(clock: Clock) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_live(&self, key: &str) -> Option<String> {
        let now = self.now();
        let value = {
            let entry = self.entries.get(key)?;
            entry.is_live(now).then(|| entry.value.clone())
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        value
    }

    fn insert(&self, key: &str, value: &str, ttl: Duration) {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.now().checked_add_signed(ttl));
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    fn remove(&self, key: &str) -> bool {
        let now = self.now();
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now))
    }

    fn matching_keys(&self, pattern: &str) -> Result<Vec<String>, LedgerError> {
        let re = glob_regex(pattern)?;
        let now = self.now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_live(now) && re.is_match(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn snapshot(&self) -> BTreeMap<String, Entry> {
        let now = self.now();
        self.entries
            .iter()
            .filter(|e| e.is_live(now))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn restore(&self, entries: BTreeMap<String, Entry>) -> usize {
        let now = self.now();
        let mut restored = 0;
        for (key, entry) in entries {
            if entry.is_live(now) {
                self.entries.insert(key, entry);
                restored += 1;
            }
        }
        restored
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        Ok(self.get_live(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LedgerError> {
        self.insert(key, value, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.remove(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, LedgerError> {
        self.matching_keys(pattern)
    }

    async fn purge_expired(&self) -> Result<usize, LedgerError> {
        let now = self.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        Ok(before - self.entries.len())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    entries: BTreeMap<String, Entry>,
}

/// Ledger store kept in a JSON file shared between processes.
///
/// Every operation takes an exclusive lock on a sibling `.lock` file, reads
/// the current snapshot, applies the change and writes the snapshot back
/// (tmp file plus rename). The daemon and one-shot commands therefore see
/// each other's marks. Expired entries are dropped from the file whenever it
/// is touched.
pub struct FileStore {
    path: PathBuf,
    clock: Clock,
    local: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`. A missing file is an empty store; a corrupt
    /// one is an error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        Self::open_with_clock(path, Arc::new(Utc::now)).await
    }

    pub(crate) async fn open_with_clock(
        path: impl Into<PathBuf>,
        clock: Clock,
    ) -> Result<Self, LedgerError> {
        let store = Self {
            path: path.into(),
            clock,
            local: Mutex::new(()),
        };
        let live = store.transact(|memory| Ok((memory.len(), false))).await?;
        info!(path = %store.path.display(), live, "opened ledger");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the current file contents under the file lock.
    ///
    /// `op` returns its result and whether it changed anything. The file is
    /// rewritten when it did, or when loading dropped expired entries.
    async fn transact<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&MemoryStore) -> Result<(T, bool), LedgerError> + Send + 'static,
    {
        Ok(self.transact_counting(op).await?.0)
    }

    /// Like [`FileStore::transact`], also returning how many expired entries
    /// were dropped from the file.
    async fn transact_counting<T, F>(&self, op: F) -> Result<(T, usize), LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&MemoryStore) -> Result<(T, bool), LedgerError> + Send + 'static,
    {
        let _local = self.local.lock().await;
        let path = self.path.clone();
        let clock = Arc::clone(&self.clock);

        // Runs to completion even if the caller's future is dropped.
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let lock_file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(path.with_extension("json.lock"))?;
            let mut lock = fd_lock::RwLock::new(lock_file);
            let _held = lock.write()?;

            let memory = MemoryStore::with_clock(clock);
            let expired = load_snapshot(&path, &memory)?;
            let (value, changed) = op(&memory)?;
            if changed || expired > 0 {
                write_snapshot(&path, &memory)?;
                if expired > 0 {
                    debug!(path = %path.display(), expired, "dropped expired ledger entries");
                }
            }
            Ok::<_, LedgerError>((value, expired))
        })
        .await
        .map_err(|e| LedgerError::Store(format!("ledger task failed: {}", e)))?
    }
}

/// Load the snapshot at `path` into `memory`. Returns how many stored
/// entries had already expired.
fn load_snapshot(path: &Path, memory: &MemoryStore) -> Result<usize, LedgerError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    let stored = snapshot.entries.len();
    let restored = memory.restore(snapshot.entries);
    Ok(stored - restored)
}

fn write_snapshot(path: &Path, memory: &MemoryStore) -> Result<(), LedgerError> {
    let snapshot = Snapshot {
        entries: memory.snapshot(),
    };
    let json = serde_json::to_vec_pretty(&snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[async_trait]
impl LedgerStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let key = key.to_string();
        self.transact(move |memory| Ok((memory.get_live(&key), false)))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), LedgerError> {
        let key = key.to_string();
        let value = value.to_string();
        self.transact(move |memory| {
            memory.insert(&key, &value, ttl);
            Ok(((), true))
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, LedgerError> {
        let key = key.to_string();
        self.transact(move |memory| {
            let removed = memory.remove(&key);
            Ok((removed, removed))
        })
        .await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, LedgerError> {
        let pattern = pattern.to_string();
        self.transact(move |memory| Ok((memory.matching_keys(&pattern)?, false)))
            .await
    }

    async fn purge_expired(&self) -> Result<usize, LedgerError> {
        let ((), expired) = self.transact_counting(|_| Ok(((), false))).await?;
        Ok(expired)
    }
}
