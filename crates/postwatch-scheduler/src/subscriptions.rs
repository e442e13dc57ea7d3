//! Subscriptions per destination, backed by `push.toml`.
//!
//! ```toml
//! [[group.1001]]
//! source = "neo"
//!
//! [[direct.42]]
//! source = "trinity"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::{Destination, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Subscription {
    source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SubscriptionFile {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    group: BTreeMap<String, Vec<Subscription>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    direct: BTreeMap<String, Vec<Subscription>>,
}

impl SubscriptionFile {
    fn chats(&self, destination: &Destination) -> &BTreeMap<String, Vec<Subscription>> {
        match destination {
            Destination::Group(_) => &self.group,
            Destination::Direct(_) => &self.direct,
        }
    }

    fn chats_mut(&mut self, destination: &Destination) -> &mut BTreeMap<String, Vec<Subscription>> {
        match destination {
            Destination::Group(_) => &mut self.group,
            Destination::Direct(_) => &mut self.direct,
        }
    }

    fn to_set(&self) -> SubscriptionSet {
        let groups = self
            .group
            .iter()
            .map(|(id, subs)| (Destination::Group(id.clone()), subs));
        let directs = self
            .direct
            .iter()
            .map(|(id, subs)| (Destination::Direct(id.clone()), subs));

        SubscriptionSet {
            entries: groups
                .chain(directs)
                .filter(|(_, subs)| !subs.is_empty())
                .map(|(dest, subs)| (dest, subs.iter().map(|s| s.source.clone()).collect()))
                .collect(),
        }
    }
}

/// Point-in-time view of every subscription.
///
/// Group chats come before direct chats; sources keep the order they were
/// added in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    entries: Vec<(Destination, Vec<String>)>,
}

impl SubscriptionSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Each destination with its sources.
    pub fn destinations(&self) -> impl Iterator<Item = (&Destination, &[String])> {
        self.entries.iter().map(|(d, s)| (d, s.as_slice()))
    }

    /// Distinct sources, in first-seen order.
    pub fn sources(&self) -> Vec<String> {
        self.routes().into_iter().map(|(source, _)| source).collect()
    }

    /// Each distinct source with the destinations following it, in first-seen order.
    pub fn routes(&self) -> Vec<(String, Vec<Destination>)> {
        let mut routes: Vec<(String, Vec<Destination>)> = Vec::new();
        for (destination, sources) in &self.entries {
            for source in sources {
                match routes.iter_mut().find(|(s, _)| s == source) {
                    Some((_, dests)) => dests.push(destination.clone()),
                    None => routes.push((source.clone(), vec![destination.clone()])),
                }
            }
        }
        routes
    }
}

/// Result of removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    /// The destination follows other sources but not this one.
    NotSubscribed,
    /// The destination follows nothing.
    NoSubscriptions,
}

/// Reloadable subscription table.
pub struct SubscriptionStore {
    path: Option<PathBuf>,
    state: RwLock<SubscriptionFile>,
}

impl SubscriptionStore {
    /// Load `path`. A missing file is an empty table.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = read_file(&path).await?;
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
        })
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(SubscriptionFile::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn snapshot(&self) -> SubscriptionSet {
        self.state.read().await.to_set()
    }

    /// Re-read the file, replacing the in-memory table.
    pub async fn reload(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let state = read_file(path).await?;
        *self.state.write().await = state;
        info!(path = %path.display(), "subscriptions reloaded");
        Ok(())
    }

    /// Sources followed by `destination`, in the order they were added.
    pub async fn list(&self, destination: &Destination) -> Vec<String> {
        self.state
            .read()
            .await
            .chats(destination)
            .get(destination.chat_id())
            .map(|subs| subs.iter().map(|s| s.source.clone()).collect())
            .unwrap_or_default()
    }

    /// Follow `source`. Returns false if already followed.
    ///
    /// The table changes only once the file is written.
    pub async fn add(&self, destination: &Destination, source: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let subs = next
            .chats_mut(destination)
            .entry(destination.chat_id().to_string())
            .or_default();
        if subs.iter().any(|s| s.source == source) {
            return Ok(false);
        }
        subs.push(Subscription {
            source: source.to_string(),
        });
        self.persist(&next).await?;
        *state = next;
        debug!(%destination, source, "subscription added");
        Ok(true)
    }

    /// Stop following `source`.
    pub async fn remove(&self, destination: &Destination, source: &str) -> Result<Removal, StoreError> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let chats = next.chats_mut(destination);
        let Some(subs) = chats.get_mut(destination.chat_id()).filter(|s| !s.is_empty()) else {
            return Ok(Removal::NoSubscriptions);
        };
        let Some(index) = subs.iter().position(|s| s.source == source) else {
            return Ok(Removal::NotSubscribed);
        };
        subs.remove(index);
        if subs.is_empty() {
            chats.remove(destination.chat_id());
        }
        self.persist(&next).await?;
        *state = next;
        debug!(%destination, source, "subscription removed");
        Ok(Removal::Removed)
    }

    async fn persist(&self, state: &SubscriptionFile) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = toml::to_string_pretty(state)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::write(path, raw)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })
    }
}

async fn read_file(path: &Path) -> Result<SubscriptionFile, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(toml::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SubscriptionFile::default()),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
