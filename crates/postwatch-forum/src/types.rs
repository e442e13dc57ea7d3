//! Forum data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single post by a subscribed author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostItem {
    /// Stable identifier, `<forum-host>-topic-<topic-id>`.
    pub id: String,
    pub title: String,
    /// Canonical link to the topic.
    pub link: String,
    /// Author username without a leading `@`.
    pub author: String,
    pub published_at: Option<DateTime<Utc>>,
    pub excerpt: String,
    pub topic_id: u64,
    pub slug: String,
}

/// Result of polling one source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResult {
    /// Posts ordered newest first.
    pub items: Vec<PostItem>,
    /// True iff the forum reported the session as fully authorized.
    pub fresh: bool,
}

impl PollResult {
    /// The newest post, if any.
    pub fn newest(&self) -> Option<&PostItem> {
        self.items.first()
    }
}

/// Credentials and client identity used for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
}

impl Session {
    pub fn new(cookie: impl Into<String>, user_agent: impl Into<String>) -> Self {
        let cookie = cookie.into();
        let user_agent = user_agent.into();
        Self {
            cookie: (!cookie.trim().is_empty()).then_some(cookie),
            user_agent: (!user_agent.trim().is_empty()).then_some(user_agent),
        }
    }
}

/// A request for one author's topic listing.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_id: String,
    pub session: Session,
}

/// Addressing scheme of the forum being watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForumSite {
    base_url: String,
    host: String,
}

impl ForumSite {
    /// Create a site from its base URL, e.g. `https://linux.do`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let host = reqwest::Url::parse(&base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| base_url.clone());
        Self { base_url, host }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// JSON listing of topics created by `source_id`.
    pub fn topics_url(&self, source_id: &str) -> String {
        format!("{}/topics/created-by/{}.json", self.base_url, source_id)
    }

    /// Canonical link for a topic.
    pub fn topic_link(&self, slug: &str, topic_id: u64) -> String {
        format!("{}/t/{}/{}", self.base_url, slug, topic_id)
    }

    /// Slug-less link for a topic, resolved by the forum.
    pub fn topic_url(&self, topic_id: u64) -> String {
        format!("{}/t/topic/{}", self.base_url, topic_id)
    }

    /// Stable item id for a topic.
    pub fn item_id(&self, topic_id: u64) -> String {
        format!("{}-topic-{}", self.host, topic_id)
    }
}
