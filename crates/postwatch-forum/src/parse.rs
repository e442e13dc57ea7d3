//! Parsing of the forum's per-author topic listing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::error;

use crate::{ForumSite, PollResult, PostItem};

#[derive(Debug, Deserialize)]
struct TopicListing {
    #[serde(default)]
    users: Vec<ListedUser>,
    topic_list: Option<TopicList>,
}

#[derive(Debug, Deserialize)]
struct ListedUser {
    id: i64,
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct TopicList {
    #[serde(default)]
    can_create_topic: Option<serde_json::Value>,
    #[serde(default)]
    topics: Vec<Topic>,
}

#[derive(Debug, Deserialize)]
struct Topic {
    id: u64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    excerpt: Option<String>,
    #[serde(default)]
    posters: Vec<Poster>,
}

#[derive(Debug, Deserialize)]
struct Poster {
    user_id: Option<i64>,
}

/// Parse a topic listing, propagating malformed payloads as errors.
pub(crate) fn try_parse_topic_list(payload: &str, site: &ForumSite) -> Result<PollResult, serde_json::Error> {
    let listing: TopicListing = serde_json::from_str(payload)?;

    let usernames: HashMap<i64, &str> = listing
        .users
        .iter()
        .map(|u| (u.id, u.username.as_str()))
        .collect();
    // The listing's first user is the author being watched.
    let subscribed = listing
        .users
        .first()
        .map(|u| u.username.as_str())
        .unwrap_or_default();

    let Some(topic_list) = listing.topic_list else {
        return Ok(PollResult::default());
    };

    let fresh = matches!(topic_list.can_create_topic, Some(serde_json::Value::Bool(true)));

    let mut items: Vec<PostItem> = topic_list
        .topics
        .into_iter()
        .map(|topic| {
            let author = topic
                .posters
                .first()
                .and_then(|p| p.user_id)
                .and_then(|id| usernames.get(&id).copied())
                .unwrap_or(subscribed);
            let slug = topic.slug.unwrap_or_default();

            PostItem {
                id: site.item_id(topic.id),
                title: topic.title.unwrap_or_default(),
                link: site.topic_link(&slug, topic.id),
                author: author.trim_start_matches('@').to_string(),
                published_at: topic.created_at.as_deref().and_then(parse_timestamp),
                excerpt: topic.excerpt.unwrap_or_default(),
                topic_id: topic.id,
                slug,
            }
        })
        .collect();

    // Newest first; the forum's own order is not reliable. Undated posts last.
    items.sort_by(|a, b| b.published_at.cmp(&a.published_at));

    Ok(PollResult { items, fresh })
}

/// Parse a topic listing.
///
/// A malformed payload is logged and yields an empty, stale result so the
/// surrounding cycle keeps going.
pub fn parse_topic_list(payload: &str, site: &ForumSite) -> PollResult {
    match try_parse_topic_list(payload, site) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to parse topic listing");
            PollResult::default()
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
