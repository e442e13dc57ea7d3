//! In-memory collaborators for pipeline tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use serde_json::json;

use postwatch_forum::{CredentialProvider, FetchError, FetchRequest, Fetcher, ForumSite, SourcePoller};
use postwatch_ledger::{Ledger, MemoryStore};
use postwatch_scheduler::{
    Admin, ConfigStore, Destination, OutgoingMessage, PacingPolicy, PipelineDeps, PushConfig,
    PushScheduler, QuietHours, RenderError, RenderRequest, Rendered, Renderer, SubscriptionStore,
    Transport, TransportError,
};

pub const BASE_URL: &str = "https://linux.do";

// Midday, well outside the default quiet window.
pub fn noon() -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
        .earliest()
        .unwrap()
}

pub fn at_hour(hour: u32) -> DateTime<Local> {
    Local
        .with_ymd_and_hms(2025, 6, 1, hour, 30, 0)
        .earliest()
        .unwrap()
}

pub fn group(id: &str) -> Destination {
    Destination::Group(id.to_string())
}

pub fn direct(id: &str) -> Destination {
    Destination::Direct(id.to_string())
}

pub fn item_id(topic_id: u64) -> String {
    format!("linux.do-topic-{}", topic_id)
}

// Helper to build a topic listing: (topic id, minutes before noon), newest first
pub fn listing(fresh: bool, topics: &[(u64, i64)]) -> String {
    let now = noon().with_timezone(&Utc);
    let topics: Vec<_> = topics
        .iter()
        .map(|(id, minutes_ago)| {
            json!({
                "id": id,
                "title": format!("Topic {}", id),
                "slug": format!("topic-{}", id),
                "created_at": (now - chrono::Duration::minutes(*minutes_ago)).to_rfc3339(),
                "posters": [{ "user_id": 1 }]
            })
        })
        .collect();
    json!({
        "users": [{ "id": 1, "username": "neo" }],
        "topic_list": { "can_create_topic": fresh, "topics": topics }
    })
    .to_string()
}

/// Fetcher answering from a table of canned payloads. Unknown sources get a 404.
#[derive(Default)]
pub struct FakeForum {
    payloads: Mutex<HashMap<String, Result<String, u16>>>,
    calls: Mutex<Vec<String>>,
    pub hold: tokio::sync::Mutex<()>,
}

impl FakeForum {
    pub fn serve(&self, source: &str, payload: String) {
        self.payloads
            .lock()
            .unwrap()
            .insert(source.to_string(), Ok(payload));
    }

    pub fn fail(&self, source: &str, status: u16) {
        self.payloads
            .lock()
            .unwrap()
            .insert(source.to_string(), Err(status));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, source: &str) -> usize {
        self.calls().iter().filter(|s| *s == source).count()
    }
}

#[async_trait]
impl Fetcher for FakeForum {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let _hold = self.hold.lock().await;
        self.calls.lock().unwrap().push(request.source_id.clone());
        let answer = self
            .payloads
            .lock()
            .unwrap()
            .get(&request.source_id)
            .cloned()
            .unwrap_or(Err(404));
        answer.map_err(|status| FetchError::Status {
            status,
            url: format!("{}/topics/created-by/{}.json", BASE_URL, request.source_id),
        })
    }
}

/// Renderer that records requested URLs and fails a configurable number of times.
#[derive(Default)]
pub struct FakeRenderer {
    failures_left: AtomicUsize,
    always_fail: std::sync::atomic::AtomicBool,
    pub aux_links: Mutex<Vec<String>>,
    urls: Mutex<Vec<String>>,
}

impl FakeRenderer {
    pub fn fail_next(&self, times: usize) {
        self.failures_left.store(times, Ordering::SeqCst);
    }

    pub fn fail_always(&self) {
        self.always_fail.store(true, Ordering::SeqCst);
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn renders(&self) -> usize {
        self.urls.lock().unwrap().len()
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, request: &RenderRequest) -> Result<Rendered, RenderError> {
        self.urls.lock().unwrap().push(request.url.clone());

        if self.always_fail.load(Ordering::SeqCst) {
            return Err(RenderError::NotConnected);
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RenderError::Failed("page did not load".to_string()));
        }

        Ok(Rendered {
            image: b"png".to_vec(),
            aux_links: self.aux_links.lock().unwrap().clone(),
            title: Some("Rendered title".to_string()),
            author: Some("morpheus".to_string()),
            published_at: None,
        })
    }
}

/// Transport that records every message.
#[derive(Default)]
pub struct FakeChat {
    sent: Mutex<Vec<(Destination, OutgoingMessage)>>,
    pub reject: std::sync::atomic::AtomicBool,
}

impl FakeChat {
    pub fn sent(&self) -> Vec<(Destination, OutgoingMessage)> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, destination: Destination, message: &OutgoingMessage) -> Result<(), TransportError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected {
                status: 100,
                message: "bot offline".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((destination, message.clone()));
        Ok(())
    }
}

#[async_trait]
impl Transport for FakeChat {
    async fn send_group(&self, chat_id: &str, message: &OutgoingMessage) -> Result<(), TransportError> {
        self.record(Destination::Group(chat_id.to_string()), message)
    }

    async fn send_direct(&self, chat_id: &str, message: &OutgoingMessage) -> Result<(), TransportError> {
        self.record(Destination::Direct(chat_id.to_string()), message)
    }
}

/// Credential provider counting forced refreshes.
pub struct FakeCredentials {
    pub succeed: bool,
    refreshes: AtomicUsize,
}

impl FakeCredentials {
    pub fn new(succeed: bool) -> Self {
        Self {
            succeed,
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn refresh(&self, _force_reload: bool) -> bool {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.succeed
    }

    async fn is_connected(&self) -> bool {
        true
    }
}

pub struct Harness {
    pub forum: Arc<FakeForum>,
    pub renderer: Arc<FakeRenderer>,
    pub chat: Arc<FakeChat>,
    pub credentials: Arc<FakeCredentials>,
    pub ledger: Arc<Ledger>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub scheduler: Arc<PushScheduler>,
}

impl Harness {
    pub fn admin(&self) -> Admin {
        Admin::new(self.scheduler.deps().clone(), self.scheduler.deliverer())
    }

    pub async fn subscribe(&self, destination: &Destination, source: &str) {
        self.subscriptions.add(destination, source).await.unwrap();
    }

    pub async fn is_delivered(&self, destination: &Destination, topic_id: u64) -> bool {
        self.ledger
            .is_delivered(&destination.ledger_key(&item_id(topic_id)))
            .await
            .unwrap()
    }

    pub async fn retry_count(&self, destination: &Destination, topic_id: u64) -> u32 {
        self.ledger
            .retry_count(&destination.ledger_key(&item_id(topic_id)))
            .await
            .unwrap()
    }
}

pub fn test_config() -> PushConfig {
    PushConfig {
        max_retries: 2,
        retry_delay_secs: 0,
        quiet_hours: QuietHours { start: 3, end: 6 },
        ..PushConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config(), true)
}

// Helper to wire every fake into a scheduler with no pacing delays
pub fn harness_with(config: PushConfig, refresh_succeeds: bool) -> Harness {
    harness_paced(config, refresh_succeeds, PacingPolicy::none())
}

/// Like [`harness_with`], with the given pacing. The clock always reads noon.
pub fn harness_paced(config: PushConfig, refresh_succeeds: bool, pacing: PacingPolicy) -> Harness {
    let forum = Arc::new(FakeForum::default());
    let renderer = Arc::new(FakeRenderer::default());
    let chat = Arc::new(FakeChat::default());
    let credentials = Arc::new(FakeCredentials::new(refresh_succeeds));
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new())));
    let subscriptions = Arc::new(SubscriptionStore::in_memory());

    let poller = SourcePoller::new(forum.clone(), credentials.clone(), ForumSite::new(BASE_URL))
        .with_retry_delay(Duration::ZERO);

    let deps = PipelineDeps {
        poller: Arc::new(poller),
        ledger: Arc::clone(&ledger),
        renderer: renderer.clone(),
        transport: chat.clone(),
        credentials: credentials.clone(),
        subscriptions: Arc::clone(&subscriptions),
        config: Arc::new(ConfigStore::in_memory(config)),
    };

    Harness {
        forum,
        renderer,
        chat,
        credentials,
        ledger,
        subscriptions,
        scheduler: Arc::new(PushScheduler::new(deps, pacing).with_clock(Arc::new(noon))),
    }
}
