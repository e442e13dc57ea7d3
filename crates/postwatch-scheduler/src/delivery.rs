//! Delivery of a source's newest post to one destination.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use postwatch_forum::{PostItem, Session};
use postwatch_ledger::{Ledger, RetryOutcome};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{DeliveryError, Destination, Jitter, PushConfig, RenderError, TransportError};

/// A page to render.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    pub session: Session,
}

/// What the renderer produced for a page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rendered {
    /// PNG screenshot of the post.
    pub image: Vec<u8>,
    /// Notable links found in the post body.
    pub aux_links: Vec<String>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Turns a post URL into an image plus metadata.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, request: &RenderRequest) -> Result<Rendered, RenderError>;
}

/// Sends chat messages.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_group(&self, chat_id: &str, message: &OutgoingMessage) -> Result<(), TransportError>;

    async fn send_direct(&self, chat_id: &str, message: &OutgoingMessage) -> Result<(), TransportError>;
}

/// How the transport should package a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageShape {
    /// A single image-and-text message.
    Plain,
    /// A grouped forward message, used when the post carries extra links.
    Forward,
}

/// A composed push message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub image: Vec<u8>,
    pub text: String,
    pub aux_links: Vec<String>,
    pub shape: MessageShape,
}

/// Descriptive fields shown in a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostMeta {
    pub author: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub link: String,
}

impl From<&PostItem> for PostMeta {
    fn from(item: &PostItem) -> Self {
        Self {
            author: item.author.clone(),
            title: item.title.clone(),
            published_at: item.published_at,
            link: item.link.clone(),
        }
    }
}

/// Build the message for `meta` from a rendered page.
pub fn compose_message(rendered: Rendered, meta: &PostMeta) -> OutgoingMessage {
    let or_unknown = |s: &str| if s.is_empty() { "unknown".to_string() } else { s.to_string() };

    let mut text = String::from("\nForum subscription push:\n");
    text.push_str(&format!("Author: {}\n", or_unknown(meta.author.trim_start_matches('@'))));
    text.push_str(&format!("Title: {}\n", or_unknown(&meta.title)));
    if let Some(at) = meta.published_at {
        text.push_str(&format!(
            "Posted: {}\n",
            at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
        ));
    }
    text.push_str(&format!("Link: {}", meta.link));

    if !rendered.aux_links.is_empty() {
        text.push_str("\n--- Links found in post ---");
        for link in &rendered.aux_links {
            text.push_str(&format!("\n{}", link));
        }
    }

    let shape = if rendered.aux_links.is_empty() {
        MessageShape::Plain
    } else {
        MessageShape::Forward
    };

    OutgoingMessage {
        image: rendered.image,
        text,
        aux_links: rendered.aux_links,
        shape,
    }
}

/// Per-cycle settings for delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliveryContext {
    pub session: Session,
    /// Posts older than this are marked delivered without being sent.
    pub ignore_older_than: Option<chrono::Duration>,
}

impl DeliveryContext {
    pub fn from_config(config: &PushConfig) -> Self {
        Self {
            session: config.session(),
            ignore_older_than: config.ignore_older_than(),
        }
    }
}

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The source had no posts.
    NoItems,
    /// The newest post was delivered before.
    AlreadyDelivered,
    /// The newest post was too old and was marked delivered unsent.
    Suppressed,
    Delivered,
    /// Rendering or sending failed.
    Failed { retry: RetryOutcome },
}

/// Renders and sends posts, recording the outcome in the ledger.
pub struct Deliverer {
    ledger: Arc<Ledger>,
    renderer: Arc<dyn Renderer>,
    transport: Arc<dyn Transport>,
    render_lock: Mutex<()>,
    pacing: Jitter,
}

impl Deliverer {
    /// `pacing` is waited out after every successful delivery.
    pub fn new(
        ledger: Arc<Ledger>,
        renderer: Arc<dyn Renderer>,
        transport: Arc<dyn Transport>,
        pacing: Jitter,
    ) -> Self {
        Self {
            ledger,
            renderer,
            transport,
            render_lock: Mutex::new(()),
            pacing,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Deliver the newest of `items` to `destination` unless it was already
    /// delivered. Older items are never looked at.
    #[tracing::instrument(skip_all, fields(destination = %destination))]
    pub async fn deliver(
        &self,
        destination: &Destination,
        items: &[PostItem],
        context: &DeliveryContext,
        now: DateTime<Utc>,
    ) -> Result<DeliveryResult, DeliveryError> {
        let Some(item) = items.first() else {
            return Ok(DeliveryResult::NoItems);
        };
        let key = destination.ledger_key(&item.id);

        if self.ledger.is_delivered(&key).await? {
            debug!(item = %item.id, "already delivered");
            return Ok(DeliveryResult::AlreadyDelivered);
        }

        if let (Some(limit), Some(published)) = (context.ignore_older_than, item.published_at) {
            if now - published > limit {
                self.ledger.mark_delivered(&key).await?;
                info!(item = %item.id, published = %published, "post too old, marked delivered without pushing");
                return Ok(DeliveryResult::Suppressed);
            }
        }

        match self
            .push(destination, &PostMeta::from(item), &context.session)
            .await
        {
            Ok(()) => {
                match self.ledger.mark_delivered(&key).await {
                    Ok(()) => info!(item = %item.id, title = %item.title, "delivered"),
                    Err(e) => error!(
                        item = %item.id,
                        error = %e,
                        "delivered but failed to record it, the post may be pushed again"
                    ),
                }
                self.pacing.wait().await;
                Ok(DeliveryResult::Delivered)
            }
            Err(e) => {
                let retry = self.ledger.record_failure(&key).await?;
                match retry {
                    RetryOutcome::Scheduled { attempt } => {
                        error!(item = %item.id, attempt, error = %e, "delivery failed, will retry next cycle");
                    }
                    RetryOutcome::CapReached { attempts } => {
                        warn!(item = %item.id, attempts, error = %e, "delivery failed, retry counter at limit");
                    }
                }
                Ok(DeliveryResult::Failed { retry })
            }
        }
    }

    /// Render `meta.link` and send it. No ledger effects.
    pub async fn push(
        &self,
        destination: &Destination,
        meta: &PostMeta,
        session: &Session,
    ) -> Result<(), DeliveryError> {
        let rendered = self.render(&meta.link, session).await?;
        let message = compose_message(rendered, meta);
        destination.send(self.transport.as_ref(), &message).await?;
        Ok(())
    }

    /// Render `url` and send it, describing the post with the renderer's
    /// metadata. No ledger effects.
    pub async fn push_url(
        &self,
        destination: &Destination,
        url: &str,
        session: &Session,
    ) -> Result<(), DeliveryError> {
        let rendered = self.render(url, session).await?;
        let meta = PostMeta {
            author: rendered.author.clone().unwrap_or_default(),
            title: rendered.title.clone().unwrap_or_default(),
            published_at: rendered.published_at,
            link: url.to_string(),
        };
        let message = compose_message(rendered, &meta);
        destination.send(self.transport.as_ref(), &message).await?;
        Ok(())
    }

    async fn render(&self, url: &str, session: &Session) -> Result<Rendered, RenderError> {
        let _guard = self.render_lock.lock().await;
        self.renderer
            .render(&RenderRequest {
                url: url.to_string(),
                session: session.clone(),
            })
            .await
    }
}
