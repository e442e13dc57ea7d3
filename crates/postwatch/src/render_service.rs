//! Client for the headless-browser render service.

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use chrono::{DateTime, Utc};
use postwatch_scheduler::{RenderError, RenderRequest, Rendered, Renderer, RendererConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

// Full-page screenshots of long threads are slow.
const RENDER_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Serialize)]
struct RenderBody<'a> {
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookie: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct RenderReply {
    image: String,
    #[serde(default)]
    aux_links: Vec<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
}

/// Renders posts by calling an external screenshot service over HTTP.
pub struct RenderServiceClient {
    http: Client,
    url: String,
}

impl RenderServiceClient {
    pub fn new(config: &RendererConfig) -> Result<Self, RenderError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(RENDER_TIMEOUT_SECS))
            .build()
            .map_err(|e| RenderError::Failed(e.to_string()))?;
        Ok(Self {
            http,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl Renderer for RenderServiceClient {
    async fn render(&self, request: &RenderRequest) -> Result<Rendered, RenderError> {
        let body = RenderBody {
            url: &request.url,
            cookie: request.session.cookie.as_deref(),
            user_agent: request.session.user_agent.as_deref(),
        };

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    RenderError::NotConnected
                } else {
                    RenderError::Failed(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RenderError::Failed(format!("render service returned {}: {}", status, text)));
        }

        let reply: RenderReply = response
            .json()
            .await
            .map_err(|e| RenderError::InvalidResponse(e.to_string()))?;
        let image = BASE64_STANDARD
            .decode(reply.image.trim())
            .map_err(|e| RenderError::InvalidResponse(format!("image is not base64: {}", e)))?;
        if image.is_empty() {
            return Err(RenderError::InvalidResponse("empty image".to_string()));
        }

        debug!(url = %request.url, bytes = image.len(), links = reply.aux_links.len(), "rendered post");

        Ok(Rendered {
            image,
            aux_links: reply.aux_links,
            title: reply.title.filter(|t| !t.is_empty()),
            author: reply.author.filter(|a| !a.is_empty()),
            published_at: reply.published_at,
        })
    }
}
