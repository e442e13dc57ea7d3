//! HTTP access to the forum's topic listings.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{FetchError, FetchRequest, ForumSite};

/// User agent sent when the configuration does not provide one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/143.0.0.0 Safari/537.36";

/// Per-request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Fetches the raw topic listing payload for one source.
///
/// Implementations return an error on transport failure, timeout or any
/// non-2xx status. Retrying is the poller's job.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError>;
}

/// Optional HTTP proxy for forum traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub enable: bool,
    pub host: String,
    pub port: u16,
}

impl ProxyConfig {
    /// Proxy URL, if the proxy is enabled and fully specified.
    pub fn url(&self) -> Option<String> {
        (self.enable && !self.host.is_empty() && self.port != 0)
            .then(|| format!("http://{}:{}", self.host, self.port))
    }
}

/// [`Fetcher`] backed by reqwest.
pub struct HttpFetcher {
    http: Client,
    site: ForumSite,
}

impl HttpFetcher {
    /// Create a fetcher for `site`, optionally routed through `proxy`.
    pub fn new(site: ForumSite, proxy: Option<&ProxyConfig>) -> Result<Self, FetchError> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS));

        if let Some(url) = proxy.and_then(ProxyConfig::url) {
            let proxy = reqwest::Proxy::all(&url).map_err(|e| FetchError::Proxy(e.to_string()))?;
            info!(proxy = %url, "routing forum requests through proxy");
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            http: builder.build()?,
            site,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, FetchError> {
        let url = self.site.topics_url(&request.source_id);
        let user_agent = request
            .session
            .user_agent
            .as_deref()
            .unwrap_or(DEFAULT_USER_AGENT);

        let mut builder = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, user_agent)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(cookie) = &request.session.cookie {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(url.clone())
            } else {
                FetchError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response.text().await?;
        debug!(source = %request.source_id, bytes = body.len(), "fetched topic listing");
        Ok(body)
    }
}
