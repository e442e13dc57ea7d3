//! Runtime configuration backed by `config.toml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use postwatch_forum::{ProxyConfig, Session};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{ConfigError, Jitter, PacingPolicy, PushMode};

/// Local hours during which no cycle runs, as a half-open range `[start, end)`.
///
/// The range may wrap past midnight. `start == end` disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: u32,
    pub end: u32,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self { start: 3, end: 6 }
    }
}

impl QuietHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            (self.start..self.end).contains(&hour)
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

/// External command that produces a fresh forum cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Shell command printing a cookie string on stdout. Empty disables refresh.
    pub command: String,
    /// Periodic refresh interval. 0 disables it.
    pub refresh_interval_minutes: u64,
}

/// OneBot HTTP endpoint used to send chat messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OneBotConfig {
    pub url: String,
    pub access_token: String,
}

impl Default for OneBotConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5700".to_string(),
            access_token: String::new(),
        }
    }
}

/// Page rendering service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    pub url: String,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:3000/render".to_string(),
        }
    }
}

/// Delays between polls and deliveries, in seconds. Each delay is the base
/// plus a random amount below the jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub inter_source_delay_secs: u64,
    pub inter_source_jitter_secs: u64,
    pub delivery_delay_secs: u64,
    pub delivery_jitter_secs: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            inter_source_delay_secs: 15,
            inter_source_jitter_secs: 5,
            delivery_delay_secs: 2,
            delivery_jitter_secs: 3,
        }
    }
}

/// Everything read from `config.toml`. Missing keys take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub push_enabled: bool,
    pub check_interval_secs: u64,
    pub mode: PushMode,
    pub forum_base_url: String,
    pub cookie: String,
    pub user_agent: String,
    /// Fetch attempts per source and cycle.
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    /// Posts older than this are marked delivered without being pushed. 0 disables.
    pub ignore_older_than_minutes: u64,
    pub quiet_hours: QuietHours,
    pub proxy: ProxyConfig,
    pub credentials: CredentialsConfig,
    pub onebot: OneBotConfig,
    pub renderer: RendererConfig,
    pub pacing: PacingConfig,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            check_interval_secs: 1800,
            mode: PushMode::Batch,
            forum_base_url: "https://linux.do".to_string(),
            cookie: String::new(),
            user_agent: String::new(),
            max_retries: 20,
            retry_delay_secs: 2,
            ignore_older_than_minutes: 0,
            quiet_hours: QuietHours::default(),
            proxy: ProxyConfig {
                enable: false,
                host: "127.0.0.1".to_string(),
                port: 7890,
            },
            credentials: CredentialsConfig::default(),
            onebot: OneBotConfig::default(),
            renderer: RendererConfig::default(),
            pacing: PacingConfig::default(),
        }
    }
}

impl PushConfig {
    /// Parse and validate a config document.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: PushConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "check_interval_secs must be positive".to_string(),
            ));
        }
        if self.quiet_hours.start > 23 || self.quiet_hours.end > 24 {
            return Err(ConfigError::Invalid(format!(
                "quiet_hours out of range: {}-{}",
                self.quiet_hours.start, self.quiet_hours.end
            )));
        }
        Ok(())
    }

    /// Session used for forum requests and rendering.
    pub fn session(&self) -> Session {
        Session::new(self.cookie.clone(), self.user_agent.clone())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn pacing(&self) -> PacingPolicy {
        let secs = Duration::from_secs;
        PacingPolicy {
            inter_source: Jitter::new(
                secs(self.pacing.inter_source_delay_secs),
                secs(self.pacing.inter_source_jitter_secs),
            ),
            inter_delivery: Jitter::new(
                secs(self.pacing.delivery_delay_secs),
                secs(self.pacing.delivery_jitter_secs),
            ),
        }
    }

    /// Age beyond which posts are not pushed, if enabled.
    pub fn ignore_older_than(&self) -> Option<chrono::Duration> {
        (self.ignore_older_than_minutes > 0)
            .then(|| chrono::Duration::minutes(self.ignore_older_than_minutes as i64))
    }
}

/// Shared, reloadable configuration.
pub struct ConfigStore {
    path: Option<PathBuf>,
    config: RwLock<PushConfig>,
}

impl ConfigStore {
    /// Load `path`, writing the defaults there first if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => PushConfig::from_toml(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = PushConfig::default();
                write_config(&path, &config).await?;
                info!(path = %path.display(), "wrote default configuration");
                config
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            config: RwLock::new(config),
        })
    }

    /// A store that never touches the filesystem.
    pub fn in_memory(config: PushConfig) -> Self {
        Self {
            path: None,
            config: RwLock::new(config),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Copy of the current configuration.
    pub async fn snapshot(&self) -> PushConfig {
        self.config.read().await.clone()
    }

    /// Re-read the file. On error the previous configuration stays in place.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
        let config = match PushConfig::from_toml(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "keeping previous configuration");
                return Err(e);
            }
        };

        *self.config.write().await = config;
        info!(path = %path.display(), "configuration reloaded");
        Ok(())
    }

    /// Replace the forum cookie and persist it.
    pub async fn set_cookie(&self, cookie: impl Into<String>) -> Result<(), ConfigError> {
        let mut config = self.config.write().await;
        config.cookie = cookie.into();
        if let Some(path) = &self.path {
            write_config(path, &config).await?;
        }
        Ok(())
    }
}

async fn write_config(path: &Path, config: &PushConfig) -> Result<(), ConfigError> {
    let raw = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
    }
    tokio::fs::write(path, raw)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}
