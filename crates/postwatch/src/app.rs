//! Wiring of the production collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::Result;
use postwatch_forum::{ForumSite, HttpFetcher, SourcePoller};
use postwatch_ledger::{FileStore, Ledger};
use postwatch_scheduler::{
    Admin, ConfigStore, CycleOutcome, PacingPolicy, PipelineDeps, PushMode, PushScheduler,
    SkipReason, SubscriptionStore,
};
use tracing::info;

use crate::credentials::CommandCredentialProvider;
use crate::onebot::OneBotTransport;
use crate::render_service::RenderServiceClient;

pub const CONFIG_FILE: &str = "config.toml";
pub const SUBSCRIPTIONS_FILE: &str = "push.toml";
pub const LEDGER_FILE: &str = "ledger.json";
/// Held by whichever process is running a push cycle.
pub const CYCLE_LOCK_FILE: &str = "cycle.lock";

/// Everything a command needs, built from the data directory.
pub struct App {
    pub data_dir: PathBuf,
    pub config: Arc<ConfigStore>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub scheduler: Arc<PushScheduler>,
}

impl App {
    /// Open `data_dir`, pacing cycles as `config.toml` says.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        Self::build(data_dir, None).await
    }

    pub async fn open_with_pacing(data_dir: &Path, pacing: PacingPolicy) -> Result<Self> {
        Self::build(data_dir, Some(pacing)).await
    }

    async fn build(data_dir: &Path, pacing: Option<PacingPolicy>) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| miette::miette!("failed to create {}: {}", data_dir.display(), e))?;

        let config = Arc::new(
            ConfigStore::open(data_dir.join(CONFIG_FILE))
                .await
                .map_err(|e| miette::miette!("{}", e))?,
        );
        let subscriptions = Arc::new(
            SubscriptionStore::open(data_dir.join(SUBSCRIPTIONS_FILE))
                .await
                .map_err(|e| miette::miette!("{}", e))?,
        );
        let store = FileStore::open(data_dir.join(LEDGER_FILE))
            .await
            .map_err(|e| miette::miette!("{}", e))?;
        let ledger = Arc::new(Ledger::new(Arc::new(store)));

        // Site, proxy, pacing and endpoints are read once; changing them needs a restart.
        let settings = config.snapshot().await;
        let pacing = pacing.unwrap_or_else(|| settings.pacing());
        let site = ForumSite::new(&settings.forum_base_url);
        let fetcher = HttpFetcher::new(site.clone(), Some(&settings.proxy))
            .map_err(|e| miette::miette!("{}", e))?;
        let credentials = Arc::new(CommandCredentialProvider::new(Arc::clone(&config)));
        let poller = SourcePoller::new(Arc::new(fetcher), credentials.clone(), site)
            .with_retry_delay(settings.retry_delay());
        let renderer = RenderServiceClient::new(&settings.renderer).map_err(|e| miette::miette!("{}", e))?;
        let transport = OneBotTransport::new(&settings.onebot).map_err(|e| miette::miette!("{}", e))?;

        let deps = PipelineDeps {
            poller: Arc::new(poller),
            ledger,
            renderer: Arc::new(renderer),
            transport: Arc::new(transport),
            credentials,
            subscriptions: Arc::clone(&subscriptions),
            config: Arc::clone(&config),
        };

        info!(
            data_dir = %data_dir.display(),
            forum = %settings.forum_base_url,
            mode = ?settings.mode,
            "postwatch initialized"
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            subscriptions,
            scheduler: Arc::new(PushScheduler::new(deps, pacing)),
        })
    }

    pub fn admin(&self) -> Admin {
        Admin::new(self.scheduler.deps().clone(), self.scheduler.deliverer())
    }

    /// Run one push cycle, in `mode` or the configured one, unless another
    /// process sharing the data directory is running a cycle.
    pub async fn run_cycle(&self, mode: Option<PushMode>) -> Result<CycleOutcome> {
        let path = self.data_dir.join(CYCLE_LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| miette::miette!("failed to open {}: {}", path.display(), e))?;
        let mut lock = fd_lock::RwLock::new(file);
        let _held = match lock.try_write() {
            Ok(guard) => guard,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                info!("another process is running a push cycle, skipping");
                return Ok(CycleOutcome::Skipped(SkipReason::AlreadyRunning));
            }
            Err(e) => return Err(miette::miette!("failed to lock {}: {}", path.display(), e)),
        };

        Ok(match mode {
            Some(mode) => self.scheduler.run_cycle_with_mode(mode).await,
            None => self.scheduler.run_cycle().await,
        })
    }
}
