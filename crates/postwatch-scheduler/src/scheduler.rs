//! Push cycle scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local, Timelike, Utc};
use postwatch_forum::{CredentialProvider, PollResult, PostItem, Session, SourcePoller};
use postwatch_ledger::Ledger;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    AbortReason, ConfigStore, CookieHealth, CycleOutcome, CycleReport, DeliveryContext,
    DeliveryResult, Deliverer, Destination, HealthVerdict, Jitter, PacingPolicy, PushMode,
    Renderer, SkipReason, SubscriptionSet, SubscriptionStore, Transport,
};

/// Source of the local time used for the quiet window.
pub type LocalClock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

/// Collaborators of the push pipeline.
#[derive(Clone)]
pub struct PipelineDeps {
    pub poller: Arc<SourcePoller>,
    pub ledger: Arc<Ledger>,
    pub renderer: Arc<dyn Renderer>,
    pub transport: Arc<dyn Transport>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub config: Arc<ConfigStore>,
}

/// Clears the running flag when a cycle ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// How polling one source went.
enum Polled {
    Fresh(PollResult),
    Stale,
    Failed,
    CredentialsRefreshed,
}

/// Runs poll-then-push cycles. At most one cycle runs at a time.
///
/// [`PushScheduler::stop`] ends a running cycle at the next gap between two
/// polls or two deliveries; a delivery in flight always finishes.
pub struct PushScheduler {
    deps: PipelineDeps,
    deliverer: Arc<Deliverer>,
    pacing: PacingPolicy,
    running: AtomicBool,
    clock: LocalClock,
    stop_tx: watch::Sender<bool>,
}

impl PushScheduler {
    pub fn new(deps: PipelineDeps, pacing: PacingPolicy) -> Self {
        let deliverer = Arc::new(Deliverer::new(
            Arc::clone(&deps.ledger),
            Arc::clone(&deps.renderer),
            Arc::clone(&deps.transport),
            pacing.inter_delivery,
        ));
        Self {
            deps,
            deliverer,
            pacing,
            running: AtomicBool::new(false),
            clock: Arc::new(Local::now),
            stop_tx: watch::channel(false).0,
        }
    }

    pub fn with_clock(mut self, clock: LocalClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn deps(&self) -> &PipelineDeps {
        &self.deps
    }

    /// The deliverer shared with operator commands, so rendering stays serialized.
    pub fn deliverer(&self) -> Arc<Deliverer> {
        Arc::clone(&self.deliverer)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the running cycle, and every later one, to end early.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        info!("push scheduler stopping");
    }

    fn stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Sleep one pacing delay. Returns false if stopped while waiting.
    async fn pause(&self, jitter: &Jitter) -> bool {
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::select! {
            _ = stop_rx.wait_for(|stopped| *stopped) => false,
            _ = jitter.wait() => true,
        }
    }

    /// Run one cycle now, in the configured mode.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at((self.clock)()).await
    }

    /// Run one cycle as if the local time were `now`, in the configured mode.
    pub async fn run_cycle_at(&self, now: DateTime<Local>) -> CycleOutcome {
        self.execute(now, None).await
    }

    /// Run one cycle now in `mode`, whatever the configuration says.
    pub async fn run_cycle_with_mode(&self, mode: PushMode) -> CycleOutcome {
        self.execute((self.clock)(), Some(mode)).await
    }

    #[tracing::instrument(skip(self), fields(hour = now.hour()))]
    async fn execute(&self, now: DateTime<Local>, mode: Option<PushMode>) -> CycleOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("previous cycle still running, skipping");
            return CycleOutcome::Skipped(SkipReason::AlreadyRunning);
        }
        let _guard = RunningGuard(&self.running);

        let config = self.deps.config.snapshot().await;
        if !config.push_enabled {
            debug!("push disabled");
            return CycleOutcome::Skipped(SkipReason::Disabled);
        }
        if config.quiet_hours.contains(now.hour()) {
            info!(
                start = config.quiet_hours.start,
                end = config.quiet_hours.end,
                "inside quiet hours, skipping"
            );
            return CycleOutcome::Skipped(SkipReason::QuietHours);
        }

        let subscriptions = self.deps.subscriptions.snapshot().await;
        if subscriptions.is_empty() {
            debug!("no subscriptions");
            return CycleOutcome::Skipped(SkipReason::NoSubscriptions);
        }

        let mode = mode.unwrap_or(config.mode);
        let cycle = Cycle {
            session: config.session(),
            retry_budget: config.max_retries,
            delivery: DeliveryContext::from_config(&config),
            now: now.with_timezone(&Utc),
        };
        info!(?mode, sources = subscriptions.sources().len(), "starting push cycle");

        let outcome = match mode {
            PushMode::Immediate => self.run_immediate(&subscriptions, &cycle).await,
            PushMode::Batch => self.run_batch(&subscriptions, &cycle).await,
        };
        info!(outcome = %outcome, "push cycle finished");
        outcome
    }

    async fn run_immediate(&self, subscriptions: &SubscriptionSet, cycle: &Cycle) -> CycleOutcome {
        let routes = subscriptions.routes();
        let mut report = CycleReport::default();
        let mut health = CookieHealth::new();

        for (i, (source, destinations)) in routes.iter().enumerate() {
            if self.stopped() {
                return stopped_outcome();
            }
            match self.poll_source(source, cycle, &mut health, &mut report).await {
                Polled::CredentialsRefreshed => {
                    return CycleOutcome::Aborted(AbortReason::CredentialsRefreshed);
                }
                Polled::Fresh(result) => {
                    for destination in destinations {
                        if self.stopped() {
                            return stopped_outcome();
                        }
                        self.deliver(destination, source, &result.items, cycle, &mut report)
                            .await;
                    }
                }
                Polled::Stale | Polled::Failed => {}
            }

            if i + 1 < routes.len() && !self.pause(&self.pacing.inter_source).await {
                return stopped_outcome();
            }
        }

        self.finish(health, report).await
    }

    async fn run_batch(&self, subscriptions: &SubscriptionSet, cycle: &Cycle) -> CycleOutcome {
        let sources = subscriptions.sources();
        let mut report = CycleReport::default();
        let mut health = CookieHealth::new();
        let mut cache: HashMap<String, Vec<PostItem>> = HashMap::new();

        for (i, source) in sources.iter().enumerate() {
            if self.stopped() {
                return stopped_outcome();
            }
            let items = match self.poll_source(source, cycle, &mut health, &mut report).await {
                Polled::CredentialsRefreshed => {
                    return CycleOutcome::Aborted(AbortReason::CredentialsRefreshed);
                }
                Polled::Fresh(result) => result.items,
                Polled::Stale | Polled::Failed => Vec::new(),
            };
            cache.insert(source.clone(), items);

            if i + 1 < sources.len() && !self.pause(&self.pacing.inter_source).await {
                return stopped_outcome();
            }
        }

        if health.all_stale() {
            return self.finish(health, report).await;
        }

        for (destination, sources) in subscriptions.destinations() {
            for source in sources {
                let items = cache.get(source).map(Vec::as_slice).unwrap_or_default();
                if items.is_empty() {
                    continue;
                }
                if self.stopped() {
                    return stopped_outcome();
                }
                self.deliver(destination, source, items, cycle, &mut report)
                    .await;
            }
        }

        self.finish(health, report).await
    }

    async fn poll_source(
        &self,
        source: &str,
        cycle: &Cycle,
        health: &mut CookieHealth,
        report: &mut CycleReport,
    ) -> Polled {
        report.sources_polled += 1;
        match self
            .deps
            .poller
            .poll(source, &cycle.session, cycle.retry_budget)
            .await
        {
            Ok(result) if result.fresh => {
                health.record_fresh();
                Polled::Fresh(result)
            }
            Ok(_) => {
                warn!(source, "source returned stale data, skipping it");
                health.record_stale();
                report.sources_stale += 1;
                Polled::Stale
            }
            Err(e) if e.is_credentials_refreshed() => {
                info!(source, "credentials refreshed during poll, ending cycle");
                Polled::CredentialsRefreshed
            }
            Err(e) => {
                error!(source, error = %e, "failed to poll source");
                health.record_failure();
                report.sources_failed += 1;
                Polled::Failed
            }
        }
    }

    async fn deliver(
        &self,
        destination: &Destination,
        source: &str,
        items: &[PostItem],
        cycle: &Cycle,
        report: &mut CycleReport,
    ) {
        match self
            .deliverer
            .deliver(destination, items, &cycle.delivery, cycle.now)
            .await
        {
            Ok(DeliveryResult::Delivered) => report.delivered += 1,
            Ok(DeliveryResult::Suppressed) => report.suppressed += 1,
            Ok(DeliveryResult::AlreadyDelivered) => report.skipped_seen += 1,
            Ok(DeliveryResult::Failed { .. }) => report.failed += 1,
            Ok(DeliveryResult::NoItems) => {}
            Err(e) => {
                error!(%destination, source, error = %e, "delivery aborted");
                report.failed += 1;
            }
        }
    }

    /// End-of-cycle health check. Every stale source means nothing was
    /// delivered, so the cycle ends as aborted.
    async fn finish(&self, health: CookieHealth, report: CycleReport) -> CycleOutcome {
        match self.deps.ledger.purge_expired().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "dropped expired ledger records"),
            Err(e) => warn!(error = %e, "failed to purge expired ledger records"),
        }

        match health.conclude(self.deps.credentials.as_ref()).await {
            HealthVerdict::Refreshed { succeeded } => CycleOutcome::Aborted(AbortReason::AllStale {
                refresh_succeeded: succeeded,
            }),
            HealthVerdict::Healthy => CycleOutcome::Completed(report),
        }
    }
}

fn stopped_outcome() -> CycleOutcome {
    info!("stop requested, ending cycle early");
    CycleOutcome::Aborted(AbortReason::Stopped)
}

/// Settings fixed for the duration of one cycle.
struct Cycle {
    session: Session,
    retry_budget: u32,
    delivery: DeliveryContext,
    now: DateTime<Utc>,
}
