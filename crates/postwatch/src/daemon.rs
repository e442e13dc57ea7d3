//! Long-running push daemon.
//!
//! Runs three tasks until ctrl-c:
//!
//! - the push loop, one cycle per `check_interval_secs`; on shutdown the
//!   running cycle ends at its next gap between polls or deliveries
//! - a watcher reloading `config.toml` and `push.toml` when they change on disk
//! - an optional periodic credential refresh

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use postwatch_scheduler::{ConfigStore, CycleOutcome, PushScheduler, SubscriptionStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::{App, CONFIG_FILE, SUBSCRIPTIONS_FILE};

/// Editors often write a file in several steps; wait for them to settle.
const RELOAD_SETTLE: Duration = Duration::from_millis(500);

pub async fn run(app: App) -> Result<()> {
    let settings = app.config.snapshot().await;
    info!(
        check_interval_secs = settings.check_interval_secs,
        mode = ?settings.mode,
        enabled = settings.push_enabled,
        quiet_start = settings.quiet_hours.start,
        quiet_end = settings.quiet_hours.end,
        "starting postwatch daemon"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx_clone.send(true);
    });

    let app = Arc::new(app);
    let push_handle = spawn_push_loop(Arc::clone(&app), shutdown_rx.clone());

    let reload_handle = spawn_reload_watcher(
        &app.data_dir,
        Arc::clone(&app.config),
        Arc::clone(&app.subscriptions),
        shutdown_rx.clone(),
    )?;

    let refresh_handle = match settings.credentials.refresh_interval_minutes {
        0 => None,
        minutes => Some(spawn_credential_refresh(
            Arc::clone(&app.scheduler),
            Duration::from_secs(minutes * 60),
            shutdown_rx.clone(),
        )),
    };

    // Wait for shutdown
    let mut shutdown_rx = shutdown_rx;
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            break;
        }
    }

    app.scheduler.stop();
    let _ = push_handle.await;
    let _ = reload_handle.await;
    if let Some(handle) = refresh_handle {
        let _ = handle.await;
    }

    info!("daemon shut down gracefully");
    Ok(())
}

fn spawn_push_loop(app: Arc<App>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("push loop started");

        while !*shutdown_rx.borrow() {
            // Re-read every time so a reloaded interval takes effect.
            let wait = app.config.snapshot().await.check_interval();
            debug!(wait_secs = wait.as_secs(), "next push cycle scheduled");

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                _ = tokio::time::sleep(wait) => {}
            }

            match app.run_cycle(None).await {
                Ok(outcome) => log_outcome(&outcome),
                Err(e) => error!(error = %e, "push cycle failed to start"),
            }
        }

        info!("push loop stopped");
    })
}

pub(crate) fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Skipped(_) => debug!(%outcome, "push cycle"),
        CycleOutcome::Aborted(_) => warn!(%outcome, "push cycle"),
        CycleOutcome::Completed(_) => info!(%outcome, "push cycle"),
    }
}

/// Which store a changed file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reload {
    Config,
    Subscriptions,
}

fn classify(path: &Path) -> Option<Reload> {
    match path.file_name()?.to_str()? {
        CONFIG_FILE => Some(Reload::Config),
        SUBSCRIPTIONS_FILE => Some(Reload::Subscriptions),
        _ => None,
    }
}

fn spawn_reload_watcher(
    data_dir: &Path,
    config: Arc<ConfigStore>,
    subscriptions: Arc<SubscriptionStore>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let (tx, mut rx) = mpsc::channel::<PathBuf>(64);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_)
            ) {
                for path in event.paths {
                    // A full queue already holds a pending reload.
                    let _ = tx.try_send(path);
                }
            }
        }
        Err(e) => error!(error = %e, "file watcher error"),
    })
    .map_err(|e| miette::miette!("failed to create file watcher: {}", e))?;

    watcher
        .watch(data_dir, RecursiveMode::NonRecursive)
        .map_err(|e| miette::miette!("failed to watch {}: {}", data_dir.display(), e))?;

    let handle = tokio::spawn(async move {
        // Keep the watcher alive for as long as this task runs.
        let _watcher = watcher;
        info!("configuration watcher started");

        loop {
            let first = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }

                path = rx.recv() => match path {
                    Some(path) => path,
                    None => break,
                },
            };

            tokio::time::sleep(RELOAD_SETTLE).await;
            let mut pending = vec![first];
            while let Ok(path) = rx.try_recv() {
                pending.push(path);
            }

            let mut reload_config = false;
            let mut reload_subscriptions = false;
            for path in &pending {
                match classify(path) {
                    Some(Reload::Config) => reload_config = true,
                    Some(Reload::Subscriptions) => reload_subscriptions = true,
                    None => {}
                }
            }

            if reload_config {
                if let Err(e) = config.reload().await {
                    error!(error = %e, "failed to reload configuration");
                }
            }
            if reload_subscriptions {
                match subscriptions.reload().await {
                    Ok(()) => info!("subscriptions reloaded"),
                    Err(e) => error!(error = %e, "failed to reload subscriptions"),
                }
            }
        }

        info!("configuration watcher stopped");
    });

    Ok(handle)
}

fn spawn_credential_refresh(
    scheduler: Arc<PushScheduler>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(every_secs = every.as_secs(), "credential refresher started");
        let mut interval = tokio::time::interval(every);
        // The first tick fires immediately; the startup cookie is still fresh.
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = interval.tick() => {
                    if scheduler.deps().credentials.refresh(false).await {
                        info!("periodic credential refresh succeeded");
                    } else {
                        warn!("periodic credential refresh failed");
                    }
                }
            }
        }

        info!("credential refresher stopped");
    })
}
