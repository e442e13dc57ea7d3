//! End-to-end cycle tests with in-memory collaborators.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::*;
use postwatch_ledger::RetryOutcome;
use postwatch_scheduler::{
    AbortReason, CycleOutcome, CycleReport, DeliveryContext, DeliveryResult, Jitter,
    MessageShape, PacingPolicy, PushConfig, PushMode, QuietHours, SkipReason,
};

fn completed(outcome: CycleOutcome) -> CycleReport {
    match outcome {
        CycleOutcome::Completed(report) => report,
        other => panic!("expected a completed cycle, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delivers_newest_item_only() {
    let h = harness();
    h.subscribe(&group("1001"), "neo").await;
    h.forum.serve("neo", listing(true, &[(2, 5), (1, 600)]));

    let report = completed(h.scheduler.run_cycle_at(noon()).await);

    assert_eq!(report.delivered, 1);
    let sent = h.chat.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, group("1001"));
    assert!(sent[0].1.text.contains("Link: https://linux.do/t/topic-2/2"));
    assert_eq!(sent[0].1.shape, MessageShape::Plain);
    assert_eq!(h.renderer.urls(), vec!["https://linux.do/t/topic-2/2"]);
    assert!(h.is_delivered(&group("1001"), 2).await);
    // Older unseen posts are never backfilled.
    assert!(!h.is_delivered(&group("1001"), 1).await);
}

#[tokio::test]
async fn test_replayed_cycle_is_a_no_op() {
    let h = harness();
    h.subscribe(&group("1001"), "neo").await;
    h.forum.serve("neo", listing(true, &[(2, 5)]));

    completed(h.scheduler.run_cycle_at(noon()).await);
    let report = completed(h.scheduler.run_cycle_at(noon()).await);

    assert_eq!(report.delivered, 0);
    assert_eq!(report.skipped_seen, 1);
    assert_eq!(h.chat.sent().len(), 1);
    assert_eq!(h.renderer.renders(), 1);
}

#[tokio::test]
async fn test_batch_polls_shared_source_once() {
    let h = harness();
    h.subscribe(&group("1001"), "neo").await;
    h.subscribe(&direct("42"), "neo").await;
    h.forum.serve("neo", listing(true, &[(7, 1)]));

    let report = completed(h.scheduler.run_cycle_at(noon()).await);

    assert_eq!(h.forum.calls_for("neo"), 1);
    assert_eq!(report.sources_polled, 1);
    assert_eq!(report.delivered, 2);
    let targets: Vec<_> = h.chat.sent().into_iter().map(|(d, _)| d).collect();
    assert_eq!(targets, vec![group("1001"), direct("42")]);
    assert!(h.is_delivered(&group("1001"), 7).await);
    assert!(h.is_delivered(&direct("42"), 7).await);
}

#[tokio::test]
async fn test_immediate_mode_delivers_per_source() {
    let config = PushConfig {
        mode: PushMode::Immediate,
        ..test_config()
    };
    let h = harness_with(config, true);
    h.subscribe(&group("1"), "neo").await;
    h.subscribe(&group("1"), "trinity").await;
    h.subscribe(&group("2"), "neo").await;
    h.forum.serve("neo", listing(true, &[(10, 1)]));
    h.forum.serve("trinity", listing(true, &[(20, 1)]));

    let report = completed(h.scheduler.run_cycle_at(noon()).await);

    assert_eq!(report.delivered, 3);
    assert_eq!(h.forum.calls(), vec!["neo", "trinity"]);
    let sent: Vec<_> = h
        .chat
        .sent()
        .into_iter()
        .map(|(d, m)| (d, m.text.contains("/10")))
        .collect();
    assert_eq!(sent, vec![(group("1"), true), (group("2"), true), (group("1"), false)]);
}

#[tokio::test]
async fn test_all_stale_refreshes_once_and_delivers_nothing() {
    for mode in [PushMode::Batch, PushMode::Immediate] {
        let h = harness_with(PushConfig { mode, ..test_config() }, true);
        h.subscribe(&group("1"), "neo").await;
        h.subscribe(&group("1"), "trinity").await;
        h.forum.serve("neo", listing(false, &[(1, 1)]));
        h.forum.serve("trinity", listing(false, &[(2, 1)]));

        let outcome = h.scheduler.run_cycle_at(noon()).await;

        assert_eq!(
            outcome,
            CycleOutcome::Aborted(AbortReason::AllStale { refresh_succeeded: true }),
            "mode {mode:?}"
        );
        assert_eq!(h.credentials.refreshes(), 1);
        assert_eq!(h.renderer.renders(), 0);
        assert!(h.chat.sent().is_empty());
    }
}

#[tokio::test]
async fn test_failed_polls_count_as_stale() {
    let h = harness_with(test_config(), false);
    h.subscribe(&group("1"), "neo").await;
    h.forum.fail("neo", 500);

    let outcome = h.scheduler.run_cycle_at(noon()).await;

    assert_eq!(
        outcome,
        CycleOutcome::Aborted(AbortReason::AllStale { refresh_succeeded: false })
    );
    // One refresh from the exhausted poll, one from the health check.
    assert_eq!(h.credentials.refreshes(), 2);
    assert_eq!(h.forum.calls_for("neo"), 2);
}

#[tokio::test]
async fn test_credentials_refreshed_stops_the_cycle() {
    let h = harness();
    h.subscribe(&group("1"), "neo").await;
    h.subscribe(&group("1"), "trinity").await;
    h.forum.fail("neo", 403);
    h.forum.serve("trinity", listing(true, &[(2, 1)]));

    let outcome = h.scheduler.run_cycle_at(noon()).await;

    assert_eq!(outcome, CycleOutcome::Aborted(AbortReason::CredentialsRefreshed));
    assert_eq!(h.forum.calls_for("trinity"), 0);
    assert_eq!(h.credentials.refreshes(), 1);
    assert!(h.chat.sent().is_empty());
}

#[tokio::test]
async fn test_immediate_credentials_refresh_keeps_earlier_deliveries() {
    let h = harness_with(
        PushConfig {
            mode: PushMode::Immediate,
            ..test_config()
        },
        true,
    );
    h.subscribe(&group("1"), "trinity").await;
    h.subscribe(&group("1"), "neo").await;
    h.subscribe(&group("1"), "morpheus").await;
    h.forum.serve("trinity", listing(true, &[(2, 1)]));
    h.forum.fail("neo", 403);
    h.forum.serve("morpheus", listing(true, &[(3, 1)]));

    let outcome = h.scheduler.run_cycle_at(noon()).await;

    assert_eq!(outcome, CycleOutcome::Aborted(AbortReason::CredentialsRefreshed));
    assert_eq!(h.credentials.refreshes(), 1);
    assert_eq!(h.forum.calls_for("morpheus"), 0);
    // Sources before the refresh were already pushed.
    assert_eq!(h.chat.sent().len(), 1);
    assert!(h.is_delivered(&group("1"), 2).await);
    assert!(!h.is_delivered(&group("1"), 3).await);
}

#[tokio::test]
async fn test_batch_isolates_failing_source() {
    let h = harness_with(test_config(), false);
    h.subscribe(&group("1"), "neo").await;
    h.subscribe(&group("1"), "trinity").await;
    h.forum.fail("neo", 502);
    h.forum.serve("trinity", listing(true, &[(2, 1)]));

    let report = completed(h.scheduler.run_cycle_at(noon()).await);

    assert_eq!(report.sources_polled, 2);
    assert_eq!(report.sources_failed, 1);
    assert_eq!(report.delivered, 1);
    assert!(h.is_delivered(&group("1"), 2).await);
}

#[tokio::test]
async fn test_stale_source_is_not_delivered_from() {
    let h = harness();
    h.subscribe(&group("1"), "neo").await;
    h.subscribe(&group("1"), "trinity").await;
    h.forum.serve("neo", listing(false, &[(1, 1)]));
    h.forum.serve("trinity", listing(true, &[(2, 1)]));

    let report = completed(h.scheduler.run_cycle_at(noon()).await);

    assert_eq!(report.sources_stale, 1);
    assert_eq!(report.delivered, 1);
    assert!(!h.is_delivered(&group("1"), 1).await);
    assert_eq!(h.credentials.refreshes(), 0);
}

#[tokio::test]
async fn test_old_items_are_suppressed_without_render() {
    let config = PushConfig {
        ignore_older_than_minutes: 60,
        ..test_config()
    };
    let h = harness_with(config, true);
    h.subscribe(&group("1"), "neo").await;
    h.forum.serve("neo", listing(true, &[(3, 120)]));

    let report = completed(h.scheduler.run_cycle_at(noon()).await);

    assert_eq!(report.suppressed, 1);
    assert_eq!(h.renderer.renders(), 0);
    assert!(h.chat.sent().is_empty());
    assert!(h.is_delivered(&group("1"), 3).await);
}

#[tokio::test]
async fn test_render_fails_twice_then_succeeds() {
    let h = harness();
    let dest = group("1");
    h.subscribe(&dest, "neo").await;
    h.forum.serve("neo", listing(true, &[(5, 1)]));
    h.renderer.fail_next(2);

    let first = completed(h.scheduler.run_cycle_at(noon()).await);
    assert_eq!(first.failed, 1);
    assert_eq!(h.retry_count(&dest, 5).await, 1);

    let second = completed(h.scheduler.run_cycle_at(noon()).await);
    assert_eq!(second.failed, 1);
    assert_eq!(h.retry_count(&dest, 5).await, 2);

    let third = completed(h.scheduler.run_cycle_at(noon()).await);
    assert_eq!(third.delivered, 1);
    assert!(h.is_delivered(&dest, 5).await);
    assert_eq!(h.retry_count(&dest, 5).await, 2);
    assert_eq!(h.chat.sent().len(), 1);
}

#[tokio::test]
async fn test_retry_cap_stops_counting_but_not_attempting() {
    let h = harness();
    let dest = group("1");
    h.subscribe(&dest, "neo").await;
    h.forum.serve("neo", listing(true, &[(5, 1)]));
    h.renderer.fail_always();

    for _ in 0..6 {
        let report = completed(h.scheduler.run_cycle_at(noon()).await);
        assert_eq!(report.failed, 1);
    }

    assert_eq!(h.retry_count(&dest, 5).await, 3);
    assert_eq!(h.renderer.renders(), 6);
    assert!(!h.is_delivered(&dest, 5).await);
}

#[tokio::test]
async fn test_transport_failure_schedules_retry() {
    let h = harness();
    let dest = direct("42");
    h.subscribe(&dest, "neo").await;
    h.forum.serve("neo", listing(true, &[(8, 1)]));
    h.chat.reject.store(true, Ordering::SeqCst);

    let items = h
        .scheduler
        .deps()
        .poller
        .poll("neo", &Default::default(), 1)
        .await
        .unwrap()
        .items;
    let result = h
        .scheduler
        .deliverer()
        .deliver(&dest, &items, &DeliveryContext::default(), noon().with_timezone(&chrono::Utc))
        .await
        .unwrap();

    assert_eq!(
        result,
        DeliveryResult::Failed {
            retry: RetryOutcome::Scheduled { attempt: 1 }
        }
    );
    assert!(!h.is_delivered(&dest, 8).await);
}

#[tokio::test]
async fn test_aux_links_use_forward_shape() {
    let h = harness();
    h.subscribe(&group("1"), "neo").await;
    h.forum.serve("neo", listing(true, &[(9, 1)]));
    h.renderer
        .aux_links
        .lock()
        .unwrap()
        .push("https://cdk.linux.do/abc".to_string());

    completed(h.scheduler.run_cycle_at(noon()).await);

    let (_, message) = &h.chat.sent()[0];
    assert_eq!(message.shape, MessageShape::Forward);
    assert_eq!(message.aux_links, vec!["https://cdk.linux.do/abc"]);
}

#[tokio::test]
async fn test_quiet_hours_skip_without_fetching() {
    let h = harness();
    h.subscribe(&group("1"), "neo").await;
    h.forum.serve("neo", listing(true, &[(1, 1)]));

    let outcome = h.scheduler.run_cycle_at(at_hour(4)).await;

    assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::QuietHours));
    assert!(h.forum.calls().is_empty());
    assert!(h.chat.sent().is_empty());

    // The window is half-open.
    completed(h.scheduler.run_cycle_at(at_hour(6)).await);
}

#[tokio::test]
async fn test_disabled_push_and_empty_subscriptions_skip() {
    let h = harness_with(
        PushConfig {
            push_enabled: false,
            ..test_config()
        },
        true,
    );
    h.subscribe(&group("1"), "neo").await;
    assert_eq!(
        h.scheduler.run_cycle_at(noon()).await,
        CycleOutcome::Skipped(SkipReason::Disabled)
    );

    let h = harness();
    assert_eq!(
        h.scheduler.run_cycle_at(noon()).await,
        CycleOutcome::Skipped(SkipReason::NoSubscriptions)
    );
    assert!(h.forum.calls().is_empty());
}

#[tokio::test]
async fn test_overlapping_cycle_is_skipped() {
    let h = harness();
    h.subscribe(&group("1"), "neo").await;
    h.forum.serve("neo", listing(true, &[(1, 1)]));

    let hold = h.forum.hold.lock().await;
    let scheduler = h.scheduler.clone();
    let first = tokio::spawn(async move { scheduler.run_cycle_at(noon()).await });
    while !h.scheduler.is_running() {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        h.scheduler.run_cycle_at(noon()).await,
        CycleOutcome::Skipped(SkipReason::AlreadyRunning)
    );

    drop(hold);
    completed(first.await.unwrap());
    assert!(!h.scheduler.is_running());
}

#[tokio::test]
async fn test_mode_override() {
    let h = harness();
    h.subscribe(&group("1"), "neo").await;
    h.forum.serve("neo", listing(true, &[(1, 1)]));

    let report = completed(h.scheduler.run_cycle_with_mode(PushMode::Immediate).await);
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn test_clock_drives_quiet_hours() {
    let h = harness_with(
        PushConfig {
            quiet_hours: QuietHours { start: 11, end: 13 },
            ..test_config()
        },
        true,
    );
    h.subscribe(&group("1"), "neo").await;

    // The harness clock reads noon.
    assert_eq!(
        h.scheduler.run_cycle().await,
        CycleOutcome::Skipped(SkipReason::QuietHours)
    );
    assert!(h.forum.calls().is_empty());
}

fn paced_sources(mode: PushMode) -> Harness {
    harness_paced(
        PushConfig {
            mode,
            ..test_config()
        },
        true,
        PacingPolicy {
            inter_source: Jitter::new(Duration::from_secs(10), Duration::ZERO),
            inter_delivery: Jitter::ZERO,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_sources_are_paced_except_after_the_last() {
    for mode in [PushMode::Batch, PushMode::Immediate] {
        let h = paced_sources(mode);
        for (i, source) in ["neo", "trinity", "morpheus"].into_iter().enumerate() {
            h.subscribe(&group("1"), source).await;
            h.forum.serve(source, listing(true, &[(i as u64 + 1, 1)]));
        }

        let start = tokio::time::Instant::now();
        let report = completed(h.scheduler.run_cycle_at(noon()).await);

        assert_eq!(report.delivered, 3, "{mode:?}");
        assert_eq!(start.elapsed(), Duration::from_secs(20), "{mode:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_cycle_between_sources() {
    let h = paced_sources(PushMode::Immediate);
    h.subscribe(&group("1"), "neo").await;
    h.subscribe(&group("1"), "trinity").await;
    h.forum.serve("neo", listing(true, &[(1, 1)]));
    h.forum.serve("trinity", listing(true, &[(2, 1)]));

    let scheduler = h.scheduler.clone();
    let cycle = tokio::spawn(async move { scheduler.run_cycle_at(noon()).await });
    // Time stands still while this task keeps yielding, so the cycle is
    // parked in the pause after the first source.
    while h.chat.sent().is_empty() {
        tokio::task::yield_now().await;
    }
    h.scheduler.stop();

    assert_eq!(cycle.await.unwrap(), CycleOutcome::Aborted(AbortReason::Stopped));
    assert_eq!(h.forum.calls(), vec!["neo"]);
    assert!(h.is_delivered(&group("1"), 1).await);

    // Later cycles end before polling anything.
    assert_eq!(
        h.scheduler.run_cycle_at(noon()).await,
        CycleOutcome::Aborted(AbortReason::Stopped)
    );
    assert_eq!(h.forum.calls(), vec!["neo"]);
}
