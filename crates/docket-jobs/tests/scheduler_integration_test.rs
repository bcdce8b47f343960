//! Integration tests for the batch scheduler driving the job tracker.
//!
//! Covers:
//! - Each termination reason (iterations, threshold, exhausted pool, cancel)
//! - Strict slot isolation between abnormal and normal lanes
//! - Round failure and round timeout surfacing as errors, even when a
//!   round's starts hang or its executor ignores cancellation
//! - Single-run enforcement per scheduler instance

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use docket_jobs::mock::{InMemoryCandidates, MockJobService, MockStep};
use docket_jobs::{
    AbnormalReason, BatchScheduler, Error, JobKind, JobTracker, PollResult, Result,
    RoundExecutor, RoundReport, RoundSelection, SchedulerConfig, SchedulerEvent,
    TerminationReason, TrackerConfig, TrackerExecutor,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn docs(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("doc-{i:02}")).collect()
}

/// Pool of `n` documents with the first `flagged` marked abnormal, oldest first.
fn candidates(n: usize, flagged: usize) -> InMemoryCandidates {
    let candidates = InMemoryCandidates::new(docs(n));
    let base = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
    for (i, id) in docs(flagged).into_iter().enumerate() {
        candidates.flag_at(id, AbnormalReason::UnderAnnotated, base + chrono::Duration::minutes(i as i64));
    }
    candidates
}

fn scheduler(
    config: SchedulerConfig,
    candidates: &InMemoryCandidates,
    service: &MockJobService,
) -> BatchScheduler {
    let tracker = JobTracker::new(
        Arc::new(service.clone()),
        TrackerConfig::default().with_poll_interval(100),
    );
    let executor = TrackerExecutor::new(tracker, JobKind::Tagging);
    BatchScheduler::new(config, Arc::new(candidates.clone()), Arc::new(executor))
}

fn sticky_running() -> Vec<MockStep> {
    vec![MockStep::Status(PollResult::running(10))]
}

/// Executor that never finishes a round and ignores cancellation.
struct StuckExecutor;

#[async_trait]
impl RoundExecutor for StuckExecutor {
    async fn execute_round(
        &self,
        _selection: &RoundSelection,
        _cancel: CancellationToken,
    ) -> Result<RoundReport> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_runs_exactly_max_iterations_when_pool_stays_abnormal() {
    let pool = candidates(50, 20);
    let service = MockJobService::new();
    let config = SchedulerConfig::new(10, 3, 3, 10.0, true).unwrap();
    let scheduler = scheduler(config, &pool, &service);

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.reason, TerminationReason::MaxIterationsReached);
    assert_eq!(summary.rounds.len(), 3);

    let mut seen_normal = std::collections::HashSet::new();
    for (i, round) in summary.rounds.iter().enumerate() {
        assert_eq!(round.iteration, i as u32 + 1);
        assert_eq!(round.selected_abnormal_count, 3);
        assert_eq!(round.selected_normal_count, 7);
        assert!((round.pool_abnormal_ratio - 0.4).abs() < 1e-9);
        for id in &round.normal_items {
            assert!(seen_normal.insert(id.clone()), "{id} drawn twice");
        }
    }
    // flags are never cleared here, so the same oldest three come back
    assert_eq!(summary.rounds[2].abnormal_items, vec!["doc-00", "doc-01", "doc-02"]);
}

#[tokio::test(start_paused = true)]
async fn test_unused_abnormal_slots_are_not_borrowed() {
    let pool = candidates(20, 1);
    let service = MockJobService::new();
    let config = SchedulerConfig::new(10, 3, 1, 0.0, false).unwrap();
    let scheduler = scheduler(config, &pool, &service);

    let summary = scheduler.run().await.unwrap();
    let round = &summary.rounds[0];
    assert_eq!(round.abnormal_slots, 3);
    assert_eq!(round.normal_slots, 7);
    assert_eq!(round.selected_abnormal_count, 1);
    assert_eq!(round.selected_normal_count, 7);
    assert_eq!(round.processed(), 8);
    assert_eq!(service.begun_targets().len(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_stops_when_pool_is_exhausted() {
    let pool = candidates(5, 0);
    let service = MockJobService::new();
    let config = SchedulerConfig::new(10, 3, 5, 0.0, false).unwrap();
    let scheduler = scheduler(config, &pool, &service);

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.reason, TerminationReason::ExhaustedPool);
    assert_eq!(summary.rounds.len(), 1);
    assert_eq!(summary.rounds[0].selected_normal_count, 5);
}

#[tokio::test(start_paused = true)]
async fn test_empty_pool_terminates_before_any_round() {
    let pool = InMemoryCandidates::default();
    let service = MockJobService::new();
    let scheduler = scheduler(SchedulerConfig::default(), &pool, &service);

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.reason, TerminationReason::ExhaustedPool);
    assert!(summary.rounds.is_empty());
    assert!(service.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stops_early_once_threshold_is_reached() {
    let pool = candidates(20, 4);
    let resolver = pool.clone();
    let service = MockJobService::new().with_completion_hook(move |id, _| {
        resolver.resolve(id);
    });
    let config = SchedulerConfig::new(10, 3, 5, 10.0, true).unwrap();
    let scheduler = scheduler(config, &pool, &service);

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.reason, TerminationReason::ThresholdReached);
    assert_eq!(summary.rounds.len(), 1);
    // one flag left out of twenty documents
    assert!((summary.rounds[0].pool_abnormal_ratio - 0.05).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_failed_job_fails_the_round() {
    let pool = candidates(10, 0);
    let service = MockJobService::new()
        .with_script("doc-03", vec![MockStep::Status(PollResult::failed("OOM"))]);
    let config = SchedulerConfig::new(5, 0, 5, 0.0, false).unwrap();
    let scheduler = scheduler(config, &pool, &service);
    let mut events = scheduler.subscribe();

    let err = scheduler.run().await.unwrap_err();
    match err {
        Error::RoundFailed { iteration, cause } => {
            assert_eq!(iteration, 1);
            assert!(cause.contains("doc-03"), "{cause}");
            assert!(cause.contains("OOM"), "{cause}");
        }
        other => panic!("expected RoundFailed, got {other:?}"),
    }
    assert!(matches!(events.try_recv(), Ok(SchedulerEvent::Failed(_))));
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_start_fails_the_round() {
    let pool = candidates(4, 0);
    let service = MockJobService::new().fail_begin_for("doc-01");
    let config = SchedulerConfig::new(4, 0, 1, 0.0, false).unwrap();
    let scheduler = scheduler(config, &pool, &service);

    let err = scheduler.run().await.unwrap_err();
    assert!(matches!(err, Error::RoundFailed { iteration: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_slow_round_times_out() {
    let pool = candidates(6, 0);
    let service = MockJobService::new().with_default_script(sticky_running());
    let config = SchedulerConfig::new(3, 0, 5, 0.0, false)
        .unwrap()
        .with_round_timeout_ms(1_000)
        .unwrap();
    let scheduler = scheduler(config, &pool, &service);

    let err = scheduler.run().await.unwrap_err();
    assert!(matches!(
        err,
        Error::RoundTimeout {
            iteration: 1,
            timeout_ms: 1_000
        }
    ));
    assert!(err.is_retryable());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(service.cancelled_jobs().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_round_times_out_while_a_start_hangs() {
    let pool = candidates(4, 0);
    let service = MockJobService::new()
        .with_default_script(sticky_running())
        .hold_begin_for("doc-01", Arc::new(Notify::new()));
    let config = SchedulerConfig::new(4, 0, 5, 0.0, false)
        .unwrap()
        .with_round_timeout_ms(1_000)
        .unwrap();
    let scheduler = scheduler(config, &pool, &service);

    let err = tokio::time::timeout(Duration::from_secs(60), scheduler.run())
        .await
        .expect("run outlived its round timeout")
        .unwrap_err();
    assert!(matches!(
        err,
        Error::RoundTimeout {
            iteration: 1,
            timeout_ms: 1_000
        }
    ));
    assert!(!scheduler.is_running());

    // the three starts that went through are cancelled remotely
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(service.begun_targets().len(), 4);
    assert_eq!(service.cancelled_jobs().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_round_ignoring_cancellation_is_abandoned() {
    let pool = candidates(4, 0);
    let config = SchedulerConfig::new(2, 0, 5, 0.0, false)
        .unwrap()
        .with_round_timeout_ms(1_000)
        .unwrap();
    let scheduler = BatchScheduler::new(config, Arc::new(pool), Arc::new(StuckExecutor));
    let mut events = scheduler.subscribe();

    let started = Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(60), scheduler.run())
        .await
        .expect("run outlived its round timeout")
        .unwrap_err();
    assert!(matches!(err, Error::RoundTimeout { iteration: 1, .. }));
    // timeout plus the cancellation grace period
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(6_000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(7_000), "{elapsed:?}");
    assert!(matches!(events.try_recv(), Ok(SchedulerEvent::Failed(_))));
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_only_touches_the_current_round() {
    let pool = InMemoryCandidates::new(["a", "b", "c", "d"]);
    let service = MockJobService::new()
        .with_script("c", sticky_running())
        .with_script("d", sticky_running());
    let config = SchedulerConfig::new(2, 0, 5, 0.0, false).unwrap();
    let scheduler = Arc::new(scheduler(config, &pool, &service));
    let mut events = scheduler.subscribe();

    let running = scheduler.clone();
    let run = tokio::spawn(async move { running.run().await });

    match events.recv().await.unwrap() {
        SchedulerEvent::RoundComplete(round) => assert_eq!(round.normal_items, vec!["a", "b"]),
        other => panic!("expected first round, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    scheduler.cancel();

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.reason, TerminationReason::Cancelled);
    assert_eq!(summary.rounds.len(), 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut cancelled = service.cancelled_jobs();
    cancelled.sort();
    assert_eq!(cancelled, vec!["job-3", "job-4"]);
    assert!(matches!(
        events.recv().await.unwrap(),
        SchedulerEvent::Terminated(TerminationReason::Cancelled)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_second_concurrent_run_is_rejected() {
    let pool = candidates(4, 0);
    let service = MockJobService::new().with_default_script(sticky_running());
    let config = SchedulerConfig::new(2, 0, 5, 0.0, false).unwrap();
    let scheduler = Arc::new(scheduler(config, &pool, &service));

    let running = scheduler.clone();
    let run = tokio::spawn(async move { running.run().await });
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(scheduler.is_running());

    assert!(matches!(scheduler.run().await, Err(Error::SchedulerBusy)));

    scheduler.cancel();
    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.reason, TerminationReason::Cancelled);
    assert!(!scheduler.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_round_callbacks_fire_per_round() {
    let pool = candidates(30, 10);
    let service = MockJobService::new();
    let config = SchedulerConfig::new(5, 2, 4, 10.0, true).unwrap();
    let scheduler = scheduler(config, &pool, &service);

    let rounds_seen = Arc::new(AtomicUsize::new(0));
    let counter = rounds_seen.clone();
    scheduler.on_round_complete(move |round| {
        assert_eq!(round.abnormal_slots + round.normal_slots, 5);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let summary = scheduler.run().await.unwrap();
    assert_eq!(summary.reason, TerminationReason::MaxIterationsReached);
    assert_eq!(rounds_seen.load(Ordering::SeqCst), 4);
}

#[test]
fn test_slot_invariant_holds_after_every_config_change() {
    let mut config = SchedulerConfig::default();
    let check = |c: &SchedulerConfig| assert_eq!(c.abnormal_slots() + c.normal_slots(), c.batch_size());

    check(&config);
    config.set_batch_size(4).unwrap();
    check(&config);
    assert!(config.set_abnormal_slots(5).is_err());
    check(&config);
    config.set_abnormal_slots(4).unwrap();
    check(&config);
    assert!(config.set_batch_size(3).is_err());
    check(&config);
    config.set_batch_size(25).unwrap();
    check(&config);
    assert_eq!(config.normal_slots(), 21);
}
