//! Drain monitor tests.
//!
//! Runs monitors through `RecoveryService` on paused time so polls,
//! debounce and timeouts are deterministic.

use std::time::Duration;

use kafka_recovery_core::{DrainOptions, DrainStatus, Error};

use super::helpers::{seed_topic, Harness, SOURCE};

fn options(debounce: u32, max_lag: u64, timeout_ms: u64) -> DrainOptions {
    DrainOptions {
        timeout: Duration::from_millis(timeout_ms),
        poll_interval: Duration::from_millis(20),
        max_lag,
        debounce,
    }
}

#[tokio::test(start_paused = true)]
async fn group_that_catches_up_is_drained_after_debounce() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 10);
    h.source.commit_offset("billing", "orders", 0, 0);
    h.source.commit_offset("billing", "orders", 1, 4);
    let service = h.service();

    let id = service
        .start_drain_monitor(SOURCE, "billing", "orders", Some(options(2, 0, 10_000)))
        .unwrap();
    assert!(id.starts_with("drain-"));

    let source = h.source.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(70)).await;
        source.commit_offset("billing", "orders", 0, 10);
        source.commit_offset("billing", "orders", 1, 10);
    });

    let state = service.wait_drain(&id).await.unwrap();
    assert_eq!(state.status, DrainStatus::Drained);
    assert_eq!(state.total_lag_start, Some(16));
    assert_eq!(state.total_lag_end, Some(0));
    assert_eq!(state.lag_start.get(&0), Some(&10));
    assert_eq!(state.lag_start.get(&1), Some(&6));
    assert_eq!(state.consecutive_drained_polls, 2);
    assert!(state.polls >= 5);
}

#[tokio::test(start_paused = true)]
async fn lag_within_threshold_counts_as_drained() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 10);
    h.source.commit_offset("billing", "orders", 0, 7);
    let service = h.service();

    let id = service
        .start_drain_monitor(SOURCE, "billing", "orders", Some(options(3, 5, 10_000)))
        .unwrap();
    let state = service.wait_drain(&id).await.unwrap();

    assert_eq!(state.status, DrainStatus::Drained);
    assert_eq!(state.polls, 3);
    assert_eq!(state.total_lag(), 3);
}

#[tokio::test(start_paused = true)]
async fn group_without_commits_lags_by_the_high_watermark() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 8);
    h.source.create_group("idle");
    let service = h.service();

    let id = service
        .start_drain_monitor(SOURCE, "idle", "orders", Some(options(1, 0, 100)))
        .unwrap();
    let state = service.wait_drain(&id).await.unwrap();

    assert_eq!(state.status, DrainStatus::TimedOut);
    assert_eq!(state.total_lag(), 16);
    assert_eq!(state.per_partition_lag.get(&1), Some(&8));
}

#[tokio::test(start_paused = true)]
async fn transient_lag_errors_are_retried() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 3);
    h.source.commit_offset("billing", "orders", 0, 3);
    h.source.fail_next_offset_fetches(1);
    let service = h.service();

    let id = service
        .start_drain_monitor(SOURCE, "billing", "orders", Some(options(1, 0, 10_000)))
        .unwrap();
    let state = service.wait_drain(&id).await.unwrap();

    assert_eq!(state.status, DrainStatus::Drained);
    assert!(state.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn unknown_group_ends_in_error() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 3);
    let service = h.service();

    let id = service
        .start_drain_monitor(SOURCE, "ghost", "orders", Some(options(1, 0, 10_000)))
        .unwrap();
    let state = service.wait_drain(&id).await.unwrap();

    assert_eq!(state.status, DrainStatus::Error);
    assert!(state.error.unwrap().contains("ghost"));
    assert!(service.get_drain_status(&id).is_err());
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_drops_the_monitor() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 10);
    h.source.commit_offset("billing", "orders", 0, 0);
    let service = h.service();

    let id = service
        .start_drain_monitor(SOURCE, "billing", "orders", Some(options(1, 0, 60_000)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let state = service.stop_drain_monitor(&id).unwrap().expect("first stop");
    assert_eq!(state.status, DrainStatus::Draining);
    assert!(state.polls >= 1);
    assert_eq!(state.total_lag(), 10);

    assert!(service.stop_drain_monitor(&id).unwrap().is_none());
    assert!(matches!(
        service.get_drain_status(&id),
        Err(Error::OperationNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn terminal_state_is_handed_out_once() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 4);
    h.source.commit_offset("billing", "orders", 0, 4);
    let service = h.service();

    let id = service
        .start_drain_monitor(SOURCE, "billing", "orders", Some(options(1, 0, 10_000)))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let state = service.get_drain_status(&id).unwrap();
    assert_eq!(state.status, DrainStatus::Drained);
    assert!(matches!(
        service.get_drain_status(&id),
        Err(Error::OperationNotFound(_))
    ));
    assert!(matches!(
        service.wait_drain(&id).await,
        Err(Error::OperationNotFound(_))
    ));
}

#[tokio::test]
async fn drain_requests_are_validated() {
    let h = Harness::new();
    let service = h.service();

    assert!(matches!(
        service.start_drain_monitor(SOURCE, "", "orders", None),
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        service.start_drain_monitor("elsewhere", "billing", "orders", None),
        Err(Error::UnknownCluster(_))
    ));
    assert!(matches!(
        service.get_drain_status("drain-unknown"),
        Err(Error::OperationNotFound(_))
    ));
}
