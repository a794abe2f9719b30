//! Restore coordinator tests.
//!
//! Tests for restore-related functionality including:
//! - Round-trip fidelity of keys, values, headers and timestamps
//! - Integrity checks before the first produce
//! - Partition strategies
//! - Per-record failure accounting

use std::time::Duration;

use bytes::Bytes;
use kafka_recovery_core::broker::KeyPartitioner;
use kafka_recovery_core::error::ErrorKind;
use kafka_recovery_core::{
    BackupRequest, Error, PartitionStrategy, ReplayStatus, RestoreCoordinator, RestoreRequest,
    RetryPolicy,
};

use super::helpers::{content, seed_rich_topic, seed_topic, Harness, SOURCE, TARGET};

// ============================================================================
// Round-trip Tests
// ============================================================================

#[tokio::test]
async fn restore_reproduces_records_in_order() {
    let h = Harness::new();
    seed_rich_topic(&h.source, "orders", 3, 60).await;
    h.target.create_topic("orders-restored", 3);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    let report = h
        .restore()
        .restore(
            RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET)
                .with_strategy(PartitionStrategy::Preserve),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.messages_restored, 180);
    assert!(report.restore_id.starts_with("restore-"));
    for p in 0..3 {
        let original = h.source.records("orders", p);
        let restored = h.target.records("orders-restored", p);
        assert_eq!(content(&restored), content(&original), "partition {}", p);
    }
}

#[tokio::test]
async fn headers_and_timestamps_can_be_dropped() {
    let h = Harness::new();
    seed_rich_topic(&h.source, "orders", 1, 10).await;
    h.target.create_topic("orders-restored", 1);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    assert!(manifest.include_headers);

    let mut request = RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET);
    request.include_headers = false;
    request.preserve_timestamps = false;
    h.restore().restore(request).await.unwrap();

    let restored = h.target.records("orders-restored", 0);
    assert_eq!(restored.len(), 10);
    assert!(restored.iter().all(|r| r.headers.is_empty()));
    assert!(restored.iter().all(|r| r.timestamp > 1_700_000_001_000));
}

#[tokio::test]
async fn key_hash_spreads_records_over_a_wider_topic() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 50);
    h.target.create_topic("orders-wide", 5);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    let report = h
        .restore()
        .restore(RestoreRequest::new(&manifest.backup_id, "orders-wide", TARGET))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(h.target.message_count("orders-wide"), 100);

    let partitioner = KeyPartitioner::new();
    for p in 0..5 {
        for record in h.target.records("orders-wide", p) {
            let key = record.key.as_deref();
            assert_eq!(partitioner.partition(key, 5), p);
        }
    }
}

#[tokio::test]
async fn partition_filter_restores_only_selected_partitions() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 3, 10);
    h.target.create_topic("orders-restored", 3);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    let report = h
        .restore()
        .restore(
            RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET)
                .with_strategy(PartitionStrategy::Preserve)
                .with_partitions(vec![2]),
        )
        .await
        .unwrap();

    assert_eq!(report.partitions.len(), 1);
    assert_eq!(report.partitions[0].partition, 2);
    assert_eq!(h.target.records("orders-restored", 2).len(), 10);
    assert!(h.target.records("orders-restored", 0).is_empty());

    let err = h
        .restore()
        .restore(
            RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET)
                .with_partitions(vec![9]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

// ============================================================================
// Integrity Tests
// ============================================================================

#[tokio::test]
async fn flipped_byte_aborts_before_any_produce() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 40);
    h.target.create_topic("orders-restored", 2);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();

    let key = manifest.segment(1).unwrap().file_path.clone();
    let mut data = h.storage.get(&key).await.unwrap().to_vec();
    let middle = data.len() / 2;
    data[middle] ^= 0xFF;
    h.storage.put(&key, Bytes::from(data)).await.unwrap();

    let err = h
        .restore()
        .restore(RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CorruptBackup(_)), "{}", err);
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(h.target.produce_calls(), 0);
    assert_eq!(h.target.message_count("orders-restored"), 0);
}

#[tokio::test]
async fn corrupt_segment_fails_its_partition_when_validation_is_skipped() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 40);
    h.target.create_topic("orders-restored", 2);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();

    let key = manifest.segment(0).unwrap().file_path.clone();
    let mut data = h.storage.get(&key).await.unwrap().to_vec();
    let middle = data.len() / 2;
    data[middle] ^= 0x01;
    h.storage.put(&key, Bytes::from(data)).await.unwrap();

    let mut request = RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET)
        .with_strategy(PartitionStrategy::Preserve);
    request.validate_checksum = false;
    let report = h.restore().restore(request).await.unwrap();

    assert_eq!(report.status, ReplayStatus::PartialSuccess);
    assert_eq!(report.messages_restored, 40);
    assert_eq!(report.messages_failed, 40);
    assert!(h.target.records("orders-restored", 0).is_empty());
    assert!(report.partitions[0].last_error.is_some());
}

#[tokio::test]
async fn missing_segment_file_is_corruption() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 5);
    h.target.create_topic("orders-restored", 2);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    h.storage
        .delete(&manifest.segment(0).unwrap().file_path)
        .await
        .unwrap();

    let err = h
        .restore()
        .restore(RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CorruptBackup(_)));
    assert_eq!(h.target.produce_calls(), 0);
}

#[tokio::test]
async fn unknown_backup_is_not_found() {
    let h = Harness::new();
    h.target.create_topic("orders-restored", 1);

    let err = h
        .restore()
        .restore(RestoreRequest::new("orders-nope", "orders-restored", TARGET))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BackupNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============================================================================
// Target Topic Tests
// ============================================================================

#[tokio::test]
async fn preserve_into_a_narrower_topic_is_rejected() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 3, 5);
    h.target.create_topic("orders-narrow", 2);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    let err = h
        .restore()
        .restore(
            RestoreRequest::new(&manifest.backup_id, "orders-narrow", TARGET)
                .with_strategy(PartitionStrategy::Preserve),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(h.target.produce_calls(), 0);
}

#[tokio::test]
async fn missing_target_topic_is_not_created() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 5);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    let err = h
        .restore()
        .restore(RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.target.message_count("orders-restored"), 0);
}

// ============================================================================
// Failure Accounting Tests
// ============================================================================

#[tokio::test]
async fn rejected_record_is_counted_and_the_rest_land() {
    let h = Harness::new();
    h.source.create_topic("orders", 1);
    for i in 0..20u64 {
        let value = if i == 7 { vec![b'x'; 4096] } else { vec![b'v'; 16] };
        h.source
            .append("orders", 0, Some(format!("k{}", i).as_bytes()), Some(&value))
            .unwrap();
    }
    h.target.create_topic("orders-restored", 1);
    h.target.reject_values_over(1024);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    let report = h
        .restore()
        .restore(RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET))
        .await
        .unwrap();

    assert_eq!(report.status, ReplayStatus::PartialSuccess);
    assert_eq!(report.messages_restored, 19);
    assert_eq!(report.messages_failed, 1);
    assert_eq!(report.partitions[0].failed_offsets, vec![7]);
    assert_eq!(h.target.message_count("orders-restored"), 19);
}

#[tokio::test]
async fn transient_produce_errors_are_retried() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 30);
    h.target.create_topic("orders-restored", 1);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
    h.target.fail_next_produces(1);

    let report = h
        .restore()
        .restore(RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(h.target.message_count("orders-restored"), 30);
}

#[tokio::test(start_paused = true)]
async fn deadline_marks_unsent_records_skipped() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 200);
    h.target.create_topic("orders-restored", 1);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();

    // every batch fails long enough for the deadline to pass
    h.target.fail_next_produces(u32::MAX);
    let restore = RestoreCoordinator::new(&h.config, h.storage.clone(), h.clusters.clone())
        .with_retry(RetryPolicy::new(
            10,
            Duration::from_millis(500),
            1.0,
            Duration::from_millis(500),
        ));
    let report = restore
        .restore(
            RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET)
                .with_deadline(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    assert_eq!(report.status, ReplayStatus::TimedOut);
    assert!(report.messages_skipped > 0);
    assert_eq!(
        report.messages_restored + report.messages_failed + report.messages_skipped,
        200
    );
}
