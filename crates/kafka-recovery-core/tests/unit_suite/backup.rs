//! Backup coordinator tests.
//!
//! Tests for backup-related functionality including:
//! - Snapshot boundaries and message caps
//! - Partial failure accounting
//! - Per-topic locking
//! - Manifest persistence and validation

use std::sync::Arc;

use kafka_recovery_core::config::CompressionType;
use kafka_recovery_core::error::ErrorKind;
use kafka_recovery_core::{
    list_backups, load_manifest, validate_backup, BackupRequest, BackupStatus, Error,
    FilesystemBackend, PartitionStrategy, ReplayStatus, RestoreRequest,
};
use tempfile::TempDir;

use super::helpers::{seed_topic, Harness, SOURCE, TARGET};

// ============================================================================
// Snapshot Tests
// ============================================================================

#[tokio::test]
async fn backup_captures_every_partition_up_to_the_snapshot() {
    let h = Harness::new();
    seed_topic(&h.source, "payments", 3, 40);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("payments", SOURCE))
        .await
        .unwrap();

    assert_eq!(manifest.status, BackupStatus::Success);
    assert_eq!(manifest.partition_count, 3);
    assert_eq!(manifest.segments.len(), 3);
    assert_eq!(manifest.total_messages, 120);
    assert!(manifest.backup_id.starts_with("payments-"));
    for segment in &manifest.segments {
        assert_eq!(segment.start_offset, 0);
        assert_eq!(segment.end_offset, 40);
        assert_eq!(segment.high_watermark, 40);
        assert!(segment.is_complete());
    }
    manifest.verify().unwrap();

    let stored = load_manifest(h.storage.as_ref(), &manifest.backup_id)
        .await
        .unwrap();
    assert_eq!(stored, manifest);
}

#[tokio::test]
async fn orders_example_caps_messages_and_restores_exactly() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 500);
    h.target.create_topic("orders-restored", 2);

    let manifest = h
        .backup()
        .backup(
            BackupRequest::new("orders", SOURCE)
                .with_compression(CompressionType::Gzip)
                .with_max_messages(500),
        )
        .await
        .unwrap();

    assert!(manifest.total_messages <= 500);
    assert_eq!(manifest.segments.len(), 2);
    assert_eq!(manifest.compression, CompressionType::Gzip);

    let validation = validate_backup(h.storage.as_ref(), &manifest.backup_id, true)
        .await
        .unwrap();
    assert!(validation.is_valid(), "{:?}", validation.issues);
    assert_eq!(validation.segments_valid, 2);

    let report = h
        .restore()
        .restore(RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET))
        .await
        .unwrap();

    assert_eq!(report.status, ReplayStatus::Success);
    assert_eq!(report.messages_restored, manifest.total_messages);
    assert_eq!(report.messages_failed, 0);
    assert_eq!(h.target.message_count("orders-restored"), manifest.total_messages);
}

#[tokio::test]
async fn records_appended_after_the_snapshot_are_not_captured() {
    let h = Harness::new();
    seed_topic(&h.source, "events", 1, 30);
    h.source.set_max_records_per_fetch(5);

    let job = h.backup().begin(BackupRequest::new("events", SOURCE)).unwrap();
    let source = h.source.clone();
    let writer = tokio::spawn(async move {
        for i in 0..30u8 {
            source.append("events", 0, Some(&[i]), Some(b"late")).unwrap();
            tokio::task::yield_now().await;
        }
    });

    let manifest = job.run().await.unwrap();
    writer.await.unwrap();

    let segment = manifest.segment(0).unwrap();
    assert_eq!(segment.end_offset, segment.high_watermark);
    assert_eq!(segment.message_count, segment.high_watermark);
    assert!(segment.high_watermark >= 30);
}

#[tokio::test]
async fn resume_offset_below_log_start_is_clamped() {
    let h = Harness::new();
    seed_topic(&h.source, "audit", 1, 20);
    h.source.truncate_before("audit", 0, 5);

    let mut request = BackupRequest::new("audit", SOURCE);
    request.start_offsets.insert(0, 2);
    let manifest = h.backup().backup(request).await.unwrap();

    let segment = manifest.segment(0).unwrap();
    assert_eq!(segment.start_offset, 5);
    assert_eq!(segment.end_offset, 20);
    assert_eq!(segment.message_count, 15);
}

#[tokio::test]
async fn empty_partitions_produce_empty_segments() {
    let h = Harness::new();
    h.source.create_topic("quiet", 2);
    h.source.append("quiet", 1, Some(b"k"), Some(b"v")).unwrap();

    let manifest = h
        .backup()
        .backup(BackupRequest::new("quiet", SOURCE))
        .await
        .unwrap();

    assert_eq!(manifest.status, BackupStatus::Success);
    assert_eq!(manifest.segment(0).unwrap().message_count, 0);
    assert_eq!(manifest.segment(1).unwrap().message_count, 1);
}

// ============================================================================
// Failure Accounting Tests
// ============================================================================

#[tokio::test]
async fn failing_partition_yields_partial_backup_and_partial_restore() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 3, 25);
    h.source.fail_fetches("orders", 1);
    h.target.create_topic("orders-restored", 3);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();

    assert_eq!(manifest.status, BackupStatus::Partial);
    assert_eq!(manifest.segments.len(), 2);
    assert!(manifest.segment(1).is_none());
    assert_eq!(manifest.failed_partitions.len(), 1);
    let failure = &manifest.failed_partitions[0];
    assert_eq!(failure.partition, 1);
    assert_eq!(failure.kind, ErrorKind::Transient);
    assert_eq!(failure.attempts, h.config.retry.max_attempts);
    assert_eq!(manifest.total_messages, 50);

    let report = h
        .restore()
        .restore(
            RestoreRequest::new(&manifest.backup_id, "orders-restored", TARGET)
                .with_strategy(PartitionStrategy::Preserve),
        )
        .await
        .unwrap();

    assert_eq!(report.status, ReplayStatus::PartialSuccess);
    assert_eq!(report.missing_partitions, vec![1]);
    assert_eq!(report.messages_restored, 50);
    assert_eq!(h.target.records("orders-restored", 1).len(), 0);
}

#[tokio::test]
async fn unknown_topic_fails_before_anything_is_written() {
    let h = Harness::new();

    let err = h
        .backup()
        .backup(BackupRequest::new("missing", SOURCE))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TopicNotFound(_)));
    assert!(list_backups(h.storage.as_ref()).await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_source_is_a_transient_error() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 5);
    h.source.set_unreachable(true);

    let err = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(err.kind(), ErrorKind::Transient);
}

// ============================================================================
// Locking Tests
// ============================================================================

#[tokio::test]
async fn concurrent_backup_of_the_same_topic_is_rejected() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 10);
    let coordinator = h.backup();

    let first = coordinator.begin(BackupRequest::new("orders", SOURCE)).unwrap();
    let err = coordinator
        .begin(BackupRequest::new("orders", SOURCE))
        .err()
        .unwrap();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // a different topic is not blocked
    seed_topic(&h.source, "payments", 1, 1);
    coordinator
        .backup(BackupRequest::new("payments", SOURCE))
        .await
        .unwrap();

    first.run().await.unwrap();
    assert!(!coordinator.locks().is_locked(SOURCE, "orders"));
    coordinator
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();
}

// ============================================================================
// Storage Tests
// ============================================================================

#[tokio::test]
async fn filesystem_backups_are_listed_and_validated() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FilesystemBackend::new(dir.path().to_path_buf()));
    let h = Harness::with_storage(storage.clone());
    seed_topic(&h.source, "orders", 2, 10);
    seed_topic(&h.source, "payments", 1, 10);

    let orders = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE).with_compression(CompressionType::FastBlock))
        .await
        .unwrap();
    let payments = h
        .backup()
        .backup(BackupRequest::new("payments", SOURCE))
        .await
        .unwrap();

    let mut listed = list_backups(storage.as_ref()).await.unwrap();
    listed.sort();
    let mut expected = vec![orders.backup_id.clone(), payments.backup_id.clone()];
    expected.sort();
    assert_eq!(listed, expected);

    assert!(dir
        .path()
        .join(&orders.backup_id)
        .join("segments")
        .join("partition-00001.seg")
        .exists());

    let shallow = validate_backup(storage.as_ref(), &orders.backup_id, false)
        .await
        .unwrap();
    assert!(shallow.is_valid());
    assert!(!shallow.deep);
}

#[tokio::test]
async fn validation_reports_a_truncated_segment() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 10);
    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();

    let key = &manifest.segment(0).unwrap().file_path;
    let data = h.storage.get(key).await.unwrap();
    h.storage.put(key, data.slice(..data.len() - 4)).await.unwrap();

    let report = validate_backup(h.storage.as_ref(), &manifest.backup_id, false)
        .await
        .unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.segments_valid, 1);
    assert_eq!(report.issues[0].partition, Some(0));
    assert_eq!(report.issues[0].kind, ErrorKind::Integrity);
}
