//! Migration coordinator tests.
//!
//! Streaming and staged migrations between two in-memory clusters,
//! record transforms and the automatic fallback to staging.

use std::time::Duration;

use bytes::Bytes;
use kafka_recovery_core::config::CompressionType;
use kafka_recovery_core::migrate::HeaderAddition;
use kafka_recovery_core::{
    list_backups, load_manifest, BackupStatus, Error, MigrationMode, MigrationRequest,
    PartitionStrategy, ReplayStatus, Transform,
};

use super::helpers::{content, seed_rich_topic, seed_topic, Harness, SOURCE, TARGET};

fn preserve(request: MigrationRequest) -> MigrationRequest {
    MigrationRequest {
        partition_strategy: PartitionStrategy::Preserve,
        ..request
    }
}

// ============================================================================
// Streaming Tests
// ============================================================================

#[tokio::test]
async fn streaming_copies_every_record() {
    let h = Harness::new();
    seed_rich_topic(&h.source, "orders", 2, 75).await;
    h.target.create_topic("orders", 2);

    let report = h
        .migration()
        .migrate(preserve(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders")
                .with_mode(MigrationMode::Streaming),
        ))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.mode, MigrationMode::Streaming);
    assert_eq!(report.messages_migrated, 150);
    assert!(report.staged_backup_id.is_none());
    assert!(report.migration_id.starts_with("migration-"));
    for p in 0..2 {
        assert_eq!(
            content(&h.target.records("orders", p)),
            content(&h.source.records("orders", p))
        );
    }
    // streaming never touches storage
    assert!(list_backups(h.storage.as_ref()).await.unwrap().is_empty());
}

#[tokio::test]
async fn transform_prefixes_keys_and_adds_headers() {
    let h = Harness::new();
    h.source.create_topic("orders", 1);
    h.source.append("orders", 0, Some(b"a"), Some(b"1")).unwrap();
    h.source.append("orders", 0, None, Some(b"2")).unwrap();
    h.target.create_topic("orders", 1);

    let transform = Transform {
        key_prefix: Some("eu.".to_string()),
        header_additions: vec![HeaderAddition {
            name: "migrated-from".to_string(),
            value: "primary".to_string(),
        }],
    };
    let report = h
        .migration()
        .migrate(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders")
                .with_mode(MigrationMode::Streaming)
                .with_transform(transform),
        )
        .await
        .unwrap();
    assert!(report.is_success());

    let migrated = h.target.records("orders", 0);
    assert_eq!(migrated.len(), 2);
    assert_eq!(migrated[0].key, Some(Bytes::from_static(b"eu.a")));
    assert_eq!(migrated[1].key, None);
    for record in &migrated {
        assert_eq!(record.headers.len(), 1);
        assert_eq!(record.headers[0].key, Bytes::from_static(b"migrated-from"));
        assert_eq!(record.headers[0].value, Some(Bytes::from_static(b"primary")));
    }
}

#[tokio::test]
async fn streaming_counts_an_unreadable_partition_as_failed() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 20);
    h.source.fail_fetches("orders", 0);
    h.target.create_topic("orders", 2);

    let report = h
        .migration()
        .migrate(preserve(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders")
                .with_mode(MigrationMode::Streaming),
        ))
        .await
        .unwrap();

    assert_eq!(report.status, ReplayStatus::PartialSuccess);
    assert_eq!(report.messages_migrated, 20);
    assert_eq!(report.messages_failed, 20);
    assert!(h.target.records("orders", 0).is_empty());
    assert_eq!(h.target.records("orders", 1).len(), 20);
}

#[tokio::test]
async fn same_cluster_and_topic_is_rejected() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 1);

    let err = h
        .migration()
        .migrate(MigrationRequest::new(SOURCE, "orders", SOURCE, "orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = h
        .migration()
        .migrate(MigrationRequest::new(SOURCE, "orders", "nowhere", "orders"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownCluster(_)));
}

#[tokio::test]
async fn streaming_copies_only_the_requested_offset_window() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 20);
    h.target.create_topic("orders", 2);

    let report = h
        .migration()
        .migrate(preserve(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders")
                .with_mode(MigrationMode::Streaming)
                .with_offset_range(Some(5), Some(12)),
        ))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.messages_migrated, 14);
    for p in 0..2 {
        assert_eq!(
            content(&h.target.records("orders", p)),
            content(&h.source.records("orders", p)[5..12])
        );
    }
}

#[tokio::test]
async fn offset_window_is_clamped_to_the_high_watermark() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 20);
    h.target.create_topic("orders", 1);

    let report = h
        .migration()
        .migrate(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders")
                .with_mode(MigrationMode::Streaming)
                .with_offset_range(Some(15), Some(1_000)),
        )
        .await
        .unwrap();
    assert_eq!(report.messages_migrated, 5);

    let err = h
        .migration()
        .migrate(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders")
                .with_offset_range(Some(8), Some(8)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

// ============================================================================
// Staged Tests
// ============================================================================

#[tokio::test]
async fn staged_migration_honours_the_offset_window() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 20);
    h.target.create_topic("orders", 2);

    let report = h
        .migration()
        .migrate(preserve(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders")
                .with_mode(MigrationMode::Staged)
                .with_offset_range(Some(10), Some(15)),
        ))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.messages_migrated, 10);
    for p in 0..2 {
        assert_eq!(
            content(&h.target.records("orders", p)),
            content(&h.source.records("orders", p)[10..15])
        );
    }
}

#[tokio::test(start_paused = true)]
async fn staged_legs_share_one_deadline() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 100);
    h.source.set_max_records_per_fetch(10);
    h.source.set_fetch_delay(Duration::from_millis(300));
    h.target.create_topic("orders", 1);

    // the backup leg alone runs into the deadline
    let mut request =
        MigrationRequest::new(SOURCE, "orders", TARGET, "orders").with_mode(MigrationMode::Staged);
    request.deadline_secs = Some(1);
    let report = h.migration().migrate(request).await.unwrap();

    assert_eq!(report.status, ReplayStatus::TimedOut);
    assert_eq!(report.messages_migrated, 0);
    assert_eq!(h.target.message_count("orders"), 0);

    let staged = report.staged_backup_id.expect("staged backup kept");
    let manifest = load_manifest(h.storage.as_ref(), &staged).await.unwrap();
    assert!(manifest.deadline_exceeded);
    assert!(manifest.total_messages > 0);
    assert_eq!(report.messages_skipped, manifest.total_messages);
}

#[tokio::test]
async fn staged_migration_removes_its_backup_on_success() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 3, 30);
    h.target.create_topic("orders-copy", 3);

    let report = h
        .migration()
        .migrate(preserve(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders-copy")
                .with_mode(MigrationMode::Staged)
                .with_compression(CompressionType::UltraFastBlock),
        ))
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.mode, MigrationMode::Staged);
    assert_eq!(report.compression, Some(CompressionType::UltraFastBlock));
    assert_eq!(report.messages_migrated, 90);
    assert!(report.staged_backup_id.is_none());
    assert!(h.storage.list("").await.unwrap().is_empty());
    for p in 0..3 {
        assert_eq!(
            content(&h.target.records("orders-copy", p)),
            content(&h.source.records("orders", p))
        );
    }
}

#[tokio::test]
async fn auto_mode_stages_when_the_target_is_down_and_keeps_the_backup() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 10);
    h.target.create_topic("orders", 2);
    h.target.set_unreachable(true);

    let report = h
        .migration()
        .migrate(MigrationRequest::new(SOURCE, "orders", TARGET, "orders"))
        .await
        .unwrap();

    assert_eq!(report.mode, MigrationMode::Staged);
    assert_eq!(report.status, ReplayStatus::PartialSuccess);
    assert_eq!(report.messages_migrated, 0);
    assert_eq!(report.messages_failed, 20);

    let staged = report.staged_backup_id.expect("staged backup kept");
    let manifest = load_manifest(h.storage.as_ref(), &staged).await.unwrap();
    assert_eq!(manifest.status, BackupStatus::Success);
    assert_eq!(manifest.total_messages, 20);
}

#[tokio::test]
async fn auto_mode_streams_when_the_target_answers() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 5);
    h.target.create_topic("orders", 1);

    let report = h
        .migration()
        .migrate(MigrationRequest::new(SOURCE, "orders", TARGET, "orders"))
        .await
        .unwrap();

    assert_eq!(report.mode, MigrationMode::Streaming);
    assert!(report.is_success());
    assert_eq!(h.target.message_count("orders"), 5);
}
