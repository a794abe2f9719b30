//! Operations service tests.
//!
//! Background operations started through `RecoveryService`, their status,
//! results and cancellation.

use std::time::Duration;

use kafka_recovery_core::error::ErrorKind;
use kafka_recovery_core::{
    BackupRequest, Error, MigrationMode, MigrationRequest, OperationKind, OperationState,
    PartitionStrategy, RestoreRequest,
};

use super::helpers::{seed_topic, Harness, SOURCE, TARGET};

fn completed(status: &str) -> OperationState {
    OperationState::Completed {
        status: status.to_string(),
    }
}

#[tokio::test]
async fn backup_then_restore_through_the_service() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 25);
    h.target.create_topic("orders-restored", 2);
    let service = h.service();

    let backup_id = service
        .start_backup(BackupRequest::new("orders", SOURCE))
        .unwrap();
    let status = service.wait(&backup_id).await.unwrap();
    assert_eq!(status.kind, OperationKind::Backup);
    assert_eq!(status.state, completed("Success"));
    assert!(status.finished_at.is_some());

    let restore_id = service
        .start_restore(
            RestoreRequest::new(&backup_id, "orders-restored", TARGET)
                .with_strategy(PartitionStrategy::Preserve),
        )
        .unwrap();
    let status = service.wait(&restore_id).await.unwrap();
    assert_eq!(status.state, completed("Success"));
    assert_eq!(status.progress.unwrap().records_processed, 50);

    let report = service.restore_result(&restore_id).unwrap();
    assert_eq!(report.messages_restored, 50);
    assert_eq!(
        service.get_restore_status(&restore_id).unwrap().state,
        completed("Success")
    );

    // ids are not interchangeable between kinds
    assert!(matches!(
        service.get_restore_status(&backup_id),
        Err(Error::OperationNotFound(_))
    ));
    assert!(service.backup_result(&restore_id).is_none());

    let listed: Vec<_> = service.list_operations().into_iter().map(|s| s.id).collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&backup_id) && listed.contains(&restore_id));
}

#[tokio::test]
async fn backup_status_falls_back_to_the_stored_manifest() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 5);

    let manifest = h
        .backup()
        .backup(BackupRequest::new("orders", SOURCE))
        .await
        .unwrap();

    let service = h.service();
    let status = service.get_backup_status(&manifest.backup_id).await.unwrap();
    assert_eq!(status.state, completed("Success"));
    assert_eq!(status.started_at, Some(manifest.created_at));
    assert!(status.progress.is_none());
}

#[tokio::test]
async fn second_backup_of_a_running_topic_conflicts() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 5);
    let service = h.service();

    let first = service
        .start_backup(BackupRequest::new("orders", SOURCE))
        .unwrap();
    let err = service
        .start_backup(BackupRequest::new("orders", SOURCE))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    service.wait(&first).await.unwrap();
    let second = service
        .start_backup(BackupRequest::new("orders", SOURCE))
        .unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn failed_restore_reports_its_error_kind() {
    let h = Harness::new();
    let service = h.service();
    h.target.create_topic("orders-restored", 1);

    let id = service
        .start_restore(RestoreRequest::new("orders-missing", "orders-restored", TARGET))
        .unwrap();
    let status = service.wait(&id).await.unwrap();

    match status.state {
        OperationState::Failed { kind, error } => {
            assert_eq!(kind, ErrorKind::NotFound);
            assert!(error.contains("orders-missing"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(service.restore_result(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn cancelled_backup_keeps_what_it_captured() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 1, 100);
    h.source.set_max_records_per_fetch(10);
    h.source.set_fetch_delay(Duration::from_millis(100));
    let service = h.service();

    let id = service
        .start_backup(BackupRequest::new("orders", SOURCE))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    service.cancel(&id).unwrap();

    let status = service.wait(&id).await.unwrap();
    assert_eq!(status.state, completed("Partial"));

    let manifest = service.backup_result(&id).unwrap();
    assert!(manifest.deadline_exceeded);
    assert!(manifest.total_messages < 100);
    manifest.verify().unwrap();
}

#[tokio::test]
async fn migration_runs_in_background() {
    let h = Harness::new();
    seed_topic(&h.source, "orders", 2, 15);
    h.target.create_topic("orders", 2);
    let service = h.service();

    let id = service
        .start_migration(
            MigrationRequest::new(SOURCE, "orders", TARGET, "orders")
                .with_mode(MigrationMode::Staged),
        )
        .unwrap();
    let status = service.wait(&id).await.unwrap();
    assert_eq!(status.kind, OperationKind::Migration);
    assert_eq!(status.state, completed("Success"));

    let report = service.migration_result(&id).unwrap();
    assert_eq!(report.messages_migrated, 30);
    assert_eq!(h.target.message_count("orders"), 30);
    assert!(service.get_migration_status(&id).unwrap().state.is_finished());
}

#[tokio::test]
async fn cancel_of_unknown_operation_is_not_found() {
    let h = Harness::new();
    let service = h.service();
    assert!(matches!(
        service.cancel("backup-nope"),
        Err(Error::OperationNotFound(_))
    ));
    assert!(matches!(
        service.wait("backup-nope").await,
        Err(Error::OperationNotFound(_))
    ));
}
