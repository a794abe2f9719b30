//! Operations service.
//!
//! [`RecoveryService`] is the collaborator-facing entry point: it starts
//! backups, restores, migrations and drain monitors in the background and
//! answers status queries by id.
//!
//! Finished operations are kept for status queries until removed with
//! [`RecoveryService::remove_operation`] or pushed out by newer ones past
//! the retention limit. A drain monitor is dropped once stopped or once its
//! terminal state has been handed out.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backup::{load_manifest, BackupCoordinator, BackupRequest};
use crate::broker::ClusterRegistry;
use crate::config::Config;
use crate::drain::{DrainMonitor, DrainOptions, DrainState};
use crate::error::ErrorKind;
use crate::manifest::{BackupManifest, RestoreReport};
use crate::metrics::{OperationMetrics, ProgressReport};
use crate::migrate::{MigrationCoordinator, MigrationReport, MigrationRequest};
use crate::restore::{RestoreCoordinator, RestoreRequest};
use crate::retry::RetryPolicy;
use crate::storage::{create_backend, StorageBackend};
use crate::{Error, Result};

/// Finished operations kept by default before the oldest are dropped
pub const DEFAULT_FINISHED_RETENTION: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Backup,
    Restore,
    Migration,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
            OperationKind::Migration => "migration",
        };
        f.write_str(s)
    }
}

/// Where a background operation stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    Running,
    /// Finished; `status` is the manifest or report status
    Completed { status: String },
    Failed { kind: ErrorKind, error: String },
}

impl OperationState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, OperationState::Running)
    }
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub id: String,
    pub kind: OperationKind,
    pub state: OperationState,
    /// Absent for backups only known from storage
    pub progress: Option<ProgressReport>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Debug, Clone)]
enum OperationResult {
    Backup(BackupManifest),
    Restore(RestoreReport),
    Migration(MigrationReport),
}

struct Operation {
    id: String,
    kind: OperationKind,
    started_at: i64,
    metrics: Arc<OperationMetrics>,
    cancel: CancellationToken,
    state: watch::Sender<OperationState>,
    finished_at: Mutex<Option<i64>>,
    result: Mutex<Option<OperationResult>>,
}

impl Operation {
    fn new(
        id: &str,
        kind: OperationKind,
        metrics: Arc<OperationMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(OperationState::Running);
        Self {
            id: id.to_string(),
            kind,
            started_at: Utc::now().timestamp_millis(),
            metrics,
            cancel,
            state,
            finished_at: Mutex::new(None),
            result: Mutex::new(None),
        }
    }

    fn finish(&self, outcome: Result<(String, OperationResult)>) {
        let state = match outcome {
            Ok((status, result)) => {
                info!(id = %self.id, kind = %self.kind, status = %status, "Operation completed");
                *self.result.lock() = Some(result);
                OperationState::Completed { status }
            }
            Err(e) => {
                error!(id = %self.id, kind = %self.kind, error = %e, "Operation failed");
                OperationState::Failed {
                    kind: e.kind(),
                    error: e.to_string(),
                }
            }
        };
        *self.finished_at.lock() = Some(Utc::now().timestamp_millis());
        self.state.send_replace(state);
    }

    fn is_finished(&self) -> bool {
        self.state.borrow().is_finished()
    }

    fn status(&self) -> OperationStatus {
        OperationStatus {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state.borrow().clone(),
            progress: Some(self.metrics.report()),
            started_at: Some(self.started_at),
            finished_at: *self.finished_at.lock(),
        }
    }
}

/// Owns the storage, clusters, coordinators and the operation table
pub struct RecoveryService {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    clusters: Arc<ClusterRegistry>,
    backup: Arc<BackupCoordinator>,
    restore: Arc<RestoreCoordinator>,
    migration: Arc<MigrationCoordinator>,
    retry: RetryPolicy,
    finished_retention: usize,
    operations: RwLock<HashMap<String, Arc<Operation>>>,
    drains: RwLock<HashMap<String, Arc<DrainMonitor>>>,
}

impl RecoveryService {
    /// Build a service from config, connecting to the configured clusters lazily
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = create_backend(&config.storage);
        let clusters = Arc::new(ClusterRegistry::from_config(&config.clusters));
        Ok(Self::with_parts(config, storage, clusters))
    }

    /// Build a service around an existing storage backend and cluster registry
    pub fn with_parts(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        clusters: Arc<ClusterRegistry>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        let backup = Arc::new(BackupCoordinator::new(
            &config,
            Arc::clone(&storage),
            Arc::clone(&clusters),
        ));
        let restore = Arc::new(RestoreCoordinator::new(
            &config,
            Arc::clone(&storage),
            Arc::clone(&clusters),
        ));
        let migration = Arc::new(MigrationCoordinator::new(
            &config,
            Arc::clone(&clusters),
            Arc::clone(&backup),
            Arc::clone(&restore),
        ));

        Self {
            config,
            storage,
            clusters,
            backup,
            restore,
            migration,
            retry,
            finished_retention: DEFAULT_FINISHED_RETENTION,
            operations: RwLock::new(HashMap::new()),
            drains: RwLock::new(HashMap::new()),
        }
    }

    /// Keep at most `retention` finished operations in the table
    pub fn with_finished_retention(mut self, retention: usize) -> Self {
        self.finished_retention = retention;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn clusters(&self) -> &Arc<ClusterRegistry> {
        &self.clusters
    }

    pub fn backup_coordinator(&self) -> &Arc<BackupCoordinator> {
        &self.backup
    }

    fn register(
        &self,
        id: &str,
        kind: OperationKind,
        metrics: Arc<OperationMetrics>,
        cancel: CancellationToken,
    ) -> Arc<Operation> {
        let operation = Arc::new(Operation::new(id, kind, metrics, cancel));
        let mut operations = self.operations.write();
        prune_finished(&mut operations, self.finished_retention);
        operations.insert(id.to_string(), Arc::clone(&operation));
        operation
    }

    fn operation(&self, id: &str, kind: OperationKind) -> Result<Arc<Operation>> {
        self.operations
            .read()
            .get(id)
            .filter(|op| op.kind == kind)
            .cloned()
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    /// Start a backup in the background and return its id.
    ///
    /// Lock conflicts and invalid requests are returned here, before
    /// anything is spawned. Must be called inside a tokio runtime.
    pub fn start_backup(&self, request: BackupRequest) -> Result<String> {
        let job = self.backup.begin(request)?;
        let id = job.backup_id().to_string();
        let operation = self.register(&id, OperationKind::Backup, job.metrics(), job.cancel_token());

        tokio::spawn(async move {
            let outcome = job
                .run()
                .await
                .map(|m| (m.status.to_string(), OperationResult::Backup(m)));
            operation.finish(outcome);
        });
        Ok(id)
    }

    /// Status of a backup started here, or of one found in storage
    pub async fn get_backup_status(&self, backup_id: &str) -> Result<OperationStatus> {
        if let Ok(operation) = self.operation(backup_id, OperationKind::Backup) {
            return Ok(operation.status());
        }

        let manifest = load_manifest(self.storage.as_ref(), backup_id).await?;
        Ok(OperationStatus {
            id: backup_id.to_string(),
            kind: OperationKind::Backup,
            state: OperationState::Completed {
                status: manifest.status.to_string(),
            },
            progress: None,
            started_at: Some(manifest.created_at),
            finished_at: manifest.completed_at,
        })
    }

    pub fn start_restore(&self, request: RestoreRequest) -> Result<String> {
        let job = self.restore.prepare(request)?;
        let id = job.restore_id().to_string();
        let operation = self.register(&id, OperationKind::Restore, job.metrics(), job.cancel_token());

        tokio::spawn(async move {
            let outcome = job
                .run()
                .await
                .map(|r| (r.status.to_string(), OperationResult::Restore(r)));
            operation.finish(outcome);
        });
        Ok(id)
    }

    pub fn get_restore_status(&self, restore_id: &str) -> Result<OperationStatus> {
        Ok(self.operation(restore_id, OperationKind::Restore)?.status())
    }

    pub fn start_migration(&self, request: MigrationRequest) -> Result<String> {
        let job = self.migration.prepare(request)?;
        let id = job.migration_id().to_string();
        let operation =
            self.register(&id, OperationKind::Migration, job.metrics(), job.cancel_token());

        tokio::spawn(async move {
            let outcome = job
                .run()
                .await
                .map(|r| (r.status.to_string(), OperationResult::Migration(r)));
            operation.finish(outcome);
        });
        Ok(id)
    }

    pub fn get_migration_status(&self, migration_id: &str) -> Result<OperationStatus> {
        Ok(self
            .operation(migration_id, OperationKind::Migration)?
            .status())
    }

    /// Manifest of a finished backup started here
    pub fn backup_result(&self, backup_id: &str) -> Option<BackupManifest> {
        let operation = self.operation(backup_id, OperationKind::Backup).ok()?;
        let result = operation.result.lock();
        match result.as_ref() {
            Some(OperationResult::Backup(manifest)) => Some(manifest.clone()),
            _ => None,
        }
    }

    pub fn restore_result(&self, restore_id: &str) -> Option<RestoreReport> {
        let operation = self.operation(restore_id, OperationKind::Restore).ok()?;
        let result = operation.result.lock();
        match result.as_ref() {
            Some(OperationResult::Restore(report)) => Some(report.clone()),
            _ => None,
        }
    }

    pub fn migration_result(&self, migration_id: &str) -> Option<MigrationReport> {
        let operation = self
            .operation(migration_id, OperationKind::Migration)
            .ok()?;
        let result = operation.result.lock();
        match result.as_ref() {
            Some(OperationResult::Migration(report)) => Some(report.clone()),
            _ => None,
        }
    }

    /// Wait until a backup, restore or migration finishes
    pub async fn wait(&self, id: &str) -> Result<OperationStatus> {
        let operation = self
            .operations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;

        let mut rx = operation.state.subscribe();
        // The sender lives in `operation`, so this only ends once finished.
        let _ = rx.wait_for(OperationState::is_finished).await;
        Ok(operation.status())
    }

    /// Ask a running operation to stop. Workers stop after their current
    /// record and the operation still produces its manifest or report.
    pub fn cancel(&self, id: &str) -> Result<()> {
        let operation = self
            .operations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        operation.cancel.cancel();
        Ok(())
    }

    /// Drop a finished operation and return its final status.
    ///
    /// A running operation is left alone and reported as a conflict.
    pub fn remove_operation(&self, id: &str) -> Result<OperationStatus> {
        let mut operations = self.operations.write();
        let operation = operations
            .get(id)
            .cloned()
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        if !operation.is_finished() {
            return Err(Error::Conflict(format!(
                "{} {} is still running",
                operation.kind, id
            )));
        }
        operations.remove(id);
        Ok(operation.status())
    }

    /// All operations started by this service, oldest first
    pub fn list_operations(&self) -> Vec<OperationStatus> {
        let mut statuses: Vec<OperationStatus> = self
            .operations
            .read()
            .values()
            .map(|op| op.status())
            .collect();
        statuses.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        statuses
    }

    /// Start watching a consumer group's lag; options default to the config
    pub fn start_drain_monitor(
        &self,
        cluster: &str,
        group_id: &str,
        topic: &str,
        options: Option<DrainOptions>,
    ) -> Result<String> {
        if group_id.trim().is_empty() || topic.trim().is_empty() {
            return Err(Error::Validation(
                "group_id and topic must not be empty".to_string(),
            ));
        }
        let client = self.clusters.get(cluster)?;
        let options = options.unwrap_or_else(|| DrainOptions::from_config(&self.config.drain));

        let monitor = DrainMonitor::start(client, group_id, topic, options, self.retry.clone());
        let id = monitor.monitor_id().to_string();
        self.drains.write().insert(id.clone(), Arc::new(monitor));
        Ok(id)
    }

    /// Stop a drain monitor and drop it, returning its last state.
    ///
    /// Stopping a monitor that is already gone is a no-op and returns `None`.
    pub fn stop_drain_monitor(&self, monitor_id: &str) -> Result<Option<DrainState>> {
        let Some(monitor) = self.drains.write().remove(monitor_id) else {
            return Ok(None);
        };
        monitor.stop();
        Ok(Some(monitor.state()))
    }

    /// Latest state of a drain monitor. A terminal state is returned once,
    /// after which the monitor is dropped.
    pub fn get_drain_status(&self, monitor_id: &str) -> Result<DrainState> {
        let state = self.drain_monitor(monitor_id)?.state();
        if state.status.is_terminal() {
            self.drains.write().remove(monitor_id);
        }
        Ok(state)
    }

    /// Wait for a drain monitor to reach a terminal state, then drop it
    pub async fn wait_drain(&self, monitor_id: &str) -> Result<DrainState> {
        let monitor = self.drain_monitor(monitor_id)?;
        let state = monitor.wait().await;
        self.drains.write().remove(monitor_id);
        Ok(state)
    }

    fn drain_monitor(&self, monitor_id: &str) -> Result<Arc<DrainMonitor>> {
        self.drains
            .read()
            .get(monitor_id)
            .cloned()
            .ok_or_else(|| Error::OperationNotFound(monitor_id.to_string()))
    }
}

/// Drop the oldest finished operations until at most `retention` remain
fn prune_finished(operations: &mut HashMap<String, Arc<Operation>>, retention: usize) {
    let mut finished: Vec<(i64, String)> = operations
        .values()
        .filter(|op| op.is_finished())
        .map(|op| ((*op.finished_at.lock()).unwrap_or(op.started_at), op.id.clone()))
        .collect();
    if finished.len() <= retention {
        return;
    }
    finished.sort();
    let excess = finished.len() - retention;
    for (_, id) in finished.into_iter().take(excess) {
        operations.remove(&id);
    }
}
