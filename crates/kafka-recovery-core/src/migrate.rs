//! Topic migration between clusters.
//!
//! Streaming mode reads from the source and produces straight into the
//! target. Staged mode goes through a backup and a restore, and keeps the
//! staged backup around if the restore leg does not fully succeed. Source
//! data is never modified in either mode.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::backup::engine::select_partitions;
use crate::backup::{BackupCoordinator, BackupRequest, DEFAULT_FETCH_MAX_BYTES};
use crate::broker::{BrokerClient, ClusterRegistry, OutgoingRecord};
use crate::config::{CompressionType, Config};
use crate::manifest::{summarize, BackupStatus, PartitionReplayReport, ReplayStatus};
use crate::metrics::OperationMetrics;
use crate::pool::{spawn_deadline, PartitionPool};
use crate::restore::{PartitionStrategy, RecordProducer, RestoreCoordinator, RestoreRequest};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::segment::RecordHeader;
use crate::storage::delete_prefix;
use crate::{Error, Result};

/// How records travel from source to target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Streaming when both clusters answer, staged otherwise
    #[default]
    Auto,
    Streaming,
    Staged,
}

impl std::fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MigrationMode::Auto => "auto",
            MigrationMode::Streaming => "streaming",
            MigrationMode::Staged => "staged",
        };
        f.write_str(s)
    }
}

/// Header appended to every migrated record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderAddition {
    pub name: String,
    pub value: String,
}

/// Record rewrite applied on the way to the target
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transform {
    /// Prepended to non-null keys
    #[serde(default)]
    pub key_prefix: Option<String>,

    #[serde(default)]
    pub header_additions: Vec<HeaderAddition>,
}

impl Transform {
    pub fn is_empty(&self) -> bool {
        self.key_prefix.as_deref().map_or(true, str::is_empty) && self.header_additions.is_empty()
    }

    pub fn apply(&self, record: &mut OutgoingRecord) {
        if let (Some(prefix), Some(key)) = (self.key_prefix.as_deref(), record.key.as_ref()) {
            let mut prefixed = BytesMut::with_capacity(prefix.len() + key.len());
            prefixed.put_slice(prefix.as_bytes());
            prefixed.put_slice(key);
            record.key = Some(prefixed.freeze());
        }
        for header in &self.header_additions {
            record.headers.push(RecordHeader::new(
                Bytes::copy_from_slice(header.name.as_bytes()),
                Some(Bytes::copy_from_slice(header.value.as_bytes())),
            ));
        }
    }
}

/// What to migrate and where
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub source_cluster: String,
    pub source_topic: String,
    pub target_cluster: String,
    /// Must already exist on the target cluster
    pub target_topic: String,

    /// Codec for the staged backup
    #[serde(default)]
    pub compression: Option<CompressionType>,

    #[serde(default)]
    pub mode: MigrationMode,

    #[serde(default)]
    pub partitions: Option<Vec<u32>>,

    /// First offset copied from every partition; the log start when unset
    #[serde(default)]
    pub start_offset: Option<u64>,

    /// Exclusive upper offset; the high watermark at start when unset
    #[serde(default)]
    pub end_offset: Option<u64>,

    #[serde(default)]
    pub transform: Transform,

    #[serde(default = "default_true")]
    pub preserve_timestamps: bool,

    #[serde(default = "default_true")]
    pub include_headers: bool,

    #[serde(default)]
    pub partition_strategy: PartitionStrategy,

    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl MigrationRequest {
    pub fn new(
        source_cluster: impl Into<String>,
        source_topic: impl Into<String>,
        target_cluster: impl Into<String>,
        target_topic: impl Into<String>,
    ) -> Self {
        Self {
            source_cluster: source_cluster.into(),
            source_topic: source_topic.into(),
            target_cluster: target_cluster.into(),
            target_topic: target_topic.into(),
            compression: None,
            mode: MigrationMode::default(),
            partitions: None,
            start_offset: None,
            end_offset: None,
            transform: Transform::default(),
            preserve_timestamps: true,
            include_headers: true,
            partition_strategy: PartitionStrategy::default(),
            deadline_secs: None,
        }
    }

    pub fn with_mode(mut self, mode: MigrationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Copy only offsets in `[start, end)` of each partition
    pub fn with_offset_range(mut self, start: Option<u64>, end: Option<u64>) -> Self {
        self.start_offset = start;
        self.end_offset = end;
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    /// The requested range clamped to a partition's `[low, high)` watermarks
    fn offset_window(&self, low: u64, high: u64) -> (u64, u64) {
        let end = self.end_offset.map_or(high, |cap| cap.min(high));
        let start = self.start_offset.map_or(low, |start| start.max(low)).min(end);
        (start, end)
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("source_cluster", &self.source_cluster),
            ("source_topic", &self.source_topic),
            ("target_cluster", &self.target_cluster),
            ("target_topic", &self.target_topic),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Validation(format!("{} must not be empty", field)));
            }
        }
        if self.source_cluster == self.target_cluster && self.source_topic == self.target_topic {
            return Err(Error::Validation(format!(
                "source and target are both '{}' on cluster '{}'",
                self.source_topic, self.source_cluster
            )));
        }
        if matches!(self.partitions.as_deref(), Some([])) {
            return Err(Error::Validation("partition filter is empty".to_string()));
        }
        if let (Some(start), Some(end)) = (self.start_offset, self.end_offset) {
            if start >= end {
                return Err(Error::Validation(format!(
                    "start_offset {} must be below end_offset {}",
                    start, end
                )));
            }
        }
        if self.deadline_secs == Some(0) {
            return Err(Error::Validation("deadline_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Outcome of a migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migration_id: String,
    /// Mode actually used; never `Auto`
    pub mode: MigrationMode,
    pub source_cluster: String,
    pub source_topic: String,
    pub target_cluster: String,
    pub target_topic: String,
    /// Staged backup codec
    pub compression: Option<CompressionType>,
    pub start_time: i64,
    pub end_time: i64,
    pub partitions: Vec<PartitionReplayReport>,
    pub messages_migrated: u64,
    pub messages_failed: u64,
    pub messages_skipped: u64,
    /// Source partitions that could not be read at all
    pub missing_partitions: Vec<u32>,
    pub status: ReplayStatus,
    /// Set when a staged backup was kept because the restore leg fell short
    pub staged_backup_id: Option<String>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.status == ReplayStatus::Success
    }
}

/// Runs migrations, reusing the backup and restore coordinators for staged mode
pub struct MigrationCoordinator {
    clusters: Arc<ClusterRegistry>,
    backup: Arc<BackupCoordinator>,
    restore: Arc<RestoreCoordinator>,
    retry: RetryPolicy,
    partition_concurrency: usize,
    produce_batch_size: usize,
    fetch_max_bytes: i32,
}

impl MigrationCoordinator {
    pub fn new(
        config: &Config,
        clusters: Arc<ClusterRegistry>,
        backup: Arc<BackupCoordinator>,
        restore: Arc<RestoreCoordinator>,
    ) -> Self {
        Self {
            clusters,
            backup,
            restore,
            retry: RetryPolicy::from_config(&config.retry),
            partition_concurrency: config.partition_concurrency,
            produce_batch_size: config.produce_batch_size.max(1),
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate a request and resolve both clusters
    pub fn prepare(&self, request: MigrationRequest) -> Result<MigrationJob> {
        request.validate()?;
        let source = self.clusters.get(&request.source_cluster)?;
        let target = self.clusters.get(&request.target_cluster)?;

        Ok(MigrationJob {
            migration_id: format!("migration-{}", Ulid::new()),
            request,
            source,
            target,
            backup: Arc::clone(&self.backup),
            restore: Arc::clone(&self.restore),
            retry: self.retry.clone(),
            partition_concurrency: self.partition_concurrency,
            batch_size: self.produce_batch_size,
            fetch_max_bytes: self.fetch_max_bytes,
            metrics: Arc::new(OperationMetrics::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub async fn migrate(&self, request: MigrationRequest) -> Result<MigrationReport> {
        self.prepare(request)?.run().await
    }
}

/// A validated migration, ready to run
pub struct MigrationJob {
    migration_id: String,
    request: MigrationRequest,
    source: Arc<dyn BrokerClient>,
    target: Arc<dyn BrokerClient>,
    backup: Arc<BackupCoordinator>,
    restore: Arc<RestoreCoordinator>,
    retry: RetryPolicy,
    partition_concurrency: usize,
    batch_size: usize,
    fetch_max_bytes: i32,
    metrics: Arc<OperationMetrics>,
    cancel: CancellationToken,
}

/// Offset range one streaming worker copies
#[derive(Debug, Clone, Copy)]
struct StreamPlan {
    partition: u32,
    start: u64,
    /// Exclusive; never past the high watermark captured at start
    end: u64,
}

impl MigrationJob {
    pub fn migration_id(&self) -> &str {
        &self.migration_id
    }

    pub fn request(&self) -> &MigrationRequest {
        &self.request
    }

    pub fn metrics(&self) -> Arc<OperationMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<MigrationReport> {
        let start_time = Utc::now().timestamp_millis();
        let mode = self.resolve_mode().await;
        info!(
            migration_id = %self.migration_id,
            source = %format!("{}/{}", self.request.source_cluster, self.request.source_topic),
            target = %format!("{}/{}", self.request.target_cluster, self.request.target_topic),
            %mode,
            "Starting migration"
        );

        let mut report = match mode {
            MigrationMode::Staged => self.run_staged(start_time).await?,
            _ => self.run_streaming(start_time).await?,
        };
        report.end_time = Utc::now().timestamp_millis();

        info!(
            migration_id = %report.migration_id,
            mode = %report.mode,
            status = %report.status,
            migrated = report.messages_migrated,
            failed = report.messages_failed,
            skipped = report.messages_skipped,
            staged_backup_id = ?report.staged_backup_id,
            "Migration finished"
        );
        Ok(report)
    }

    /// `Auto` streams when the target answers and stages otherwise
    async fn resolve_mode(&self) -> MigrationMode {
        match self.request.mode {
            MigrationMode::Auto => match self.target.ping().await {
                Ok(()) => MigrationMode::Streaming,
                Err(e) => {
                    warn!(
                        migration_id = %self.migration_id,
                        target_cluster = %self.request.target_cluster,
                        error = %e,
                        "Target cluster unreachable, staging through a backup"
                    );
                    MigrationMode::Staged
                }
            },
            mode => mode,
        }
    }

    fn empty_report(&self, mode: MigrationMode, start_time: i64) -> MigrationReport {
        MigrationReport {
            migration_id: self.migration_id.clone(),
            mode,
            source_cluster: self.request.source_cluster.clone(),
            source_topic: self.request.source_topic.clone(),
            target_cluster: self.request.target_cluster.clone(),
            target_topic: self.request.target_topic.clone(),
            compression: None,
            start_time,
            end_time: start_time,
            partitions: Vec::new(),
            messages_migrated: 0,
            messages_failed: 0,
            messages_skipped: 0,
            missing_partitions: Vec::new(),
            status: ReplayStatus::Success,
            staged_backup_id: None,
        }
    }

    async fn run_streaming(&self, start_time: i64) -> Result<MigrationReport> {
        let stop = self.cancel.child_token();
        let _stop_on_exit = stop.clone().drop_guard();

        let topic = self
            .retry
            .execute("source topic metadata", &stop, Some(&self.metrics), |_| {
                self.source.topic_metadata(&self.request.source_topic)
            })
            .await?;
        let partitions = select_partitions(&topic, self.request.partitions.as_deref())?;

        let producer = RecordProducer::connect(
            Arc::clone(&self.target),
            &self.request.target_topic,
            self.request.partition_strategy,
            self.retry.clone(),
            self.batch_size,
            Arc::clone(&self.metrics),
            stop.clone(),
        )
        .await?;
        producer.check_source_partitions(&partitions)?;
        self.metrics.set_partitions_total(partitions.len() as u64);

        let mut plans = BTreeMap::new();
        let mut missing_partitions = Vec::new();
        for &partition in &partitions {
            let outcome = self
                .retry
                .run("source watermarks", &stop, Some(&self.metrics), |_| {
                    self.source.watermarks(&self.request.source_topic, partition)
                })
                .await;
            match outcome {
                RetryOutcome::Success(w) => {
                    let (start, end) = self.request.offset_window(w.low, w.high);
                    plans.insert(partition, StreamPlan { partition, start, end });
                }
                RetryOutcome::ExhaustedRetries { last_error: e, .. }
                | RetryOutcome::NonRetryable(e) => {
                    error!(partition, error = %e, "Could not read source watermarks");
                    self.metrics.record_partition_done(false);
                    missing_partitions.push(partition);
                }
            }
        }

        let timed_out = spawn_deadline("migration", self.request.deadline(), stop.clone());

        let worker = Arc::new(StreamWorker {
            topic: self.request.source_topic.clone(),
            source: Arc::clone(&self.source),
            producer: Arc::new(producer),
            transform: (!self.request.transform.is_empty()).then(|| self.request.transform.clone()),
            preserve_timestamps: self.request.preserve_timestamps,
            include_headers: self.request.include_headers,
            retry: self.retry.clone(),
            fetch_max_bytes: self.fetch_max_bytes,
            metrics: Arc::clone(&self.metrics),
            stop: stop.clone(),
        });

        let planned: Vec<u32> = plans.keys().copied().collect();
        let pool = PartitionPool::new(self.partition_concurrency, planned.len());
        let results = pool
            .run(&planned, |partition| {
                let worker = Arc::clone(&worker);
                let plan = plans.get(&partition).copied();
                async move {
                    match plan {
                        Some(plan) => Ok(worker.run(plan).await),
                        None => Err(Error::Worker(format!("no plan for partition {}", partition))),
                    }
                }
            })
            .await;

        let mut reports = Vec::with_capacity(results.len());
        for (partition, result) in results {
            let report = result.unwrap_or_else(|e| {
                let mut report = PartitionReplayReport::new(partition);
                if let Some(plan) = plans.get(&partition) {
                    report.messages_failed = plan.end - plan.start;
                }
                report.record_error(&e);
                report
            });
            self.metrics.record_partition_done(
                report.messages_failed == 0 && report.messages_skipped == 0,
            );
            reports.push(report);
        }

        let (migrated, failed, skipped, mut status) =
            summarize(&mut reports, timed_out.load(Ordering::SeqCst));
        if status == ReplayStatus::Success && !missing_partitions.is_empty() {
            status = ReplayStatus::PartialSuccess;
        }

        let mut report = self.empty_report(MigrationMode::Streaming, start_time);
        report.partitions = reports;
        report.messages_migrated = migrated;
        report.messages_failed = failed;
        report.messages_skipped = skipped;
        report.missing_partitions = missing_partitions;
        report.status = status;
        Ok(report)
    }

    /// Back up the source, restore into the target, then drop the staged backup.
    ///
    /// Both legs share one deadline: the restore leg gets whatever time the
    /// backup leg left over.
    async fn run_staged(&self, start_time: i64) -> Result<MigrationReport> {
        let deadline_at = self
            .request
            .deadline()
            .map(|deadline| tokio::time::Instant::now() + deadline);

        let mut backup_request =
            BackupRequest::new(&self.request.source_topic, &self.request.source_cluster);
        backup_request.compression = self.request.compression;
        backup_request.partitions = self.request.partitions.clone();
        backup_request.include_headers = self.request.include_headers;
        backup_request.deadline_secs = self.request.deadline_secs;
        backup_request.end_offset = self.request.end_offset;
        if let Some(start) = self.request.start_offset {
            let topic = self
                .retry
                .execute("source topic metadata", &self.cancel, Some(&self.metrics), |_| {
                    self.source.topic_metadata(&self.request.source_topic)
                })
                .await?;
            let partitions = select_partitions(&topic, self.request.partitions.as_deref())?;
            backup_request.start_offsets = partitions
                .into_iter()
                .map(|partition| (partition, start))
                .collect();
        }

        let backup_job = self.backup.begin(backup_request)?;
        let backup_cancel = backup_job.cancel_token();
        let manifest = tokio::select! {
            manifest = backup_job.run() => manifest?,
            _ = self.cancel.cancelled() => {
                backup_cancel.cancel();
                return Err(Error::Cancelled(format!("migration {}", self.migration_id)));
            }
        };
        let backup_id = manifest.backup_id.clone();
        info!(
            migration_id = %self.migration_id,
            backup_id = %backup_id,
            status = %manifest.status,
            messages = manifest.total_messages,
            "Staged backup written"
        );

        let mut report = self.empty_report(MigrationMode::Staged, start_time);
        report.compression = Some(manifest.compression);

        let restore_request = RestoreRequest {
            backup_id: backup_id.clone(),
            target_topic: self.request.target_topic.clone(),
            target_cluster: self.request.target_cluster.clone(),
            validate_checksum: true,
            partitions: None,
            partition_strategy: self.request.partition_strategy,
            preserve_timestamps: self.request.preserve_timestamps,
            include_headers: self.request.include_headers,
            deadline_secs: None,
        };
        let restored = match self.restore.prepare(restore_request) {
            Ok(job) => {
                let mut job = job.with_transform(self.request.transform.clone());
                if let Some(at) = deadline_at {
                    job = job.with_deadline_at(at);
                }
                let restore_cancel = job.cancel_token();
                tokio::select! {
                    result = job.run() => result,
                    _ = self.cancel.cancelled() => {
                        restore_cancel.cancel();
                        Err(Error::Cancelled(format!("migration {}", self.migration_id)))
                    }
                }
            }
            Err(e) => Err(e),
        };

        match restored {
            Ok(restore) => {
                self.metrics.record_records(restore.messages_restored);
                self.metrics.record_failed_records(restore.messages_failed);
                report.partitions = restore.partitions;
                report.messages_migrated = restore.messages_restored;
                report.messages_failed = restore.messages_failed;
                report.messages_skipped = restore.messages_skipped;
                report.missing_partitions = restore.missing_partitions;
                report.status = restore.status;
            }
            Err(e) => {
                error!(
                    migration_id = %self.migration_id,
                    backup_id = %backup_id,
                    error = %e,
                    "Restore leg failed; keeping staged backup"
                );
                self.metrics.record_failed_records(manifest.total_messages);
                report.partitions = manifest
                    .segments
                    .iter()
                    .map(|s| {
                        let mut p = PartitionReplayReport::new(s.partition_id);
                        p.messages_failed = s.message_count;
                        p.record_error(&e);
                        p
                    })
                    .collect();
                report.messages_failed = manifest.total_messages;
                report.missing_partitions =
                    manifest.failed_partitions.iter().map(|f| f.partition).collect();
                report.status = ReplayStatus::PartialSuccess;
            }
        }

        if report.is_success() && manifest.status == BackupStatus::Success {
            let started = Instant::now();
            match delete_prefix(self.backup.storage().as_ref(), &format!("{}/", backup_id)).await {
                Ok(removed) => debug!(
                    backup_id = %backup_id,
                    removed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Deleted staged backup"
                ),
                Err(e) => {
                    warn!(backup_id = %backup_id, error = %e, "Could not delete staged backup");
                    report.staged_backup_id = Some(backup_id);
                }
            }
        } else {
            if report.status == ReplayStatus::Success {
                report.status = ReplayStatus::PartialSuccess;
            }
            report.staged_backup_id = Some(backup_id);
        }

        Ok(report)
    }
}

/// State shared by the streaming workers of one migration
struct StreamWorker {
    topic: String,
    source: Arc<dyn BrokerClient>,
    producer: Arc<RecordProducer>,
    transform: Option<Transform>,
    preserve_timestamps: bool,
    include_headers: bool,
    retry: RetryPolicy,
    fetch_max_bytes: i32,
    metrics: Arc<OperationMetrics>,
    stop: CancellationToken,
}

impl StreamWorker {
    /// Copy `[start, end)` of one source partition in offset order.
    ///
    /// Offsets never fetched are counted as skipped after a stop and as failed
    /// after a fetch error. Compacted gaps make that count an upper bound.
    async fn run(&self, plan: StreamPlan) -> PartitionReplayReport {
        let partition = plan.partition;
        let mut report = PartitionReplayReport::new(partition);
        let mut offset = plan.start;
        let operation = format!("fetch {}:{}", self.topic, partition);

        while offset < plan.end {
            if self.stop.is_cancelled() {
                report.messages_skipped += plan.end - offset;
                break;
            }

            let started = Instant::now();
            let fetched = self
                .retry
                .execute(&operation, &self.stop, Some(&self.metrics), |_| {
                    self.source
                        .fetch(&self.topic, partition, offset, self.fetch_max_bytes)
                })
                .await;
            self.metrics.record_broker_latency(started.elapsed());

            let batch = match fetched {
                Ok(batch) => batch,
                Err(_) if self.stop.is_cancelled() => {
                    report.messages_skipped += plan.end - offset;
                    break;
                }
                Err(e) => {
                    error!(partition, offset, error = %e, "Source fetch failed");
                    let unread = plan.end - offset;
                    report.messages_failed += unread;
                    report.record_error(&e);
                    self.metrics.record_failed_records(unread);
                    break;
                }
            };

            let records: Vec<OutgoingRecord> = batch
                .records
                .into_iter()
                .filter(|r| r.offset >= offset && r.offset < plan.end)
                .map(|r| {
                    let mut outgoing = OutgoingRecord::from_message(
                        r,
                        self.preserve_timestamps,
                        self.include_headers,
                    );
                    if let Some(transform) = &self.transform {
                        transform.apply(&mut outgoing);
                    }
                    outgoing
                })
                .collect();
            let last = records.last().map(|r| r.source_offset + 1);

            if !records.is_empty() {
                self.producer.send(partition, records, &mut report).await;
            }

            let next = batch.next_offset.max(last.unwrap_or(offset));
            if next <= offset {
                debug!(partition, offset, end = plan.end, "Source returned nothing below boundary");
                break;
            }
            offset = next;
        }

        debug!(
            partition,
            migrated = report.messages_restored,
            failed = report.messages_failed,
            skipped = report.messages_skipped,
            "Partition migration done"
        );
        report
    }
}
