//! Restore coordinator orchestration.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::producer::RecordProducer;
use super::RestoreRequest;
use crate::backup::load_manifest;
use crate::broker::{BrokerClient, ClusterRegistry, OutgoingRecord};
use crate::compression::{Codec, CodecRegistry};
use crate::config::Config;
use crate::error::StorageError;
use crate::manifest::{
    summarize, BackupManifest, PartitionReplayReport, PartitionSegmentRef, ReplayStatus,
    RestoreReport,
};
use crate::metrics::OperationMetrics;
use crate::migrate::Transform;
use crate::pool::{spawn_deadline, PartitionPool};
use crate::retry::RetryPolicy;
use crate::segment::{load_segment, verify_segment, MessageRecord, Verification};
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// Replays backups into target topics
pub struct RestoreCoordinator {
    storage: Arc<dyn StorageBackend>,
    clusters: Arc<ClusterRegistry>,
    codecs: Arc<CodecRegistry>,
    retry: RetryPolicy,
    partition_concurrency: usize,
    produce_batch_size: usize,
}

impl RestoreCoordinator {
    pub fn new(
        config: &Config,
        storage: Arc<dyn StorageBackend>,
        clusters: Arc<ClusterRegistry>,
    ) -> Self {
        Self {
            storage,
            clusters,
            codecs: Arc::new(CodecRegistry::with_builtin()),
            retry: RetryPolicy::from_config(&config.retry),
            partition_concurrency: config.partition_concurrency,
            produce_batch_size: config.produce_batch_size,
        }
    }

    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Arc::new(codecs);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Validate a request and resolve its target cluster
    pub fn prepare(&self, request: RestoreRequest) -> Result<RestoreJob> {
        request.validate()?;
        let client = self.clusters.get(&request.target_cluster)?;

        Ok(RestoreJob {
            restore_id: format!("restore-{}", Ulid::new()),
            request,
            client,
            storage: Arc::clone(&self.storage),
            codecs: Arc::clone(&self.codecs),
            retry: self.retry.clone(),
            partition_concurrency: self.partition_concurrency,
            batch_size: self.produce_batch_size.max(1),
            transform: None,
            deadline_at: None,
            metrics: Arc::new(OperationMetrics::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Run a restore to completion
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreReport> {
        self.prepare(request)?.run().await
    }
}

/// A validated restore, ready to run
pub struct RestoreJob {
    restore_id: String,
    request: RestoreRequest,
    client: Arc<dyn BrokerClient>,
    storage: Arc<dyn StorageBackend>,
    codecs: Arc<CodecRegistry>,
    retry: RetryPolicy,
    partition_concurrency: usize,
    batch_size: usize,
    transform: Option<Transform>,
    /// Replaces the request deadline with a fixed point in time
    deadline_at: Option<Instant>,
    metrics: Arc<OperationMetrics>,
    cancel: CancellationToken,
}

impl RestoreJob {
    pub fn restore_id(&self) -> &str {
        &self.restore_id
    }

    pub fn request(&self) -> &RestoreRequest {
        &self.request
    }

    pub fn metrics(&self) -> Arc<OperationMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Rewrite every record before it is produced
    pub(crate) fn with_transform(mut self, transform: Transform) -> Self {
        if !transform.is_empty() {
            self.transform = Some(transform);
        }
        self
    }

    /// Stop replaying at `at` rather than after the request's own deadline
    pub(crate) fn with_deadline_at(mut self, at: Instant) -> Self {
        self.deadline_at = Some(at);
        self
    }

    /// Load and check the backup, then replay the selected partitions.
    ///
    /// Integrity problems abort before the first produce. Record-level
    /// failures are counted in the report instead of failing the run.
    pub async fn run(self) -> Result<RestoreReport> {
        let start_time = Utc::now().timestamp_millis();
        info!(
            restore_id = %self.restore_id,
            backup_id = %self.request.backup_id,
            target_topic = %self.request.target_topic,
            target_cluster = %self.request.target_cluster,
            "Starting restore"
        );

        let manifest = load_manifest(self.storage.as_ref(), &self.request.backup_id).await?;
        manifest.verify()?;
        let codec = self.codecs.get(manifest.compression)?;

        let (segments, missing_partitions) =
            select_segments(&manifest, self.request.partitions.as_deref())?;
        if !missing_partitions.is_empty() {
            warn!(
                restore_id = %self.restore_id,
                partitions = ?missing_partitions,
                "Backup is missing partitions; they will not be restored"
            );
        }
        self.metrics.set_partitions_total(segments.len() as u64);

        if self.request.validate_checksum {
            self.validate_segments(&segments, &codec).await?;
        }

        let stop = self.cancel.child_token();
        let _stop_on_exit = stop.clone().drop_guard();

        let producer = RecordProducer::connect(
            Arc::clone(&self.client),
            &self.request.target_topic,
            self.request.partition_strategy,
            self.retry.clone(),
            self.batch_size,
            Arc::clone(&self.metrics),
            stop.clone(),
        )
        .await?;
        let source_partitions: Vec<u32> = segments.iter().map(|s| s.partition_id).collect();
        producer.check_source_partitions(&source_partitions)?;

        let deadline = match self.deadline_at {
            Some(at) => Some(at.saturating_duration_since(Instant::now())),
            None => self.request.deadline(),
        };
        let timed_out = spawn_deadline("restore", deadline, stop.clone());

        let replayer = Arc::new(SegmentReplayer {
            storage: Arc::clone(&self.storage),
            codec,
            producer: Arc::new(producer),
            verification: if self.request.validate_checksum {
                Verification::Skip
            } else {
                Verification::Full
            },
            preserve_timestamps: self.request.preserve_timestamps,
            include_headers: self.request.include_headers,
            transform: self.transform.clone(),
            batch_size: self.batch_size,
            retry: self.retry.clone(),
            metrics: Arc::clone(&self.metrics),
            stop: stop.clone(),
        });

        let by_partition: BTreeMap<u32, PartitionSegmentRef> = segments
            .into_iter()
            .map(|s| (s.partition_id, s))
            .collect();
        let pool = PartitionPool::new(self.partition_concurrency, by_partition.len());
        info!(
            restore_id = %self.restore_id,
            partitions = by_partition.len(),
            concurrency = pool.concurrency(),
            "Replaying segments"
        );

        let results = pool
            .run(&source_partitions, |partition| {
                let replayer = Arc::clone(&replayer);
                let segment = by_partition.get(&partition).cloned();
                async move {
                    match segment {
                        Some(segment) => Ok(replayer.replay(segment).await),
                        None => Err(Error::Worker(format!(
                            "no segment for partition {}",
                            partition
                        ))),
                    }
                }
            })
            .await;

        let mut partitions = Vec::with_capacity(results.len());
        for (partition, result) in results {
            let report = result.unwrap_or_else(|e| {
                error!(restore_id = %self.restore_id, partition, error = %e, "Partition replay failed");
                let mut report = PartitionReplayReport::new(partition);
                report.messages_failed = by_partition
                    .get(&partition)
                    .map_or(0, |s| s.message_count);
                report.record_error(&e);
                report
            });
            self.metrics.record_partition_done(
                report.messages_failed == 0 && report.messages_skipped == 0,
            );
            partitions.push(report);
        }

        let (messages_restored, messages_failed, messages_skipped, mut status) =
            summarize(&mut partitions, timed_out.load(Ordering::SeqCst));
        if status == ReplayStatus::Success && !missing_partitions.is_empty() {
            status = ReplayStatus::PartialSuccess;
        }

        let report = RestoreReport {
            restore_id: self.restore_id.clone(),
            backup_id: self.request.backup_id.clone(),
            target_topic: self.request.target_topic.clone(),
            target_cluster: self.request.target_cluster.clone(),
            start_time,
            end_time: Utc::now().timestamp_millis(),
            partitions,
            messages_restored,
            messages_failed,
            messages_skipped,
            missing_partitions,
            status,
        };

        info!(
            restore_id = %report.restore_id,
            status = %report.status,
            restored = report.messages_restored,
            failed = report.messages_failed,
            skipped = report.messages_skipped,
            "Restore finished"
        );
        info!("{}", self.metrics.report());

        Ok(report)
    }

    /// Re-read every selected segment; any mismatch aborts the restore
    async fn validate_segments(
        &self,
        segments: &[PartitionSegmentRef],
        codec: &Arc<dyn Codec>,
    ) -> Result<()> {
        let by_partition: Arc<BTreeMap<u32, PartitionSegmentRef>> = Arc::new(
            segments
                .iter()
                .map(|s| (s.partition_id, s.clone()))
                .collect(),
        );
        let partitions: Vec<u32> = by_partition.keys().copied().collect();
        let pool = PartitionPool::new(self.partition_concurrency, partitions.len());

        let results = pool
            .run(&partitions, |partition| {
                let storage = Arc::clone(&self.storage);
                let codec = Arc::clone(codec);
                let segment = by_partition.get(&partition).cloned();
                async move {
                    let segment = segment.ok_or_else(|| {
                        Error::Worker(format!("no segment for partition {}", partition))
                    })?;
                    check_segment(storage.as_ref(), codec.as_ref(), &segment).await
                }
            })
            .await;

        for (partition, result) in results {
            if let Err(e) = result {
                error!(
                    restore_id = %self.restore_id,
                    backup_id = %self.request.backup_id,
                    partition,
                    error = %e,
                    "Segment failed validation, aborting restore"
                );
                return Err(e);
            }
        }

        info!(
            restore_id = %self.restore_id,
            segments = partitions.len(),
            "All segments verified"
        );
        Ok(())
    }
}

/// Verify one segment end to end against its manifest entry
async fn check_segment(
    storage: &dyn StorageBackend,
    codec: &dyn Codec,
    segment: &PartitionSegmentRef,
) -> Result<u64> {
    let count = match verify_segment(storage, codec, segment).await {
        Ok(count) => count,
        Err(Error::Storage(StorageError::NotFound(_))) => {
            return Err(Error::CorruptBackup(format!(
                "segment {} is missing",
                segment.file_path
            )))
        }
        Err(e) => return Err(e),
    };
    if count != segment.message_count {
        return Err(Error::CorruptBackup(format!(
            "segment {} holds {} records, manifest says {}",
            segment.file_path, count, segment.message_count
        )));
    }
    Ok(count)
}

/// Apply the partition filter. Returns the segments to replay and the
/// requested partitions the backup failed to capture.
fn select_segments(
    manifest: &BackupManifest,
    filter: Option<&[u32]>,
) -> Result<(Vec<PartitionSegmentRef>, Vec<u32>)> {
    let failed = |p: u32| manifest.failed_partitions.iter().any(|f| f.partition == p);

    let Some(filter) = filter else {
        let mut missing: Vec<u32> = manifest
            .failed_partitions
            .iter()
            .map(|f| f.partition)
            .collect();
        missing.sort_unstable();
        return Ok((manifest.segments.clone(), missing));
    };

    let mut wanted = filter.to_vec();
    wanted.sort_unstable();
    wanted.dedup();

    let mut segments = Vec::with_capacity(wanted.len());
    let mut missing = Vec::new();
    for partition in wanted {
        if let Some(segment) = manifest.segment(partition) {
            segments.push(segment.clone());
        } else if failed(partition) {
            missing.push(partition);
        } else {
            return Err(Error::Validation(format!(
                "backup {} has no partition {}",
                manifest.backup_id, partition
            )));
        }
    }
    Ok((segments, missing))
}

/// State shared by the replay workers of one restore
struct SegmentReplayer {
    storage: Arc<dyn StorageBackend>,
    codec: Arc<dyn Codec>,
    producer: Arc<RecordProducer>,
    verification: Verification,
    preserve_timestamps: bool,
    include_headers: bool,
    transform: Option<Transform>,
    batch_size: usize,
    retry: RetryPolicy,
    metrics: Arc<OperationMetrics>,
    stop: CancellationToken,
}

impl SegmentReplayer {
    /// Replay one partition's segment in offset order
    async fn replay(&self, segment: PartitionSegmentRef) -> PartitionReplayReport {
        let partition = segment.partition_id;
        let mut report = PartitionReplayReport::new(partition);
        let total = segment.message_count;

        let operation = format!("load segment {}", segment.file_path);
        let loaded = self
            .retry
            .execute(&operation, &self.stop, Some(&self.metrics), |_| {
                load_segment(
                    self.storage.as_ref(),
                    self.codec.as_ref(),
                    &segment,
                    self.verification,
                )
            })
            .await;
        let mut reader = match loaded {
            Ok(reader) => reader,
            Err(e) if self.stop.is_cancelled() => {
                debug!(partition, error = %e, "Stopped before segment was loaded");
                report.messages_skipped = total;
                return report;
            }
            Err(e) => {
                warn!(partition, error = %e, "Could not load segment");
                report.messages_failed = total;
                report.record_error(&e);
                self.metrics.record_failed_records(total);
                return report;
            }
        };

        loop {
            if self.stop.is_cancelled() {
                report.messages_skipped += total.saturating_sub(u64::from(reader.records_read()));
                break;
            }

            let mut chunk = Vec::with_capacity(self.batch_size);
            let mut read_error = None;
            while chunk.len() < self.batch_size {
                match reader.next_record() {
                    Ok(Some(record)) => chunk.push(self.outgoing(record)),
                    Ok(None) => break,
                    Err(e) => {
                        read_error = Some(e);
                        break;
                    }
                }
            }
            let exhausted = chunk.len() < self.batch_size;

            if !chunk.is_empty() {
                self.producer.send(partition, chunk, &mut report).await;
            }

            if let Some(e) = read_error {
                let unread = total.saturating_sub(u64::from(reader.records_read()));
                error!(partition, unread, error = %e, "Segment unreadable mid-replay");
                report.messages_failed += unread;
                report.record_error(&e);
                self.metrics.record_failed_records(unread);
                break;
            }
            if exhausted {
                break;
            }
        }

        debug!(
            partition,
            restored = report.messages_restored,
            failed = report.messages_failed,
            skipped = report.messages_skipped,
            "Partition replay done"
        );
        report
    }

    fn outgoing(&self, record: MessageRecord) -> OutgoingRecord {
        let mut outgoing =
            OutgoingRecord::from_message(record, self.preserve_timestamps, self.include_headers);
        if let Some(transform) = &self.transform {
            transform.apply(&mut outgoing);
        }
        outgoing
    }
}
