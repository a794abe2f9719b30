//! Backup coordinator orchestration.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use super::lock::{BackupLock, BackupLockMap};
use super::BackupRequest;
use crate::broker::{BrokerClient, ClusterRegistry, TopicInfo};
use crate::compression::{Codec, CodecRegistry};
use crate::config::{CompressionType, Config};
use crate::manifest::{
    manifest_key, segment_key, BackupManifest, PartitionFailure, PartitionSegmentRef,
};
use crate::metrics::OperationMetrics;
use crate::pool::{spawn_deadline, PartitionPool};
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::segment::SegmentWriter;
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// Upper bound for a single fetch issued by a backup worker
pub const DEFAULT_FETCH_MAX_BYTES: i32 = 1024 * 1024;

/// Runs backups and owns the per-topic lock map
pub struct BackupCoordinator {
    storage: Arc<dyn StorageBackend>,
    clusters: Arc<ClusterRegistry>,
    codecs: Arc<CodecRegistry>,
    locks: BackupLockMap,
    retry: RetryPolicy,
    partition_concurrency: usize,
    default_compression: CompressionType,
    fetch_max_bytes: i32,
}

impl BackupCoordinator {
    pub fn new(
        config: &Config,
        storage: Arc<dyn StorageBackend>,
        clusters: Arc<ClusterRegistry>,
    ) -> Self {
        Self {
            storage,
            clusters,
            codecs: Arc::new(CodecRegistry::with_builtin()),
            locks: BackupLockMap::new(config.max_concurrent_backups),
            retry: RetryPolicy::from_config(&config.retry),
            partition_concurrency: config.partition_concurrency,
            default_compression: config.default_compression,
            fetch_max_bytes: DEFAULT_FETCH_MAX_BYTES,
        }
    }

    /// Use a custom codec registry
    pub fn with_codecs(mut self, codecs: CodecRegistry) -> Self {
        self.codecs = Arc::new(codecs);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_max_bytes(mut self, max_bytes: i32) -> Self {
        self.fetch_max_bytes = max_bytes.max(1);
        self
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn locks(&self) -> &BackupLockMap {
        &self.locks
    }

    /// Validate a request and take its lock.
    ///
    /// Conflicts and bad requests fail here, before anything touches the
    /// broker. The returned job holds the lock until it is run or dropped.
    pub fn begin(&self, request: BackupRequest) -> Result<BackupJob> {
        request.validate()?;
        let client = self.clusters.get(&request.cluster)?;
        let compression = request.compression.unwrap_or(self.default_compression);
        let codec = self.codecs.get(compression)?;

        let backup_id = format!("{}-{}", request.topic, Ulid::new());
        let lock = self
            .locks
            .try_acquire(&request.cluster, &request.topic, &backup_id)?;

        Ok(BackupJob {
            backup_id,
            request,
            compression,
            client,
            storage: Arc::clone(&self.storage),
            codec,
            retry: self.retry.clone(),
            partition_concurrency: self.partition_concurrency,
            fetch_max_bytes: self.fetch_max_bytes,
            metrics: Arc::new(OperationMetrics::new()),
            cancel: CancellationToken::new(),
            _lock: lock,
        })
    }

    /// Run a backup to completion
    pub async fn backup(&self, request: BackupRequest) -> Result<BackupManifest> {
        self.begin(request)?.run().await
    }
}

/// A backup that holds its lock and is ready to run
pub struct BackupJob {
    backup_id: String,
    request: BackupRequest,
    compression: CompressionType,
    client: Arc<dyn BrokerClient>,
    storage: Arc<dyn StorageBackend>,
    codec: Arc<dyn Codec>,
    retry: RetryPolicy,
    partition_concurrency: usize,
    fetch_max_bytes: i32,
    metrics: Arc<OperationMetrics>,
    cancel: CancellationToken,
    _lock: BackupLock,
}

/// Offsets one partition worker covers
#[derive(Debug, Clone, Copy)]
struct PartitionPlan {
    partition: u32,
    start: u64,
    /// Exclusive; the snapshot boundary or the requested cap
    end: u64,
    high_watermark: u64,
    quota: Option<u64>,
}

enum PartitionOutcome {
    Written {
        segment: PartitionSegmentRef,
        stopped_early: bool,
    },
    Failed(PartitionFailure),
}

impl BackupJob {
    pub fn backup_id(&self) -> &str {
        &self.backup_id
    }

    pub fn request(&self) -> &BackupRequest {
        &self.request
    }

    pub fn metrics(&self) -> Arc<OperationMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Cancelling stops workers after their current record; the manifest is still written.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Capture the snapshot boundary, back up every selected partition and
    /// persist the manifest.
    ///
    /// Partition failures end up in the manifest; only coordinator-level
    /// failures (metadata, manifest write) are returned as errors.
    pub async fn run(self) -> Result<BackupManifest> {
        let topic = self.request.topic.clone();
        info!(
            backup_id = %self.backup_id,
            topic = %topic,
            cluster = %self.request.cluster,
            compression = %self.compression,
            "Starting backup"
        );

        let stop = self.cancel.child_token();
        let _stop_on_exit = stop.clone().drop_guard();
        spawn_deadline("backup", self.request.deadline(), stop.clone());

        let topic_info = self
            .retry
            .execute("topic metadata", &stop, Some(&self.metrics), |_| {
                self.client.topic_metadata(&topic)
            })
            .await?;
        let partitions = select_partitions(&topic_info, self.request.partitions.as_deref())?;

        let mut manifest = BackupManifest::new(
            self.backup_id.clone(),
            topic.clone(),
            self.request.cluster.clone(),
            self.compression,
            topic_info.partition_count(),
        );
        manifest.include_headers = self.request.include_headers;
        self.metrics.set_partitions_total(partitions.len() as u64);

        let (plans, failures) = self.capture_snapshot(&partitions, &stop).await;
        for failure in failures {
            self.metrics.record_partition_done(false);
            manifest.add_failure(failure);
        }

        let worker = Arc::new(PartitionWorker {
            backup_id: self.backup_id.clone(),
            topic: topic.clone(),
            client: Arc::clone(&self.client),
            storage: Arc::clone(&self.storage),
            codec: Arc::clone(&self.codec),
            retry: self.retry.clone(),
            include_headers: self.request.include_headers,
            fetch_max_bytes: self.fetch_max_bytes,
            metrics: Arc::clone(&self.metrics),
            stop: stop.clone(),
        });

        let planned: Vec<u32> = plans.keys().copied().collect();
        let pool = PartitionPool::new(self.partition_concurrency, planned.len());
        info!(
            backup_id = %self.backup_id,
            partitions = planned.len(),
            concurrency = pool.concurrency(),
            "Backing up partitions"
        );

        let results = pool
            .run(&planned, |partition| {
                let worker = Arc::clone(&worker);
                let plan = plans.get(&partition).copied();
                async move {
                    match plan {
                        Some(plan) => Ok(worker.run(plan).await),
                        None => Err(Error::Worker(format!(
                            "no plan for partition {}",
                            partition
                        ))),
                    }
                }
            })
            .await;

        for (partition, result) in results {
            let outcome = result.unwrap_or_else(|e| {
                PartitionOutcome::Failed(PartitionFailure::from_error(partition, &e, 1))
            });
            match outcome {
                PartitionOutcome::Written {
                    segment,
                    stopped_early,
                } => {
                    manifest.deadline_exceeded |= stopped_early;
                    self.metrics.record_partition_done(true);
                    manifest.add_segment(segment);
                }
                PartitionOutcome::Failed(failure) => {
                    error!(
                        backup_id = %self.backup_id,
                        partition = failure.partition,
                        attempts = failure.attempts,
                        error = %failure.detail,
                        "Partition backup failed"
                    );
                    self.metrics.record_partition_done(false);
                    manifest.add_failure(failure);
                }
            }
        }

        manifest.seal();
        self.save_manifest(&manifest).await?;

        info!(
            backup_id = %self.backup_id,
            status = %manifest.status,
            segments = manifest.segments.len(),
            failed_partitions = manifest.failed_partitions.len(),
            total_messages = manifest.total_messages,
            "Backup finished"
        );
        info!("{}", self.metrics.report());

        Ok(manifest)
    }

    /// Capture watermarks for every partition before any worker starts
    async fn capture_snapshot(
        &self,
        partitions: &[u32],
        stop: &CancellationToken,
    ) -> (BTreeMap<u32, PartitionPlan>, Vec<PartitionFailure>) {
        let mut plans = BTreeMap::new();
        let mut failures = Vec::new();
        let mut total_records = 0u64;

        for (index, &partition) in partitions.iter().enumerate() {
            let mut attempts = 0;
            let outcome = self
                .retry
                .run("watermarks", stop, Some(&self.metrics), |attempt| {
                    attempts = attempt;
                    self.client.watermarks(&self.request.topic, partition)
                })
                .await;

            let watermarks = match outcome {
                RetryOutcome::Success(w) => w,
                RetryOutcome::ExhaustedRetries {
                    attempts,
                    last_error,
                } => {
                    failures.push(PartitionFailure::from_error(partition, &last_error, attempts));
                    continue;
                }
                RetryOutcome::NonRetryable(e) => {
                    failures.push(PartitionFailure::from_error(partition, &e, attempts));
                    continue;
                }
            };

            let requested = self
                .request
                .start_offsets
                .get(&partition)
                .copied()
                .unwrap_or(watermarks.low);
            if requested < watermarks.low {
                warn!(
                    partition,
                    requested,
                    log_start = watermarks.low,
                    "Resume offset below log start, starting at log start"
                );
            }
            let end = self
                .request
                .end_offset
                .map_or(watermarks.high, |cap| cap.min(watermarks.high));
            let start = requested.max(watermarks.low).min(end);

            let quota = self
                .request
                .max_messages
                .map(|max| partition_share(max, partitions.len(), index));

            debug!(
                partition,
                start,
                end,
                high_watermark = watermarks.high,
                quota,
                "Snapshot boundary"
            );
            total_records += end - start;

            plans.insert(
                partition,
                PartitionPlan {
                    partition,
                    start,
                    end,
                    high_watermark: watermarks.high,
                    quota,
                },
            );
        }

        info!(
            backup_id = %self.backup_id,
            partitions = plans.len(),
            total_records,
            "Captured snapshot offsets"
        );
        (plans, failures)
    }

    async fn save_manifest(&self, manifest: &BackupManifest) -> Result<()> {
        let key = manifest_key(&self.backup_id);
        self.storage.put(&key, Bytes::from(manifest.to_json()?)).await?;
        debug!("Saved manifest to {}", key);
        Ok(())
    }
}

/// Per-partition share of `max`; the remainder goes to the first partitions
fn partition_share(max: u64, partitions: usize, index: usize) -> u64 {
    let n = partitions.max(1) as u64;
    max / n + u64::from((index as u64) < max % n)
}

/// Resolve the partition filter against the topic's layout
pub(crate) fn select_partitions(topic: &TopicInfo, filter: Option<&[u32]>) -> Result<Vec<u32>> {
    let Some(filter) = filter else {
        return Ok(topic.partitions.clone());
    };
    if filter.is_empty() {
        return Err(Error::Validation("partition filter is empty".to_string()));
    }

    let mut selected = filter.to_vec();
    selected.sort_unstable();
    selected.dedup();
    if let Some(unknown) = selected.iter().find(|p| !topic.has_partition(**p)) {
        return Err(Error::Validation(format!(
            "topic '{}' has no partition {} ({} partitions)",
            topic.name,
            unknown,
            topic.partition_count()
        )));
    }
    Ok(selected)
}

/// State shared by the workers of one backup
struct PartitionWorker {
    backup_id: String,
    topic: String,
    client: Arc<dyn BrokerClient>,
    storage: Arc<dyn StorageBackend>,
    codec: Arc<dyn Codec>,
    retry: RetryPolicy,
    include_headers: bool,
    fetch_max_bytes: i32,
    metrics: Arc<OperationMetrics>,
    stop: CancellationToken,
}

impl PartitionWorker {
    async fn run(&self, plan: PartitionPlan) -> PartitionOutcome {
        let partition = plan.partition;
        let operation = format!("backup {}:{}", self.topic, partition);
        let mut attempts = 0;

        let outcome = self
            .retry
            .run(&operation, &self.stop, Some(&self.metrics), |attempt| {
                attempts = attempt;
                self.capture(plan)
            })
            .await;

        match outcome {
            RetryOutcome::Success((segment, stopped_early)) => PartitionOutcome::Written {
                segment,
                stopped_early,
            },
            RetryOutcome::ExhaustedRetries {
                attempts,
                last_error,
            } => PartitionOutcome::Failed(PartitionFailure::from_error(
                partition,
                &last_error,
                attempts,
            )),
            RetryOutcome::NonRetryable(e) => {
                PartitionOutcome::Failed(PartitionFailure::from_error(partition, &e, attempts))
            }
        }
    }

    /// One attempt at a partition: fetch up to the boundary and write the segment.
    /// Returns the segment and whether the stop signal cut it short.
    async fn capture(&self, plan: PartitionPlan) -> Result<(PartitionSegmentRef, bool)> {
        let partition = plan.partition;
        let limit = plan.quota.unwrap_or(u64::MAX);
        let mut writer = SegmentWriter::new(partition, plan.start, Arc::clone(&self.codec));
        let mut offset = plan.start;
        let mut stopped_early = false;

        'fetch: while offset < plan.end && u64::from(writer.record_count()) < limit {
            let started = Instant::now();
            let batch = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    stopped_early = true;
                    break 'fetch;
                }
                batch = self.client.fetch(&self.topic, partition, offset, self.fetch_max_bytes) => batch?,
            };
            self.metrics.record_broker_latency(started.elapsed());

            if batch.records.is_empty() && batch.next_offset <= offset {
                debug!(partition, offset, end = plan.end, "No more records below boundary");
                break;
            }

            for mut record in batch.records {
                if record.offset >= plan.end {
                    break 'fetch;
                }
                if !self.include_headers {
                    record.headers.clear();
                }
                writer.append(&record)?;

                if u64::from(writer.record_count()) >= limit {
                    break 'fetch;
                }
                if self.stop.is_cancelled() {
                    stopped_early = true;
                    break 'fetch;
                }
            }

            offset = batch.next_offset.max(writer.end_offset());
        }

        let segment = writer
            .write(
                self.storage.as_ref(),
                &segment_key(&self.backup_id, partition),
                plan.high_watermark,
                &self.metrics,
            )
            .await?;
        self.metrics.record_records(segment.message_count);

        debug!(
            backup_id = %self.backup_id,
            partition,
            records = segment.message_count,
            start_offset = segment.start_offset,
            end_offset = segment.end_offset,
            stopped_early,
            "Completed partition backup"
        );
        Ok((segment, stopped_early))
    }
}
