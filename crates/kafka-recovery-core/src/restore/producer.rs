//! Record producer shared by restore and streaming migration.
//!
//! Records from one source partition are routed to target partitions,
//! produced in batches with retry, and on batch failure replayed one by one
//! so that every record ends up either restored or counted as failed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::PartitionStrategy;
use crate::broker::{BrokerClient, KeyPartitioner, OutgoingRecord, TopicInfo};
use crate::manifest::PartitionReplayReport;
use crate::metrics::OperationMetrics;
use crate::retry::{RetryOutcome, RetryPolicy};
use crate::{Error, Result};

/// Produces replayed records into one target topic
pub struct RecordProducer {
    client: Arc<dyn BrokerClient>,
    target: TopicInfo,
    strategy: PartitionStrategy,
    partitioner: KeyPartitioner,
    retry: RetryPolicy,
    batch_size: usize,
    metrics: Arc<OperationMetrics>,
    cancel: CancellationToken,
}

impl RecordProducer {
    /// Look up the target topic and build a producer for it.
    ///
    /// The target topic must already exist.
    pub async fn connect(
        client: Arc<dyn BrokerClient>,
        topic: &str,
        strategy: PartitionStrategy,
        retry: RetryPolicy,
        batch_size: usize,
        metrics: Arc<OperationMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let target = retry
            .execute("target topic metadata", &cancel, Some(&metrics), |_| {
                client.topic_metadata(topic)
            })
            .await?;
        if target.partitions.is_empty() {
            return Err(Error::Validation(format!(
                "target topic '{}' has no partitions",
                topic
            )));
        }

        debug!(
            topic,
            partitions = target.partition_count(),
            ?strategy,
            "Connected record producer"
        );

        Ok(Self {
            client,
            target,
            strategy,
            partitioner: KeyPartitioner::new(),
            retry,
            batch_size: batch_size.max(1),
            metrics,
            cancel,
        })
    }

    pub fn target(&self) -> &TopicInfo {
        &self.target
    }

    /// `Preserve` needs every source partition to exist on the target
    pub fn check_source_partitions(&self, partitions: &[u32]) -> Result<()> {
        if self.strategy != PartitionStrategy::Preserve {
            return Ok(());
        }
        let missing: Vec<u32> = partitions
            .iter()
            .copied()
            .filter(|p| !self.target.has_partition(*p))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "target topic '{}' has {} partitions; source partitions {:?} do not exist there",
                self.target.name,
                self.target.partition_count(),
                missing
            )))
        }
    }

    /// Target partition for a record read from `source_partition`
    pub fn target_partition(&self, source_partition: u32, key: Option<&[u8]>) -> u32 {
        match self.strategy {
            PartitionStrategy::Preserve => source_partition,
            PartitionStrategy::KeyHash => {
                let index = self
                    .partitioner
                    .partition(key, self.target.partition_count());
                self.target.partitions[index as usize]
            }
        }
    }

    /// Produce `records` in order, accounting every one of them in `report`.
    ///
    /// Once the cancel token fires, records not yet attempted count as skipped.
    pub async fn send(
        &self,
        source_partition: u32,
        records: Vec<OutgoingRecord>,
        report: &mut PartitionReplayReport,
    ) {
        let mut by_target: BTreeMap<u32, Vec<OutgoingRecord>> = BTreeMap::new();
        for record in records {
            let target = self.target_partition(source_partition, record.key.as_deref());
            by_target.entry(target).or_default().push(record);
        }

        for (target, records) in by_target {
            for batch in records.chunks(self.batch_size) {
                if self.cancel.is_cancelled() {
                    report.messages_skipped += batch.len() as u64;
                    continue;
                }
                self.produce_batch(target, batch, report).await;
            }
        }
    }

    async fn produce_batch(
        &self,
        target: u32,
        batch: &[OutgoingRecord],
        report: &mut PartitionReplayReport,
    ) {
        let operation = format!("produce {}:{}", self.target.name, target);
        let started = Instant::now();
        let outcome = self
            .retry
            .run(&operation, &self.cancel, Some(&self.metrics), |_| {
                self.client.produce(&self.target.name, target, batch)
            })
            .await;
        self.metrics.record_broker_latency(started.elapsed());

        let error = match outcome {
            RetryOutcome::Success(_) => {
                report.messages_restored += batch.len() as u64;
                self.metrics.record_records(batch.len() as u64);
                return;
            }
            RetryOutcome::ExhaustedRetries { last_error, .. } => last_error,
            RetryOutcome::NonRetryable(e) => e,
        };

        if self.cancel.is_cancelled() {
            self.fail_records(batch, &error, report);
            return;
        }

        warn!(
            topic = %self.target.name,
            partition = target,
            records = batch.len(),
            error = %error,
            "Batch produce failed, retrying records individually"
        );
        for (i, record) in batch.iter().enumerate() {
            if self.cancel.is_cancelled() {
                self.fail_records(&batch[i..], &error, report);
                return;
            }
            self.produce_one(target, record, report).await;
        }
    }

    async fn produce_one(
        &self,
        target: u32,
        record: &OutgoingRecord,
        report: &mut PartitionReplayReport,
    ) {
        let operation = format!("produce {}:{} @{}", self.target.name, target, record.source_offset);
        let result = self
            .retry
            .execute(&operation, &self.cancel, Some(&self.metrics), |_| {
                self.client
                    .produce(&self.target.name, target, std::slice::from_ref(record))
            })
            .await;

        match result {
            Ok(_) => {
                report.messages_restored += 1;
                self.metrics.record_records(1);
            }
            Err(e) => self.fail_records(std::slice::from_ref(record), &e, report),
        }
    }

    fn fail_records(
        &self,
        records: &[OutgoingRecord],
        error: &Error,
        report: &mut PartitionReplayReport,
    ) {
        warn!(
            topic = %self.target.name,
            source_partition = report.partition,
            records = records.len(),
            error = %error,
            "Records failed after retries"
        );
        report.messages_failed += records.len() as u64;
        report
            .failed_offsets
            .extend(records.iter().map(|r| r.source_offset));
        report.record_error(error);
        self.metrics.record_failed_records(records.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use bytes::Bytes;
    use std::time::Duration;

    fn record(offset: u64, key: &str, value: &str) -> OutgoingRecord {
        OutgoingRecord {
            key: Some(Bytes::from(key.to_string())),
            value: Some(Bytes::from(value.to_string())),
            headers: vec![],
            timestamp: Some(1_000),
            source_offset: offset,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(2))
    }

    async fn producer(
        broker: &Arc<InMemoryBroker>,
        strategy: PartitionStrategy,
    ) -> RecordProducer {
        RecordProducer::connect(
            broker.clone(),
            "target",
            strategy,
            fast_retry(),
            10,
            Arc::new(OperationMetrics::new()),
            CancellationToken::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_key_hash_is_stable_per_key() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("target", 3);
        let producer = producer(&broker, PartitionStrategy::KeyHash).await;

        let first = producer.target_partition(0, Some(b"customer-42"));
        assert_eq!(producer.target_partition(7, Some(b"customer-42")), first);
        assert!(first < 3);
    }

    #[tokio::test]
    async fn test_preserve_rejects_missing_partitions() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("target", 2);
        let producer = producer(&broker, PartitionStrategy::Preserve).await;

        assert!(producer.check_source_partitions(&[0, 1]).is_ok());
        assert!(matches!(
            producer.check_source_partitions(&[0, 1, 2]),
            Err(Error::Validation(_))
        ));
        assert_eq!(producer.target_partition(1, Some(b"k")), 1);
    }

    #[tokio::test]
    async fn test_oversized_record_fails_alone() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("target", 1);
        broker.reject_values_over(8);
        let producer = producer(&broker, PartitionStrategy::KeyHash).await;

        let records = vec![
            record(0, "a", "small"),
            record(1, "b", "far too large a value"),
            record(2, "c", "small"),
        ];
        let mut report = PartitionReplayReport::new(0);
        producer.send(0, records, &mut report).await;

        assert_eq!(report.messages_restored, 2);
        assert_eq!(report.messages_failed, 1);
        assert_eq!(report.failed_offsets, vec![1]);
        assert!(report.last_error.is_some());
        assert_eq!(broker.message_count("target"), 2);
    }

    #[tokio::test]
    async fn test_transient_produce_errors_are_retried() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("target", 1);
        broker.fail_next_produces(2);
        let producer = producer(&broker, PartitionStrategy::KeyHash).await;

        let mut report = PartitionReplayReport::new(0);
        producer
            .send(0, vec![record(0, "a", "1"), record(1, "b", "2")], &mut report)
            .await;

        assert_eq!(report.messages_restored, 2);
        assert_eq!(report.messages_failed, 0);
        assert_eq!(broker.message_count("target"), 2);
    }

    #[tokio::test]
    async fn test_cancelled_records_are_skipped() {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("target", 1);
        let cancel = CancellationToken::new();
        let producer = RecordProducer::connect(
            broker.clone(),
            "target",
            PartitionStrategy::KeyHash,
            fast_retry(),
            10,
            Arc::new(OperationMetrics::new()),
            cancel.clone(),
        )
        .await
        .unwrap();

        cancel.cancel();
        let mut report = PartitionReplayReport::new(0);
        producer.send(0, vec![record(0, "a", "1")], &mut report).await;
        assert_eq!(report.messages_skipped, 1);
        assert_eq!(broker.message_count("target"), 0);
    }
}
