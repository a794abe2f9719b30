//! Test helper utilities.
//!
//! Builds a source and a target in-memory cluster, a storage backend and
//! coordinators wired the way `RecoveryService` wires them.

use std::sync::Arc;

use bytes::Bytes;
use kafka_recovery_core::broker::OutgoingRecord;
use kafka_recovery_core::config::RetryConfig;
use kafka_recovery_core::segment::{MessageRecord, RecordHeader};
use kafka_recovery_core::{
    BackupCoordinator, BrokerClient, ClusterRegistry, Config, InMemoryBroker, MemoryBackend,
    MigrationCoordinator, RecoveryService, RestoreCoordinator, StorageBackend,
};

pub const SOURCE: &str = "primary";
pub const TARGET: &str = "dr";

/// Config with short retry delays so failure paths finish quickly
pub fn fast_config() -> Config {
    let mut config = Config::with_storage_root("unused");
    config.retry = RetryConfig {
        max_attempts: 2,
        base_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 5,
    };
    config.produce_batch_size = 50;
    config
}

pub struct Harness {
    pub source: Arc<InMemoryBroker>,
    pub target: Arc<InMemoryBroker>,
    pub storage: Arc<dyn StorageBackend>,
    pub clusters: Arc<ClusterRegistry>,
    pub config: Config,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_storage(Arc::new(MemoryBackend::new()))
    }

    pub fn with_storage(storage: Arc<dyn StorageBackend>) -> Self {
        let source = Arc::new(InMemoryBroker::new());
        let target = Arc::new(InMemoryBroker::new());
        let clusters = Arc::new(ClusterRegistry::new());
        clusters.register(SOURCE, source.clone());
        clusters.register(TARGET, target.clone());
        Self {
            source,
            target,
            storage,
            clusters,
            config: fast_config(),
        }
    }

    pub fn backup(&self) -> Arc<BackupCoordinator> {
        Arc::new(BackupCoordinator::new(
            &self.config,
            Arc::clone(&self.storage),
            Arc::clone(&self.clusters),
        ))
    }

    pub fn restore(&self) -> Arc<RestoreCoordinator> {
        Arc::new(RestoreCoordinator::new(
            &self.config,
            Arc::clone(&self.storage),
            Arc::clone(&self.clusters),
        ))
    }

    pub fn migration(&self) -> MigrationCoordinator {
        MigrationCoordinator::new(
            &self.config,
            Arc::clone(&self.clusters),
            self.backup(),
            self.restore(),
        )
    }

    pub fn service(&self) -> RecoveryService {
        RecoveryService::with_parts(
            self.config.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.clusters),
        )
    }
}

/// Append `per_partition` keyed records to every partition of a new topic
pub fn seed_topic(broker: &InMemoryBroker, topic: &str, partitions: u32, per_partition: u64) {
    broker.create_topic(topic, partitions);
    for p in 0..partitions {
        for i in 0..per_partition {
            let key = format!("key-{}-{}", p, i);
            let value = format!("value-{}-{}", p, i);
            broker
                .append(topic, p, Some(key.as_bytes()), Some(value.as_bytes()))
                .unwrap();
        }
    }
}

/// Produce records carrying headers, fixed timestamps and some null keys
pub async fn seed_rich_topic(broker: &InMemoryBroker, topic: &str, partitions: u32, per_partition: u64) {
    broker.create_topic(topic, partitions);
    for p in 0..partitions {
        let records: Vec<OutgoingRecord> = (0..per_partition)
            .map(|i| OutgoingRecord {
                key: (i % 4 != 0).then(|| Bytes::from(format!("k{}-{}", p, i))),
                value: (i % 7 != 3).then(|| Bytes::from(format!("payload {} {}", p, i).repeat(8))),
                headers: vec![
                    RecordHeader::new("trace-id", Some(Bytes::from(format!("t{}", i)))),
                    RecordHeader::new("empty", None),
                ],
                timestamp: Some(1_700_000_000_000 + i as i64 * 10),
                source_offset: i,
            })
            .collect();
        broker.produce(topic, p, &records).await.unwrap();
    }
}

/// The parts of a record a restore must reproduce
pub fn content(records: &[MessageRecord]) -> Vec<(Option<Bytes>, Option<Bytes>, i64, Vec<RecordHeader>)> {
    records
        .iter()
        .map(|r| (r.key.clone(), r.value.clone(), r.timestamp, r.headers.clone()))
        .collect()
}
