//! Broker client seam.
//!
//! Coordinators talk to clusters only through [`BrokerClient`]. The wire
//! protocol adapter in [`crate::kafka`] implements it against a real cluster;
//! [`InMemoryBroker`] implements it for tests and dry runs.

mod memory;
mod partitioner;

pub use memory::InMemoryBroker;
pub use partitioner::{murmur2, KeyPartitioner};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::KafkaConfig;
use crate::segment::{MessageRecord, RecordHeader};
use crate::{Error, Result};

/// Partitions of a topic as seen by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    /// Partition ids, sorted
    pub partitions: Vec<u32>,
}

impl TopicInfo {
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    pub fn has_partition(&self, partition: u32) -> bool {
        self.partitions.binary_search(&partition).is_ok()
    }
}

/// Log start and high watermark of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: u64,
    pub high: u64,
}

/// Records returned by one fetch
#[derive(Debug, Clone, Default)]
pub struct FetchBatch {
    pub records: Vec<MessageRecord>,
    pub high_watermark: u64,
    /// Offset to fetch next
    pub next_offset: u64,
}

/// A record on its way to a target topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingRecord {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
    /// Broker assigns the append time when `None`
    pub timestamp: Option<i64>,
    /// Offset of the record this one was copied from
    pub source_offset: u64,
}

impl OutgoingRecord {
    pub fn from_message(
        record: MessageRecord,
        preserve_timestamp: bool,
        include_headers: bool,
    ) -> Self {
        Self {
            key: record.key,
            value: record.value,
            headers: if include_headers {
                record.headers
            } else {
                Vec::new()
            },
            timestamp: preserve_timestamp.then_some(record.timestamp),
            source_offset: record.offset,
        }
    }
}

/// Everything the coordinators need from a cluster
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Check the cluster answers at all
    async fn ping(&self) -> Result<()>;

    /// Partition layout of a topic. Missing topics yield [`Error::TopicNotFound`].
    async fn topic_metadata(&self, topic: &str) -> Result<TopicInfo>;

    async fn watermarks(&self, topic: &str, partition: u32) -> Result<Watermarks>;

    /// Read records starting at `offset`, bounded roughly by `max_bytes`
    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_bytes: i32,
    ) -> Result<FetchBatch>;

    /// Append records in order; returns the base offset assigned
    async fn produce(&self, topic: &str, partition: u32, records: &[OutgoingRecord])
        -> Result<u64>;

    /// Committed offsets of `group` for `topic`; `None` where nothing is committed.
    /// Unknown groups yield [`Error::GroupNotFound`].
    async fn committed_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<HashMap<u32, Option<u64>>>;
}

/// Named clusters that requests refer to by `cluster_ref`
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, Arc<dyn BrokerClient>>>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register wire-protocol clients for every configured cluster.
    /// Connections are opened lazily on first use.
    pub fn from_config(clusters: &HashMap<String, KafkaConfig>) -> Self {
        let registry = Self::new();
        for (name, config) in clusters {
            registry.register(
                name.clone(),
                Arc::new(crate::kafka::KafkaBroker::new(config.clone())),
            );
        }
        registry
    }

    pub fn register(&self, name: impl Into<String>, client: Arc<dyn BrokerClient>) {
        self.clusters.write().insert(name.into(), client);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn BrokerClient>> {
        self.clusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCluster(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clusters.read().contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.clusters.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("clusters", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ClusterRegistry::new();
        registry.register("primary", Arc::new(InMemoryBroker::new()));
        assert!(registry.get("primary").is_ok());
        assert!(matches!(
            registry.get("dr"),
            Err(Error::UnknownCluster(name)) if name == "dr"
        ));
        assert_eq!(registry.names(), vec!["primary"]);
    }

    #[test]
    fn test_outgoing_record_flags() {
        let record = MessageRecord {
            partition: 0,
            offset: 9,
            timestamp: 1234,
            key: Some(Bytes::from("k")),
            value: None,
            headers: vec![RecordHeader::new("h", None)],
        };
        let out = OutgoingRecord::from_message(record.clone(), false, false);
        assert_eq!(out.timestamp, None);
        assert!(out.headers.is_empty());
        assert_eq!(out.source_offset, 9);

        let out = OutgoingRecord::from_message(record, true, true);
        assert_eq!(out.timestamp, Some(1234));
        assert_eq!(out.headers.len(), 1);
    }
}
