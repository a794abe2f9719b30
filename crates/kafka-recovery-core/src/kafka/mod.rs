//! Plaintext Kafka wire-protocol adapter.
//!
//! [`KafkaBroker`] implements [`BrokerClient`] on top of a leader-routing
//! connection pool. No TLS, no SASL.

mod client;
mod consumer_groups;
mod fetch;
mod metadata;
mod produce;
mod router;

pub use client::KafkaClient;
pub use metadata::{BrokerMetadata, PartitionMetadata, TopicMetadata};
pub use router::LeaderRouter;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::OnceCell;
use tracing::info;

use crate::broker::{BrokerClient, FetchBatch, OutgoingRecord, TopicInfo, Watermarks};
use crate::config::KafkaConfig;
use crate::error::KafkaError;
use crate::{Error, Result};

/// A Kafka cluster reached over the wire protocol.
///
/// Connects on first use; a failed connect is retried by the next call.
pub struct KafkaBroker {
    config: KafkaConfig,
    router: OnceCell<LeaderRouter>,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            router: OnceCell::new(),
        }
    }

    async fn router(&self) -> Result<&LeaderRouter> {
        self.router
            .get_or_try_init(|| async {
                let router = LeaderRouter::connect(self.config.clone()).await?;
                info!(
                    bootstrap = ?self.config.bootstrap_servers,
                    "Connected to Kafka cluster"
                );
                Ok::<_, Error>(router)
            })
            .await
    }
}

/// Kafka reports missing topics as a protocol error; callers expect `TopicNotFound`.
fn map_topic_error(topic: &str, error: Error) -> Error {
    match error {
        Error::Kafka(KafkaError::TopicNotExists(_)) => Error::TopicNotFound(topic.to_string()),
        other => other,
    }
}

fn to_partition(partition: u32) -> Result<i32> {
    i32::try_from(partition)
        .map_err(|_| Error::Validation(format!("partition {} out of range", partition)))
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn ping(&self) -> Result<()> {
        self.router().await?.ping().await
    }

    async fn topic_metadata(&self, topic: &str) -> Result<TopicInfo> {
        let metadata = self
            .router()
            .await?
            .topic_metadata(topic)
            .await
            .map_err(|e| map_topic_error(topic, e))?;

        let mut partitions: Vec<u32> = metadata
            .partitions
            .iter()
            .filter(|p| p.partition_id >= 0)
            .map(|p| p.partition_id as u32)
            .collect();
        partitions.sort_unstable();

        Ok(TopicInfo {
            name: metadata.name,
            partitions,
        })
    }

    async fn watermarks(&self, topic: &str, partition: u32) -> Result<Watermarks> {
        let (low, high) = self
            .router()
            .await?
            .get_offsets(topic, to_partition(partition)?)
            .await?;
        Ok(Watermarks {
            low: low.max(0) as u64,
            high: high.max(0) as u64,
        })
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_bytes: i32,
    ) -> Result<FetchBatch> {
        let offset = i64::try_from(offset)
            .map_err(|_| Error::Validation(format!("offset {} out of range", offset)))?;
        let max_bytes = max_bytes.min(self.config.fetch_max_bytes);
        self.router()
            .await?
            .fetch(topic, to_partition(partition)?, offset, max_bytes)
            .await
    }

    async fn produce(
        &self,
        topic: &str,
        partition: u32,
        records: &[OutgoingRecord],
    ) -> Result<u64> {
        let base_offset = self
            .router()
            .await?
            .produce(topic, to_partition(partition)?, records)
            .await?;
        Ok(base_offset.max(0) as u64)
    }

    async fn committed_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<HashMap<u32, Option<u64>>> {
        let router = self.router().await?;
        let metadata = router
            .topic_metadata(topic)
            .await
            .map_err(|e| map_topic_error(topic, e))?;
        let partitions: Vec<i32> = metadata.partitions.iter().map(|p| p.partition_id).collect();

        let coordinator = consumer_groups::find_coordinator(router.bootstrap(), group).await?;
        router.bootstrap().update_brokers(vec![coordinator.clone()]);
        let client = router.broker_connection(coordinator.node_id).await?;

        consumer_groups::describe_group_state(&client, group).await?;
        consumer_groups::fetch_offsets(&client, group, topic, &partitions).await
    }
}
