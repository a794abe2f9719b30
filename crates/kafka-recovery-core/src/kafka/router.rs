//! Partition leader routing for multi-broker Kafka clusters.
//!
//! Fetch, list-offsets and produce requests must reach the partition leader.
//! The router keeps a (topic, partition) -> leader map and one connection
//! per broker, refreshing the map when a broker reports it is not the leader.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::broker::{FetchBatch, OutgoingRecord};
use crate::config::KafkaConfig;
use crate::error::KafkaError;
use crate::Result;

use super::metadata::TopicMetadata;
use super::KafkaClient;

/// NOT_LEADER_OR_FOLLOWER
const NOT_LEADER: i16 = 6;

/// Routes Kafka requests to the correct partition leader broker.
pub struct LeaderRouter {
    config: KafkaConfig,

    /// Map of (topic, partition) -> leader broker_id
    partition_leaders: RwLock<HashMap<(String, i32), i32>>,

    /// Connection pool: broker_id -> KafkaClient
    connections: RwLock<HashMap<i32, Arc<KafkaClient>>>,

    /// Bootstrap client for metadata and group lookups
    bootstrap_client: Arc<KafkaClient>,
}

impl LeaderRouter {
    /// Connect to the bootstrap servers.
    pub async fn connect(config: KafkaConfig) -> Result<Self> {
        let bootstrap_client = Arc::new(KafkaClient::new(config.clone()));
        bootstrap_client.connect().await?;

        Ok(Self {
            config,
            partition_leaders: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            bootstrap_client,
        })
    }

    pub fn bootstrap(&self) -> &KafkaClient {
        &self.bootstrap_client
    }

    /// Metadata for one topic; also refreshes its leader map.
    pub async fn topic_metadata(&self, topic: &str) -> Result<TopicMetadata> {
        let metadata = self.bootstrap_client.get_topic_metadata(topic).await?;

        let mut leaders = self.partition_leaders.write().await;
        for partition in &metadata.partitions {
            leaders.insert(
                (metadata.name.clone(), partition.partition_id),
                partition.leader_id,
            );
        }
        debug!(
            topic,
            partitions = metadata.partitions.len(),
            "Refreshed partition leaders"
        );

        Ok(metadata)
    }

    /// Metadata request with no topics, to check the cluster answers
    pub async fn ping(&self) -> Result<()> {
        self.bootstrap_client.fetch_metadata(Some(&[])).await?;
        Ok(())
    }

    async fn leader(&self, topic: &str, partition: i32) -> Result<i32> {
        if let Some(leader) = self
            .partition_leaders
            .read()
            .await
            .get(&(topic.to_string(), partition))
            .copied()
        {
            return Ok(leader);
        }

        self.topic_metadata(topic).await?;
        self.partition_leaders
            .read()
            .await
            .get(&(topic.to_string(), partition))
            .copied()
            .ok_or_else(|| {
                KafkaError::PartitionNotAvailable {
                    topic: topic.to_string(),
                    partition,
                }
                .into()
            })
    }

    /// Get or create a connection to a specific broker.
    pub async fn broker_connection(&self, broker_id: i32) -> Result<Arc<KafkaClient>> {
        if let Some(client) = self.connections.read().await.get(&broker_id) {
            return Ok(Arc::clone(client));
        }

        let broker = self
            .bootstrap_client
            .get_broker(broker_id)
            .ok_or_else(|| KafkaError::Protocol(format!("Unknown broker ID: {}", broker_id)))?;

        debug!(
            broker_id,
            address = %broker.address(),
            "Creating new connection to broker"
        );

        let client = Arc::new(KafkaClient::for_broker(
            self.config.clone(),
            broker.address(),
        ));

        let mut connections = self.connections.write().await;
        Ok(Arc::clone(connections.entry(broker_id).or_insert(client)))
    }

    async fn leader_client(&self, topic: &str, partition: i32) -> Result<Arc<KafkaClient>> {
        let leader_id = self.leader(topic, partition).await?;
        if leader_id < 0 {
            return Err(KafkaError::PartitionNotAvailable {
                topic: topic.to_string(),
                partition,
            }
            .into());
        }
        self.broker_connection(leader_id).await
    }

    /// Forget the leader of a partition so the next call looks it up again
    async fn invalidate(&self, topic: &str, partition: i32) {
        warn!(topic, partition, "Leader moved, refreshing metadata");
        self.partition_leaders
            .write()
            .await
            .remove(&(topic.to_string(), partition));
    }

    /// Fetch records from a partition, routing to the correct leader.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_bytes: i32,
    ) -> Result<FetchBatch> {
        let client = self.leader_client(topic, partition).await?;
        match super::fetch::fetch(&client, topic, partition, offset, max_bytes).await {
            Err(e) if is_not_leader_error(&e) => {
                self.invalidate(topic, partition).await;
                let client = self.leader_client(topic, partition).await?;
                super::fetch::fetch(&client, topic, partition, offset, max_bytes).await
            }
            other => other,
        }
    }

    /// Get the log start and high watermark for a partition.
    pub async fn get_offsets(&self, topic: &str, partition: i32) -> Result<(i64, i64)> {
        let client = self.leader_client(topic, partition).await?;
        match super::fetch::get_offsets(&client, topic, partition).await {
            Err(e) if is_not_leader_error(&e) => {
                self.invalidate(topic, partition).await;
                let client = self.leader_client(topic, partition).await?;
                super::fetch::get_offsets(&client, topic, partition).await
            }
            other => other,
        }
    }

    /// Produce records to a partition, routing to the correct leader.
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        records: &[OutgoingRecord],
    ) -> Result<i64> {
        let client = self.leader_client(topic, partition).await?;
        match super::produce::produce(&client, topic, partition, records).await {
            Err(e) if is_not_leader_error(&e) => {
                self.invalidate(topic, partition).await;
                let client = self.leader_client(topic, partition).await?;
                super::produce::produce(&client, topic, partition, records).await
            }
            other => other,
        }
    }
}

/// Check if an error is a NOT_LEADER_OR_FOLLOWER error.
fn is_not_leader_error(error: &crate::Error) -> bool {
    matches!(
        error,
        crate::Error::Kafka(KafkaError::BrokerError { code, .. }) if *code == NOT_LEADER
    )
}
