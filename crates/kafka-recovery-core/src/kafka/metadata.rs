//! Kafka Metadata API implementation.

use kafka_protocol::messages::{ApiKey, MetadataRequest, MetadataResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use tracing::debug;

use super::KafkaClient;
use crate::error::KafkaError;
use crate::Result;

/// UNKNOWN_TOPIC_OR_PARTITION
const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;

/// Broker metadata
#[derive(Debug, Clone)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl BrokerMetadata {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Topic metadata
#[derive(Debug, Clone)]
pub struct TopicMetadata {
    pub name: String,
    pub partitions: Vec<PartitionMetadata>,
}

/// Partition metadata
#[derive(Debug, Clone)]
pub struct PartitionMetadata {
    pub partition_id: i32,
    pub leader_id: i32,
}

/// Fetch cluster metadata from the broker.
///
/// `Some(&[])` asks for brokers only.
pub async fn fetch_metadata(
    client: &KafkaClient,
    topics: Option<&[String]>,
) -> Result<Vec<TopicMetadata>> {
    let request = match topics {
        Some(topic_names) => {
            let topic_list: Vec<_> = topic_names
                .iter()
                .map(|name| {
                    kafka_protocol::messages::metadata_request::MetadataRequestTopic::default()
                        .with_name(Some(TopicName(StrBytes::from_string(name.clone()))))
                })
                .collect();
            MetadataRequest::default()
                .with_topics(Some(topic_list))
                .with_allow_auto_topic_creation(false)
        }
        None => MetadataRequest::default()
            .with_topics(None)
            .with_allow_auto_topic_creation(false),
    };

    let response: MetadataResponse = client.send_request(ApiKey::Metadata, request).await?;

    let brokers: Vec<BrokerMetadata> = response
        .brokers
        .iter()
        .map(|broker| BrokerMetadata {
            node_id: broker.node_id.0,
            host: broker.host.to_string(),
            port: broker.port,
        })
        .collect();

    debug!(brokers = brokers.len(), "Discovered brokers");
    client.update_brokers(brokers);

    let mut result = Vec::with_capacity(response.topics.len());
    for topic in &response.topics {
        let name = topic
            .name
            .as_ref()
            .map(|n| n.to_string())
            .unwrap_or_default();

        match topic.error_code {
            0 => {}
            UNKNOWN_TOPIC_OR_PARTITION => {
                debug!(topic = %name, "Topic does not exist");
                continue;
            }
            code => {
                return Err(KafkaError::BrokerError {
                    code,
                    message: format!("Metadata error for topic {}", name),
                }
                .into());
            }
        }

        let mut partitions: Vec<PartitionMetadata> = topic
            .partitions
            .iter()
            .map(|p| PartitionMetadata {
                partition_id: p.partition_index,
                leader_id: p.leader_id.0,
            })
            .collect();
        partitions.sort_by_key(|p| p.partition_id);

        result.push(TopicMetadata { name, partitions });
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_address() {
        let broker = BrokerMetadata {
            node_id: 1,
            host: "kafka-1".to_string(),
            port: 9092,
        };
        assert_eq!(broker.address(), "kafka-1:9092");
    }
}
