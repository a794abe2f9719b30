//! Kafka Fetch and ListOffsets API implementation.

use bytes::Bytes;
use kafka_protocol::messages::{
    ApiKey, BrokerId, FetchRequest, FetchResponse, ListOffsetsRequest, ListOffsetsResponse,
    TopicName,
};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{Record, RecordBatchDecoder};
use tracing::trace;

use super::KafkaClient;
use crate::broker::FetchBatch;
use crate::error::KafkaError;
use crate::segment::{MessageRecord, RecordHeader};
use crate::Result;

/// ListOffsets timestamp for the log start
const EARLIEST_TIMESTAMP: i64 = -2;
/// ListOffsets timestamp for the high watermark
const LATEST_TIMESTAMP: i64 = -1;

/// Fetch records from a topic/partition
pub async fn fetch(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    offset: i64,
    max_bytes: i32,
) -> Result<FetchBatch> {
    let fetch_partition = kafka_protocol::messages::fetch_request::FetchPartition::default()
        .with_partition(partition)
        .with_fetch_offset(offset)
        .with_partition_max_bytes(max_bytes)
        .with_log_start_offset(-1);

    let fetch_topic = kafka_protocol::messages::fetch_request::FetchTopic::default()
        .with_topic(TopicName(StrBytes::from_string(topic.to_string())))
        .with_partitions(vec![fetch_partition]);

    let request = FetchRequest::default()
        .with_replica_id(BrokerId(-1))
        .with_max_wait_ms(client.config().fetch_max_wait_ms)
        .with_min_bytes(1)
        .with_max_bytes(max_bytes)
        .with_isolation_level(0) // READ_UNCOMMITTED
        .with_topics(vec![fetch_topic]);

    let response: FetchResponse = client.send_request(ApiKey::Fetch, request).await?;

    if response.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: response.error_code,
            message: format!("Fetch error for {}:{}", topic, partition),
        }
        .into());
    }

    for topic_response in &response.responses {
        if topic_response.topic.as_str() != topic {
            continue;
        }

        for partition_response in &topic_response.partitions {
            if partition_response.partition_index != partition {
                continue;
            }

            if partition_response.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition_response.error_code,
                    message: format!(
                        "Fetch error for {}:{}: code {}",
                        topic, partition, partition_response.error_code
                    ),
                }
                .into());
            }

            let mut records = Vec::new();
            let mut next_offset = offset.max(0) as u64;
            if let Some(ref data) = partition_response.records {
                if !data.is_empty() {
                    let (decoded, last_offset) = decode_records(data, partition as u32)?;
                    // Batches can start before the requested offset.
                    records = decoded
                        .into_iter()
                        .filter(|r| r.offset >= offset as u64)
                        .collect();
                    // Control records still advance the position.
                    if let Some(last) = last_offset {
                        next_offset = next_offset.max(last + 1);
                    }
                }
            }

            trace!(
                topic,
                partition,
                offset,
                records = records.len(),
                high_watermark = partition_response.high_watermark,
                "Fetched records"
            );

            return Ok(FetchBatch {
                records,
                high_watermark: partition_response.high_watermark.max(0) as u64,
                next_offset,
            });
        }
    }

    Err(KafkaError::PartitionNotAvailable {
        topic: topic.to_string(),
        partition,
    }
    .into())
}

/// Decode record batches, dropping control records.
/// Also returns the highest offset seen, control records included.
fn decode_records(data: &Bytes, partition: u32) -> Result<(Vec<MessageRecord>, Option<u64>)> {
    let mut buf = data.clone();

    let decoded = RecordBatchDecoder::decode::<
        _,
        fn(&mut Bytes, kafka_protocol::records::Compression) -> anyhow::Result<Bytes>,
    >(&mut buf)
    .map_err(|e| KafkaError::Protocol(format!("Failed to decode records: {:?}", e)))?;

    let last_offset = decoded
        .iter()
        .filter(|record| record.offset >= 0)
        .map(|record| record.offset as u64)
        .max();

    let records = decoded
        .into_iter()
        .filter(|record| !record.control && record.offset >= 0)
        .map(|record| convert_record(record, partition))
        .collect();
    Ok((records, last_offset))
}

fn convert_record(record: Record, partition: u32) -> MessageRecord {
    let headers = record
        .headers
        .into_iter()
        .map(|(key, value)| RecordHeader::new(Bytes::from(key.to_string()), value))
        .collect();

    MessageRecord {
        partition,
        offset: record.offset as u64,
        timestamp: record.timestamp,
        key: record.key,
        value: record.value,
        headers,
    }
}

/// Get the log start and high watermark for a partition
pub async fn get_offsets(client: &KafkaClient, topic: &str, partition: i32) -> Result<(i64, i64)> {
    let earliest = list_offset(client, topic, partition, EARLIEST_TIMESTAMP).await?;
    let latest = list_offset(client, topic, partition, LATEST_TIMESTAMP).await?;

    trace!(topic, partition, earliest, latest, "Listed offsets");
    Ok((earliest, latest))
}

async fn list_offset(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    timestamp: i64,
) -> Result<i64> {
    let list_partition =
        kafka_protocol::messages::list_offsets_request::ListOffsetsPartition::default()
            .with_partition_index(partition)
            .with_timestamp(timestamp);

    let list_topic = kafka_protocol::messages::list_offsets_request::ListOffsetsTopic::default()
        .with_name(TopicName(StrBytes::from_string(topic.to_string())))
        .with_partitions(vec![list_partition]);

    let request = ListOffsetsRequest::default()
        .with_replica_id(BrokerId(-1))
        .with_isolation_level(0)
        .with_topics(vec![list_topic]);

    let response: ListOffsetsResponse = client.send_request(ApiKey::ListOffsets, request).await?;

    for topic_response in &response.topics {
        if topic_response.name.as_str() != topic {
            continue;
        }

        for partition_response in &topic_response.partitions {
            if partition_response.partition_index != partition {
                continue;
            }

            if partition_response.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition_response.error_code,
                    message: format!(
                        "ListOffsets error for {}:{}: code {}",
                        topic, partition, partition_response.error_code
                    ),
                }
                .into());
            }

            return Ok(partition_response.offset);
        }
    }

    Err(KafkaError::PartitionNotAvailable {
        topic: topic.to_string(),
        partition,
    }
    .into())
}
