//! Kafka Produce API implementation.

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::messages::{ApiKey, ProduceRequest, ProduceResponse, TopicName};
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{
    Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType,
    NO_PARTITION_LEADER_EPOCH, NO_PRODUCER_EPOCH, NO_PRODUCER_ID, NO_SEQUENCE,
};
use tracing::trace;

use super::KafkaClient;
use crate::broker::OutgoingRecord;
use crate::error::KafkaError;
use crate::Result;

/// Produce timeout requested from the broker
const PRODUCE_TIMEOUT_MS: i32 = 30_000;

/// Produce records to a topic/partition with acks=all; returns the base offset
pub async fn produce(
    client: &KafkaClient,
    topic: &str,
    partition: i32,
    records: &[OutgoingRecord],
) -> Result<i64> {
    if records.is_empty() {
        return Ok(-1);
    }

    let batch = encode_batch(records)?;

    let partition_data = kafka_protocol::messages::produce_request::PartitionProduceData::default()
        .with_index(partition)
        .with_records(Some(batch));

    let topic_data = kafka_protocol::messages::produce_request::TopicProduceData::default()
        .with_name(TopicName(StrBytes::from_string(topic.to_string())))
        .with_partition_data(vec![partition_data]);

    let request = ProduceRequest::default()
        .with_acks(-1)
        .with_timeout_ms(PRODUCE_TIMEOUT_MS)
        .with_topic_data(vec![topic_data]);

    let response: ProduceResponse = client.send_request(ApiKey::Produce, request).await?;

    for topic_response in &response.responses {
        if topic_response.name.as_str() != topic {
            continue;
        }

        for partition_response in &topic_response.partition_responses {
            if partition_response.index != partition {
                continue;
            }

            if partition_response.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition_response.error_code,
                    message: format!(
                        "Produce error for {}:{}: code {}",
                        topic, partition, partition_response.error_code
                    ),
                }
                .into());
            }

            trace!(
                topic,
                partition,
                records = records.len(),
                base_offset = partition_response.base_offset,
                "Produced records"
            );

            return Ok(partition_response.base_offset);
        }
    }

    Err(KafkaError::Protocol("No partition response in produce response".to_string()).into())
}

/// Encode records as one uncompressed v2 record batch
fn encode_batch(records: &[OutgoingRecord]) -> Result<Bytes> {
    let now = chrono::Utc::now().timestamp_millis();

    let kafka_records: Vec<Record> = records
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let headers: IndexMap<StrBytes, Option<Bytes>> = r
                .headers
                .iter()
                .map(|h| {
                    (
                        StrBytes::from_string(String::from_utf8_lossy(&h.key).into_owned()),
                        h.value.clone(),
                    )
                })
                .collect();

            Record {
                transactional: false,
                control: false,
                partition_leader_epoch: NO_PARTITION_LEADER_EPOCH,
                producer_id: NO_PRODUCER_ID,
                producer_epoch: NO_PRODUCER_EPOCH,
                timestamp_type: TimestampType::Creation,
                // relative offset; the broker assigns the real one
                offset: i as i64,
                sequence: NO_SEQUENCE,
                timestamp: r.timestamp.unwrap_or(now),
                key: r.key.clone(),
                value: r.value.clone(),
                headers,
            }
        })
        .collect();

    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };

    let mut buf = BytesMut::new();
    RecordBatchEncoder::encode::<
        _,
        _,
        fn(&mut BytesMut, &mut BytesMut, Compression) -> anyhow::Result<()>,
    >(&mut buf, kafka_records.iter(), &options)
        .map_err(|e| KafkaError::Protocol(format!("Failed to encode records: {:?}", e)))?;

    Ok(buf.freeze())
}
