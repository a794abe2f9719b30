//! Consumer group lookups used by the drain monitor.
//!
//! - FindCoordinator: locate the broker that owns a group
//! - DescribeGroups: check the group exists
//! - OffsetFetch: read committed offsets

use kafka_protocol::messages::{
    ApiKey, DescribeGroupsRequest, DescribeGroupsResponse, FindCoordinatorRequest,
    FindCoordinatorResponse, GroupId, OffsetFetchRequest, OffsetFetchResponse, TopicName,
};
use kafka_protocol::protocol::StrBytes;
use std::collections::HashMap;
use tracing::debug;

use super::metadata::BrokerMetadata;
use super::KafkaClient;
use crate::error::KafkaError;
use crate::{Error, Result};

/// GROUP_ID_NOT_FOUND
const GROUP_ID_NOT_FOUND: i16 = 69;

/// Find the coordinator broker for a consumer group
pub async fn find_coordinator(client: &KafkaClient, group_id: &str) -> Result<BrokerMetadata> {
    let request = FindCoordinatorRequest::default()
        .with_key(StrBytes::from_string(group_id.to_string()))
        .with_key_type(0); // group

    let response: FindCoordinatorResponse =
        client.send_request(ApiKey::FindCoordinator, request).await?;

    if response.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: response.error_code,
            message: format!("FindCoordinator failed for group {}", group_id),
        }
        .into());
    }

    let coordinator = BrokerMetadata {
        node_id: response.node_id.0,
        host: response.host.to_string(),
        port: response.port,
    };
    debug!(group = group_id, coordinator = coordinator.node_id, "Found group coordinator");
    Ok(coordinator)
}

/// Group state as reported by the coordinator ("Stable", "Empty", ...).
/// Groups the coordinator has never seen yield [`Error::GroupNotFound`].
pub async fn describe_group_state(client: &KafkaClient, group_id: &str) -> Result<String> {
    let request = DescribeGroupsRequest::default()
        .with_groups(vec![GroupId(StrBytes::from_string(group_id.to_string()))]);

    let response: DescribeGroupsResponse =
        client.send_request(ApiKey::DescribeGroups, request).await?;

    let group = response
        .groups
        .into_iter()
        .find(|g| g.group_id.as_str() == group_id)
        .ok_or_else(|| KafkaError::Protocol(format!("group {} missing from response", group_id)))?;

    if group.error_code == GROUP_ID_NOT_FOUND {
        return Err(Error::GroupNotFound(group_id.to_string()));
    }
    if group.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: group.error_code,
            message: format!("DescribeGroups failed for group {}", group_id),
        }
        .into());
    }

    let state = group.group_state.to_string();
    if state == "Dead" {
        return Err(Error::GroupNotFound(group_id.to_string()));
    }
    Ok(state)
}

/// Committed offsets of a group for the given partitions; `None` where nothing is committed
pub async fn fetch_offsets(
    client: &KafkaClient,
    group_id: &str,
    topic: &str,
    partitions: &[i32],
) -> Result<HashMap<u32, Option<u64>>> {
    let request_topic =
        kafka_protocol::messages::offset_fetch_request::OffsetFetchRequestTopic::default()
            .with_name(TopicName(StrBytes::from_string(topic.to_string())))
            .with_partition_indexes(partitions.to_vec());

    let request = OffsetFetchRequest::default()
        .with_group_id(GroupId(StrBytes::from_string(group_id.to_string())))
        .with_topics(Some(vec![request_topic]));

    let response: OffsetFetchResponse = client.send_request(ApiKey::OffsetFetch, request).await?;

    if response.error_code != 0 {
        return Err(KafkaError::BrokerError {
            code: response.error_code,
            message: format!("OffsetFetch failed for group {}", group_id),
        }
        .into());
    }

    let mut offsets: HashMap<u32, Option<u64>> =
        partitions.iter().map(|p| (*p as u32, None)).collect();

    for response_topic in response.topics {
        if response_topic.name.as_str() != topic {
            continue;
        }
        for partition in response_topic.partitions {
            if partition.error_code != 0 {
                return Err(KafkaError::BrokerError {
                    code: partition.error_code,
                    message: format!(
                        "OffsetFetch failed for {}:{} in group {}",
                        topic, partition.partition_index, group_id
                    ),
                }
                .into());
            }
            let committed = (partition.committed_offset >= 0).then_some(partition.committed_offset as u64);
            offsets.insert(partition.partition_index as u32, committed);
        }
    }

    debug!(
        group = group_id,
        topic,
        partitions = offsets.len(),
        "Fetched committed offsets"
    );
    Ok(offsets)
}
