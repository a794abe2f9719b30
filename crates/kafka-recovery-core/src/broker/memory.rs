//! In-memory broker for tests and local dry runs.
//!
//! Behaves like a single-node cluster: topics have fixed partition counts,
//! offsets are assigned on append, and consumer groups are plain offset maps.
//! Fault injection hooks let tests drive retry and partial-failure paths.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::{BrokerClient, FetchBatch, OutgoingRecord, TopicInfo, Watermarks};
use crate::error::KafkaError;
use crate::segment::MessageRecord;
use crate::{Error, Result};

const REQUEST_TIMED_OUT: i16 = 7;
const MESSAGE_TOO_LARGE: i16 = 10;
const OFFSET_OUT_OF_RANGE: i16 = 1;

#[derive(Debug, Default)]
struct PartitionLog {
    log_start: u64,
    /// `records[i].offset == log_start + i`
    records: Vec<MessageRecord>,
}

impl PartitionLog {
    fn high_watermark(&self) -> u64 {
        self.log_start + self.records.len() as u64
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<PartitionLog>>,
    groups: HashMap<String, HashMap<(String, u32), u64>>,
}

#[derive(Debug)]
struct Faults {
    unreachable: bool,
    failing_fetch: HashSet<(String, u32)>,
    failing_produces: u32,
    failing_offset_fetches: u32,
    max_value_bytes: Option<usize>,
    fetch_delay: Option<Duration>,
    max_records_per_fetch: usize,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            unreachable: false,
            failing_fetch: HashSet::new(),
            failing_produces: 0,
            failing_offset_fetches: 0,
            max_value_bytes: None,
            fetch_delay: None,
            max_records_per_fetch: 100,
        }
    }
}

/// A single-process stand-in for a Kafka cluster
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    produce_calls: AtomicU64,
    fetch_calls: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic (no-op if it exists with the same partition count)
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut state = self.state.lock();
        let logs = state.topics.entry(topic.to_string()).or_default();
        while logs.len() < partitions as usize {
            logs.push(PartitionLog::default());
        }
    }

    /// Append a record with the current time as its timestamp; returns its offset
    pub fn append(
        &self,
        topic: &str,
        partition: u32,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
    ) -> Result<u64> {
        let record = OutgoingRecord {
            key: key.map(Bytes::copy_from_slice),
            value: value.map(Bytes::copy_from_slice),
            headers: Vec::new(),
            timestamp: None,
            source_offset: 0,
        };
        self.append_records(topic, partition, std::slice::from_ref(&record))
    }

    /// Every record currently in a partition
    pub fn records(&self, topic: &str, partition: u32) -> Vec<MessageRecord> {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|logs| logs.get(partition as usize))
            .map(|log| log.records.clone())
            .unwrap_or_default()
    }

    /// Records across all partitions of a topic
    pub fn message_count(&self, topic: &str) -> u64 {
        let state = self.state.lock();
        state
            .topics
            .get(topic)
            .map(|logs| logs.iter().map(|l| l.records.len() as u64).sum())
            .unwrap_or(0)
    }

    /// Drop records below `offset`, as retention would
    pub fn truncate_before(&self, topic: &str, partition: u32, offset: u64) {
        let mut state = self.state.lock();
        if let Some(log) = state
            .topics
            .get_mut(topic)
            .and_then(|logs| logs.get_mut(partition as usize))
        {
            let drop_count = offset.saturating_sub(log.log_start).min(log.records.len() as u64);
            log.records.drain(..drop_count as usize);
            log.log_start += drop_count;
        }
    }

    /// Record a consumer group commit; creates the group if needed
    pub fn commit_offset(&self, group: &str, topic: &str, partition: u32, offset: u64) {
        self.state
            .lock()
            .groups
            .entry(group.to_string())
            .or_default()
            .insert((topic.to_string(), partition), offset);
    }

    /// Register a group with no commits yet
    pub fn create_group(&self, group: &str) {
        self.state.lock().groups.entry(group.to_string()).or_default();
    }

    /// Make every call fail as if the cluster were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.lock().unreachable = unreachable;
    }

    /// Make fetches from one partition fail with a transient error
    pub fn fail_fetches(&self, topic: &str, partition: u32) {
        self.faults
            .lock()
            .failing_fetch
            .insert((topic.to_string(), partition));
    }

    pub fn heal_fetches(&self, topic: &str, partition: u32) {
        self.faults
            .lock()
            .failing_fetch
            .remove(&(topic.to_string(), partition));
    }

    /// Fail the next `count` produce calls with a transient error
    pub fn fail_next_produces(&self, count: u32) {
        self.faults.lock().failing_produces = count;
    }

    /// Fail the next `count` committed-offset lookups with a transient error
    pub fn fail_next_offset_fetches(&self, count: u32) {
        self.faults.lock().failing_offset_fetches = count;
    }

    /// Reject batches containing a value longer than `bytes`
    pub fn reject_values_over(&self, bytes: usize) {
        self.faults.lock().max_value_bytes = Some(bytes);
    }

    /// Delay every fetch
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.faults.lock().fetch_delay = Some(delay);
    }

    pub fn set_max_records_per_fetch(&self, count: usize) {
        self.faults.lock().max_records_per_fetch = count.max(1);
    }

    pub fn produce_calls(&self) -> u64 {
        self.produce_calls.load(Ordering::Relaxed)
    }

    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Relaxed)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.faults.lock().unreachable {
            return Err(KafkaError::ConnectionFailed {
                broker: "in-memory".to_string(),
                message: "connection refused".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn append_records(&self, topic: &str, partition: u32, records: &[OutgoingRecord]) -> Result<u64> {
        let mut state = self.state.lock();
        let log = partition_log_mut(&mut state, topic, partition)?;
        let base_offset = log.high_watermark();
        let now = chrono::Utc::now().timestamp_millis();

        for (i, record) in records.iter().enumerate() {
            log.records.push(MessageRecord {
                partition,
                offset: base_offset + i as u64,
                timestamp: record.timestamp.unwrap_or(now),
                key: record.key.clone(),
                value: record.value.clone(),
                headers: record.headers.clone(),
            });
        }
        Ok(base_offset)
    }
}

fn partition_log<'a>(state: &'a State, topic: &str, partition: u32) -> Result<&'a PartitionLog> {
    let logs = state
        .topics
        .get(topic)
        .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
    logs.get(partition as usize).ok_or_else(|| {
        KafkaError::PartitionNotAvailable {
            topic: topic.to_string(),
            partition: partition as i32,
        }
        .into()
    })
}

fn partition_log_mut<'a>(
    state: &'a mut State,
    topic: &str,
    partition: u32,
) -> Result<&'a mut PartitionLog> {
    let logs = state
        .topics
        .get_mut(topic)
        .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
    logs.get_mut(partition as usize).ok_or_else(|| {
        KafkaError::PartitionNotAvailable {
            topic: topic.to_string(),
            partition: partition as i32,
        }
        .into()
    })
}

fn transient(message: String) -> Error {
    KafkaError::BrokerError {
        code: REQUEST_TIMED_OUT,
        message,
    }
    .into()
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn topic_metadata(&self, topic: &str) -> Result<TopicInfo> {
        self.check_reachable()?;
        let state = self.state.lock();
        let logs = state
            .topics
            .get(topic)
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?;
        Ok(TopicInfo {
            name: topic.to_string(),
            partitions: (0..logs.len() as u32).collect(),
        })
    }

    async fn watermarks(&self, topic: &str, partition: u32) -> Result<Watermarks> {
        self.check_reachable()?;
        let state = self.state.lock();
        let log = partition_log(&state, topic, partition)?;
        Ok(Watermarks {
            low: log.log_start,
            high: log.high_watermark(),
        })
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: u32,
        offset: u64,
        max_bytes: i32,
    ) -> Result<FetchBatch> {
        self.fetch_calls.fetch_add(1, Ordering::Relaxed);
        self.check_reachable()?;

        let (delay, failing, max_records) = {
            let faults = self.faults.lock();
            (
                faults.fetch_delay,
                faults
                    .failing_fetch
                    .contains(&(topic.to_string(), partition)),
                faults.max_records_per_fetch,
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(transient(format!(
                "fetch from {}:{} timed out",
                topic, partition
            )));
        }

        let state = self.state.lock();
        let log = partition_log(&state, topic, partition)?;
        let high_watermark = log.high_watermark();

        if offset < log.log_start || offset > high_watermark {
            return Err(KafkaError::BrokerError {
                code: OFFSET_OUT_OF_RANGE,
                message: format!(
                    "offset {} out of range [{}, {}) for {}:{}",
                    offset, log.log_start, high_watermark, topic, partition
                ),
            }
            .into());
        }

        let mut records = Vec::new();
        let mut bytes = 0usize;
        let budget = max_bytes.max(1) as usize;
        for record in &log.records[(offset - log.log_start) as usize..] {
            let size = record.serialized_size();
            if !records.is_empty() && (bytes + size > budget || records.len() >= max_records) {
                break;
            }
            bytes += size;
            records.push(record.clone());
        }

        let next_offset = records.last().map_or(offset, |r| r.offset + 1);
        Ok(FetchBatch {
            records,
            high_watermark,
            next_offset,
        })
    }

    async fn produce(&self, topic: &str, partition: u32, records: &[OutgoingRecord]) -> Result<u64> {
        self.produce_calls.fetch_add(1, Ordering::Relaxed);
        self.check_reachable()?;

        {
            let mut faults = self.faults.lock();
            if faults.failing_produces > 0 {
                faults.failing_produces -= 1;
                return Err(transient(format!(
                    "produce to {}:{} timed out",
                    topic, partition
                )));
            }
            if let Some(limit) = faults.max_value_bytes {
                if records
                    .iter()
                    .any(|r| r.value.as_ref().is_some_and(|v| v.len() > limit))
                {
                    return Err(KafkaError::BrokerError {
                        code: MESSAGE_TOO_LARGE,
                        message: format!("record larger than {} bytes", limit),
                    }
                    .into());
                }
            }
        }

        self.append_records(topic, partition, records)
    }

    async fn committed_offsets(
        &self,
        group: &str,
        topic: &str,
    ) -> Result<HashMap<u32, Option<u64>>> {
        self.check_reachable()?;
        {
            let mut faults = self.faults.lock();
            if faults.failing_offset_fetches > 0 {
                faults.failing_offset_fetches -= 1;
                return Err(KafkaError::BrokerError {
                    code: 14,
                    message: "COORDINATOR_LOAD_IN_PROGRESS".to_string(),
                }
                .into());
            }
        }

        let state = self.state.lock();
        let commits = state
            .groups
            .get(group)
            .ok_or_else(|| Error::GroupNotFound(group.to_string()))?;
        let partitions = state
            .topics
            .get(topic)
            .ok_or_else(|| Error::TopicNotFound(topic.to_string()))?
            .len() as u32;

        Ok((0..partitions)
            .map(|p| (p, commits.get(&(topic.to_string(), p)).copied()))
            .collect())
    }
}
