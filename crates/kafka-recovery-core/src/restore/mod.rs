//! Restore: replay a backup's segments into a target topic.

pub mod engine;
pub mod producer;

pub use engine::{RestoreCoordinator, RestoreJob};
pub use producer::RecordProducer;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, Result};

/// How records are assigned to target partitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// murmur2 over the key, like the Kafka default partitioner
    #[default]
    KeyHash,
    /// Same partition id as the source
    Preserve,
}

/// What to restore and where
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRequest {
    pub backup_id: String,

    /// Must already exist on the target cluster
    pub target_topic: String,

    pub target_cluster: String,

    /// Re-read and checksum every segment before producing anything
    #[serde(default = "default_true")]
    pub validate_checksum: bool,

    /// Only these source partitions; all backed-up partitions when unset
    #[serde(default)]
    pub partitions: Option<Vec<u32>>,

    #[serde(default)]
    pub partition_strategy: PartitionStrategy,

    #[serde(default = "default_true")]
    pub preserve_timestamps: bool,

    #[serde(default = "default_true")]
    pub include_headers: bool,

    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl RestoreRequest {
    pub fn new(
        backup_id: impl Into<String>,
        target_topic: impl Into<String>,
        target_cluster: impl Into<String>,
    ) -> Self {
        Self {
            backup_id: backup_id.into(),
            target_topic: target_topic.into(),
            target_cluster: target_cluster.into(),
            validate_checksum: true,
            partitions: None,
            partition_strategy: PartitionStrategy::default(),
            preserve_timestamps: true,
            include_headers: true,
            deadline_secs: None,
        }
    }

    pub fn with_strategy(mut self, strategy: PartitionStrategy) -> Self {
        self.partition_strategy = strategy;
        self
    }

    pub fn with_partitions(mut self, partitions: Vec<u32>) -> Self {
        self.partitions = Some(partitions);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_secs = Some(deadline.as_secs().max(1));
        self
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backup_id.trim().is_empty() {
            return Err(Error::Validation("backup_id must not be empty".to_string()));
        }
        if self.target_topic.trim().is_empty() {
            return Err(Error::Validation("target_topic must not be empty".to_string()));
        }
        if self.target_cluster.trim().is_empty() {
            return Err(Error::Validation(
                "target_cluster must not be empty".to_string(),
            ));
        }
        if matches!(self.partitions.as_deref(), Some([])) {
            return Err(Error::Validation("partition filter is empty".to_string()));
        }
        if self.deadline_secs == Some(0) {
            return Err(Error::Validation("deadline_secs must be > 0".to_string()));
        }
        Ok(())
    }
}
