//! Backup manifest and operation report structures.

use serde::{Deserialize, Serialize};

use crate::checksum;
use crate::config::CompressionType;
use crate::error::ErrorKind;
use crate::{Error, Result};

/// Version written into every new manifest
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Storage key of a backup's manifest
pub fn manifest_key(backup_id: &str) -> String {
    format!("{}/manifest.json", backup_id)
}

/// Storage key of one partition's segment
pub fn segment_key(backup_id: &str, partition: u32) -> String {
    format!("{}/segments/partition-{:05}.seg", backup_id, partition)
}

/// Final state of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupStatus {
    /// Every selected partition was captured up to its snapshot boundary
    Success,
    /// Some partitions failed or were cut short; the rest are restorable
    Partial,
    /// Nothing usable was written
    Failed,
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackupStatus::Success => "Success",
            BackupStatus::Partial => "Partial",
            BackupStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Top-level backup manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    #[serde(default = "default_format_version")]
    pub format_version: u32,

    /// Unique backup identifier
    pub backup_id: String,

    /// Source topic name
    pub topic: String,

    /// Cluster reference the topic was read from
    pub source_cluster: String,

    /// Creation timestamp (epoch milliseconds)
    pub created_at: i64,

    /// Completion timestamp (epoch milliseconds)
    #[serde(default)]
    pub completed_at: Option<i64>,

    /// Codec applied to every segment payload
    pub compression: CompressionType,

    /// Partition count of the source topic at snapshot time
    pub partition_count: u32,

    /// Whether record headers were captured
    #[serde(default = "default_true")]
    pub include_headers: bool,

    /// Sum of segment message counts
    pub total_messages: u64,

    /// Sum of segment sizes before compression
    pub total_bytes: u64,

    pub status: BackupStatus,

    /// One entry per successfully written partition, ordered by partition
    pub segments: Vec<PartitionSegmentRef>,

    /// Partitions that produced no segment
    #[serde(default)]
    pub failed_partitions: Vec<PartitionFailure>,

    /// The run stopped at its deadline before every partition reached its boundary
    #[serde(default)]
    pub deadline_exceeded: bool,

    /// CRC32 over the segment checksums in partition order
    pub manifest_checksum: u32,
}

fn default_format_version() -> u32 {
    MANIFEST_FORMAT_VERSION
}

fn default_true() -> bool {
    true
}

/// One partition's segment file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSegmentRef {
    pub partition_id: u32,

    /// First offset contained
    pub start_offset: u64,

    /// One past the last offset contained
    pub end_offset: u64,

    pub message_count: u64,

    /// File size as stored (after compression)
    pub byte_size: u64,

    /// Size of the frames before compression
    pub raw_bytes: u64,

    /// CRC32 of the uncompressed frames
    pub checksum: u32,

    /// Snapshot boundary captured when the backup started
    pub high_watermark: u64,

    /// Storage key of the segment
    pub file_path: String,
}

impl PartitionSegmentRef {
    /// Whether the segment reached the snapshot boundary
    pub fn is_complete(&self) -> bool {
        self.end_offset >= self.high_watermark || self.message_count == 0
    }
}

/// A partition that failed permanently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFailure {
    pub partition: u32,
    pub kind: ErrorKind,
    pub detail: String,
    pub attempts: u32,
}

impl PartitionFailure {
    pub fn from_error(partition: u32, error: &Error, attempts: u32) -> Self {
        Self {
            partition,
            kind: error.kind(),
            detail: error.to_string(),
            attempts,
        }
    }
}

impl BackupManifest {
    /// Create an empty, unsealed manifest
    pub fn new(
        backup_id: impl Into<String>,
        topic: impl Into<String>,
        source_cluster: impl Into<String>,
        compression: CompressionType,
        partition_count: u32,
    ) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            backup_id: backup_id.into(),
            topic: topic.into(),
            source_cluster: source_cluster.into(),
            created_at: chrono::Utc::now().timestamp_millis(),
            completed_at: None,
            compression,
            partition_count,
            include_headers: true,
            total_messages: 0,
            total_bytes: 0,
            status: BackupStatus::Failed,
            segments: Vec::new(),
            failed_partitions: Vec::new(),
            deadline_exceeded: false,
            manifest_checksum: 0,
        }
    }

    pub fn add_segment(&mut self, segment: PartitionSegmentRef) {
        self.segments.push(segment);
    }

    pub fn add_failure(&mut self, failure: PartitionFailure) {
        self.failed_partitions.push(failure);
    }

    /// Compute totals, status and checksum. Call once, before persisting.
    pub fn seal(&mut self) {
        self.segments.sort_by_key(|s| s.partition_id);
        self.failed_partitions.sort_by_key(|f| f.partition);
        self.total_messages = self.segments.iter().map(|s| s.message_count).sum();
        self.total_bytes = self.segments.iter().map(|s| s.raw_bytes).sum();
        self.manifest_checksum = self.compute_checksum();
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());

        self.status = if self.segments.is_empty() && !self.failed_partitions.is_empty() {
            BackupStatus::Failed
        } else if self.failed_partitions.is_empty() && !self.deadline_exceeded {
            BackupStatus::Success
        } else {
            BackupStatus::Partial
        };
    }

    /// Checksum over the segment checksums in partition order
    pub fn compute_checksum(&self) -> u32 {
        let mut ordered: Vec<_> = self
            .segments
            .iter()
            .map(|s| (s.partition_id, s.checksum))
            .collect();
        ordered.sort_by_key(|(partition, _)| *partition);
        checksum::manifest_checksum(ordered.into_iter().map(|(_, crc)| crc))
    }

    /// Check the manifest's own invariants.
    pub fn verify(&self) -> Result<()> {
        if self.format_version > MANIFEST_FORMAT_VERSION {
            return Err(Error::CorruptBackup(format!(
                "manifest {} has unsupported format version {}",
                self.backup_id, self.format_version
            )));
        }

        let counted: u64 = self.segments.iter().map(|s| s.message_count).sum();
        if counted != self.total_messages {
            return Err(Error::CorruptBackup(format!(
                "manifest {} total_messages {} does not match segments ({})",
                self.backup_id, self.total_messages, counted
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for segment in &self.segments {
            if !seen.insert(segment.partition_id) {
                return Err(Error::CorruptBackup(format!(
                    "manifest {} lists partition {} twice",
                    self.backup_id, segment.partition_id
                )));
            }
            if segment.end_offset < segment.start_offset
                || (segment.message_count > 0 && segment.end_offset == segment.start_offset)
            {
                return Err(Error::CorruptBackup(format!(
                    "manifest {} partition {} has invalid offset range {}..{}",
                    self.backup_id, segment.partition_id, segment.start_offset, segment.end_offset
                )));
            }
        }

        checksum::verify(
            &format!("manifest {}", self.backup_id),
            self.manifest_checksum,
            self.compute_checksum(),
        )
    }

    /// Segment for a partition, if it was captured
    pub fn segment(&self, partition: u32) -> Option<&PartitionSegmentRef> {
        self.segments.iter().find(|s| s.partition_id == partition)
    }

    /// Total compressed size on disk
    pub fn stored_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.byte_size).sum()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a manifest, mapping malformed JSON to a corrupt-backup error
    pub fn from_json(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::CorruptBackup(format!("unreadable manifest: {}", e)))
    }
}

/// Final state of a restore or migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayStatus {
    Success,
    PartialSuccess,
    TimedOut,
}

impl std::fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplayStatus::Success => "Success",
            ReplayStatus::PartialSuccess => "PartialSuccess",
            ReplayStatus::TimedOut => "TimedOut",
        };
        f.write_str(s)
    }
}

/// Per-source-partition outcome of replaying records into a target topic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionReplayReport {
    /// Source partition ID
    pub partition: u32,

    pub messages_restored: u64,

    pub messages_failed: u64,

    /// Records never attempted because the deadline passed
    pub messages_skipped: u64,

    /// Source offsets of records that exhausted their retries
    pub failed_offsets: Vec<u64>,

    /// Last error seen for this partition
    pub last_error: Option<String>,

    pub error_kind: Option<ErrorKind>,
}

impl PartitionReplayReport {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            ..Default::default()
        }
    }

    pub fn record_error(&mut self, error: &Error) {
        self.last_error = Some(error.to_string());
        self.error_kind = Some(error.kind());
    }
}

/// Restore report generated after restore completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub restore_id: String,

    /// Backup ID that was restored
    pub backup_id: String,

    pub target_topic: String,

    pub target_cluster: String,

    /// Start time of restore (epoch milliseconds)
    pub start_time: i64,

    /// End time of restore (epoch milliseconds)
    pub end_time: i64,

    pub partitions: Vec<PartitionReplayReport>,

    pub messages_restored: u64,

    pub messages_failed: u64,

    pub messages_skipped: u64,

    /// Partitions the backup itself failed to capture
    pub missing_partitions: Vec<u32>,

    pub status: ReplayStatus,
}

impl RestoreReport {
    pub fn is_success(&self) -> bool {
        self.status == ReplayStatus::Success
    }
}

/// Roll per-partition counts into totals and a status.
pub(crate) fn summarize(
    partitions: &mut [PartitionReplayReport],
    timed_out: bool,
) -> (u64, u64, u64, ReplayStatus) {
    partitions.sort_by_key(|p| p.partition);
    let restored = partitions.iter().map(|p| p.messages_restored).sum();
    let failed: u64 = partitions.iter().map(|p| p.messages_failed).sum();
    let skipped: u64 = partitions.iter().map(|p| p.messages_skipped).sum();

    let status = if timed_out || skipped > 0 {
        ReplayStatus::TimedOut
    } else if failed > 0 {
        ReplayStatus::PartialSuccess
    } else {
        ReplayStatus::Success
    };
    (restored, failed, skipped, status)
}
