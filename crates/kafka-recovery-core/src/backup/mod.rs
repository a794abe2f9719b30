//! Backup: point-in-time snapshots of a topic into segment files.

pub mod engine;
pub mod lock;

pub use engine::{BackupCoordinator, BackupJob, DEFAULT_FETCH_MAX_BYTES};
pub use lock::{BackupLock, BackupLockMap};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::compression::builtin_registry;
use crate::config::CompressionType;
use crate::error::{ErrorKind, StorageError};
use crate::manifest::{manifest_key, BackupManifest, BackupStatus};
use crate::segment::verify_segment;
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// What to back up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub topic: String,

    /// Cluster reference in the cluster registry
    pub cluster: String,

    /// Falls back to the configured default
    #[serde(default)]
    pub compression: Option<CompressionType>,

    /// Cap on records across all partitions
    #[serde(default)]
    pub max_messages: Option<u64>,

    /// Only these partitions; all when unset
    #[serde(default)]
    pub partitions: Option<Vec<u32>>,

    /// Resume offsets per partition; the log start otherwise
    #[serde(default)]
    pub start_offsets: HashMap<u32, u64>,

    /// Exclusive upper bound applied on top of the snapshot boundary
    #[serde(default)]
    pub end_offset: Option<u64>,

    #[serde(default = "default_true")]
    pub include_headers: bool,

    /// Overall deadline for the run
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl BackupRequest {
    pub fn new(topic: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            cluster: cluster.into(),
            compression: None,
            max_messages: None,
            partitions: None,
            start_offsets: HashMap::new(),
            end_offset: None,
            include_headers: true,
            deadline_secs: None,
        }
    }

    pub fn with_compression(mut self, compression: CompressionType) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_max_messages(mut self, max_messages: u64) -> Self {
        self.max_messages = Some(max_messages);
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

    /// Reject requests that can never succeed
    pub fn validate(&self) -> Result<()> {
        if self.topic.trim().is_empty() {
            return Err(Error::Validation("topic name must not be empty".to_string()));
        }
        if self.cluster.trim().is_empty() {
            return Err(Error::Validation("cluster must not be empty".to_string()));
        }
        if self.max_messages == Some(0) {
            return Err(Error::Validation("max_messages must be > 0".to_string()));
        }
        if self.deadline_secs == Some(0) {
            return Err(Error::Validation("deadline_secs must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Backup ids with a manifest in storage, sorted
pub async fn list_backups(storage: &dyn StorageBackend) -> Result<Vec<String>> {
    let keys = storage.list("").await?;
    let mut ids: Vec<String> = keys
        .iter()
        .filter_map(|key| key.strip_suffix("/manifest.json"))
        .filter(|id| !id.contains('/'))
        .map(str::to_string)
        .collect();
    ids.sort();
    Ok(ids)
}

/// Read a manifest. Missing backups yield [`Error::BackupNotFound`].
pub async fn load_manifest(storage: &dyn StorageBackend, backup_id: &str) -> Result<BackupManifest> {
    let data = match storage.get(&manifest_key(backup_id)).await {
        Ok(data) => data,
        Err(Error::Storage(StorageError::NotFound(_))) => {
            return Err(Error::BackupNotFound(backup_id.to_string()))
        }
        Err(e) => return Err(e),
    };
    BackupManifest::from_json(&data)
}

/// One problem found while validating a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// `None` for manifest-level problems
    pub partition: Option<u32>,
    pub kind: ErrorKind,
    pub detail: String,
}

/// Result of checking a backup's manifest and segment files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub backup_id: String,
    pub status: BackupStatus,
    /// Segments were fully decoded and checksummed
    pub deep: bool,
    pub segments_checked: usize,
    pub segments_valid: usize,
    pub total_messages: u64,
    /// Partitions the backup itself failed to capture
    pub missing_partitions: Vec<u32>,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Whether the backup can be restored as recorded
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check that a backup is restorable.
///
/// The shallow check confirms every segment exists with the recorded size.
/// `deep` re-reads each segment and verifies its checksums and record count.
pub async fn validate_backup(
    storage: &dyn StorageBackend,
    backup_id: &str,
    deep: bool,
) -> Result<ValidationReport> {
    let manifest = load_manifest(storage, backup_id).await?;
    let mut issues = Vec::new();

    if let Err(e) = manifest.verify() {
        issues.push(ValidationIssue {
            partition: None,
            kind: e.kind(),
            detail: e.to_string(),
        });
    }

    let codec = builtin_registry().get(manifest.compression)?;
    let mut segments_valid = 0;

    for segment in &manifest.segments {
        let partition = segment.partition_id;
        let result = if deep {
            match verify_segment(storage, codec.as_ref(), segment).await {
                Ok(count) if count == segment.message_count => Ok(()),
                Ok(count) => Err(Error::CorruptBackup(format!(
                    "segment {} holds {} records, manifest says {}",
                    segment.file_path, count, segment.message_count
                ))),
                Err(e) => Err(e),
            }
        } else {
            match storage.size(&segment.file_path).await {
                Ok(size) if size == segment.byte_size => Ok(()),
                Ok(size) => Err(Error::CorruptBackup(format!(
                    "segment {} is {} bytes, manifest says {}",
                    segment.file_path, size, segment.byte_size
                ))),
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                segments_valid += 1;
                debug!(backup_id, partition, "Segment valid");
            }
            Err(e) => {
                warn!(backup_id, partition, error = %e, "Segment invalid");
                issues.push(ValidationIssue {
                    partition: Some(partition),
                    kind: e.kind(),
                    detail: e.to_string(),
                });
            }
        }
    }

    Ok(ValidationReport {
        backup_id: backup_id.to_string(),
        status: manifest.status,
        deep,
        segments_checked: manifest.segments.len(),
        segments_valid,
        total_messages: manifest.total_messages,
        missing_partitions: manifest.failed_partitions.iter().map(|f| f.partition).collect(),
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_yaml_defaults() {
        let request: BackupRequest = serde_yaml::from_str(
            r#"
topic: orders
cluster: primary
compression: gzip
start_offsets:
  0: 100
"#,
        )
        .unwrap();
        assert!(request.include_headers);
        assert_eq!(request.compression, Some(CompressionType::Gzip));
        assert_eq!(request.start_offsets.get(&0), Some(&100));
        request.validate().unwrap();
    }

    #[test]
    fn test_request_validation() {
        assert!(matches!(
            BackupRequest::new("", "primary").validate(),
            Err(Error::Validation(_))
        ));
        assert!(BackupRequest::new("orders", "primary")
            .with_max_messages(0)
            .validate()
            .is_err());
    }
}
