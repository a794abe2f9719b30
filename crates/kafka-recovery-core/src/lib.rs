//! Kafka Recovery Core Library
//!
//! This crate provides the disaster-recovery engine for Kafka topics:
//! point-in-time backups into checksummed segment files, restores into a
//! target topic, cross-cluster migration and consumer group drain monitoring.

pub mod backup;
pub mod broker;
pub mod checksum;
pub mod compression;
pub mod config;
pub mod drain;
pub mod error;
pub mod kafka;
pub mod manifest;
pub mod metrics;
pub mod migrate;
pub mod pool;
pub mod restore;
pub mod retry;
pub mod segment;
pub mod service;
pub mod storage;

pub use backup::{
    list_backups, load_manifest, validate_backup, BackupCoordinator, BackupRequest,
    ValidationReport,
};
pub use broker::{BrokerClient, ClusterRegistry, InMemoryBroker};
pub use compression::{Codec, CodecRegistry};
pub use config::{CompressionType, Config, DrainConfig, KafkaConfig, RetryConfig, StorageConfig};
pub use drain::{DrainMonitor, DrainOptions, DrainState, DrainStatus};
pub use error::{Error, ErrorKind, Result};
pub use manifest::{
    BackupManifest, BackupStatus, PartitionReplayReport, PartitionSegmentRef, ReplayStatus,
    RestoreReport,
};
pub use metrics::{OperationMetrics, ProgressReport};
pub use migrate::{
    MigrationCoordinator, MigrationMode, MigrationReport, MigrationRequest, Transform,
};
pub use restore::{PartitionStrategy, RestoreCoordinator, RestoreRequest};
pub use retry::{RetryOutcome, RetryPolicy};
pub use service::{OperationKind, OperationState, OperationStatus, RecoveryService};
pub use storage::{FilesystemBackend, MemoryBackend, StorageBackend};
