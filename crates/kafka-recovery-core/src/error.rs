//! Error types for the Kafka recovery core library.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Kafka recovery library.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Request rejected before any work started
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another backup already holds the lock for this topic
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Checksum or structural mismatch in stored backup data
    #[error("Corrupt backup: {0}")]
    CorruptBackup(String),

    /// Kafka protocol error
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Compression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Topic not found
    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    /// Backup not found
    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    /// Consumer group not found
    #[error("Consumer group not found: {0}")]
    GroupNotFound(String),

    /// Unknown operation id
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Cluster reference not registered
    #[error("Unknown cluster: {0}")]
    UnknownCluster(String),

    /// Retries exhausted for a transient failure
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: Box<Error>,
    },

    /// Operation stopped by deadline or caller cancellation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Worker task panicked or was aborted
    #[error("Worker failed: {0}")]
    Worker(String),
}

/// Kafka-specific errors
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KafkaError {
    /// Connection failed
    #[error("Failed to connect to broker {broker}: {message}")]
    ConnectionFailed { broker: String, message: String },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Broker error response
    #[error("Broker returned error code {code}: {message}")]
    BrokerError { code: i16, message: String },

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// No available brokers
    #[error("No available brokers")]
    NoBrokersAvailable,

    /// Topic does not exist
    #[error("Topic does not exist: {0}")]
    TopicNotExists(String),

    /// Partition not available
    #[error("Partition {partition} not available for topic {topic}")]
    PartitionNotAvailable { topic: String, partition: i32 },
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Storage backend error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid path
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Machine-readable classification carried into every report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Validation,
    Conflict,
    Integrity,
    Resource,
    NotFound,
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Resource => "resource",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Kafka error codes that clear up on their own (leader moves, ISR churn, throttling).
const RETRIABLE_BROKER_CODES: &[i16] = &[
    5,  // LEADER_NOT_AVAILABLE
    6,  // NOT_LEADER_OR_FOLLOWER
    7,  // REQUEST_TIMED_OUT
    8,  // BROKER_NOT_AVAILABLE
    13, // NETWORK_EXCEPTION
    14, // COORDINATOR_LOAD_IN_PROGRESS
    15, // COORDINATOR_NOT_AVAILABLE
    16, // NOT_COORDINATOR
    19, // NOT_ENOUGH_REPLICAS
    20, // NOT_ENOUGH_REPLICAS_AFTER_APPEND
    56, // KAFKA_STORAGE_ERROR
    74, // FENCED_LEADER_EPOCH
    75, // UNKNOWN_LEADER_EPOCH
];

impl Error {
    /// Classify this error for reporting and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) | Error::Validation(_) => ErrorKind::Validation,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::CorruptBackup(_) | Error::Compression(_) | Error::Serialization(_) => {
                ErrorKind::Integrity
            }
            Error::Kafka(KafkaError::TopicNotExists(_)) => ErrorKind::NotFound,
            Error::Kafka(KafkaError::BrokerError { code, .. })
                if !RETRIABLE_BROKER_CODES.contains(code) =>
            {
                ErrorKind::Resource
            }
            Error::Kafka(_) => ErrorKind::Transient,
            Error::Storage(StorageError::NotFound(_)) => ErrorKind::NotFound,
            Error::Storage(_) | Error::Io(_) | Error::Worker(_) => ErrorKind::Resource,
            Error::TopicNotFound(_)
            | Error::BackupNotFound(_)
            | Error::GroupNotFound(_)
            | Error::OperationNotFound(_)
            | Error::UnknownCluster(_) => ErrorKind::NotFound,
            Error::RetriesExhausted { last_error, .. } => last_error.kind(),
            Error::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::RetriesExhausted { .. } => false,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            other => other.kind() == ErrorKind::Transient,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
