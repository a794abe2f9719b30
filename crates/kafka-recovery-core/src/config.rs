//! Configuration structures for the recovery engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::backup::BackupRequest;
use crate::migrate::MigrationRequest;
use crate::restore::RestoreRequest;

/// Upper bound on per-operation partition workers.
pub const MAX_PARTITION_CONCURRENCY: usize = 16;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where backups are written
    pub storage: StorageConfig,

    /// Codec used when a request does not pick one
    #[serde(default)]
    pub default_compression: CompressionType,

    /// Backups allowed to run at the same time across all topics
    #[serde(default = "default_max_concurrent_backups")]
    pub max_concurrent_backups: usize,

    /// Partition workers per operation
    #[serde(default = "default_partition_concurrency")]
    pub partition_concurrency: usize,

    /// Records per produce request during restore and migration
    #[serde(default = "default_produce_batch_size")]
    pub produce_batch_size: usize,

    /// Backoff applied to broker calls
    #[serde(default)]
    pub retry: RetryConfig,

    /// Drain monitor defaults
    #[serde(default)]
    pub drain: DrainConfig,

    /// Named clusters that requests refer to
    #[serde(default)]
    pub clusters: HashMap<String, KafkaConfig>,

    /// Backup job (CLI `backup` command)
    #[serde(default)]
    pub backup: Option<BackupRequest>,

    /// Restore job (CLI `restore` command)
    #[serde(default)]
    pub restore: Option<RestoreRequest>,

    /// Migration job (CLI `migrate` command)
    #[serde(default)]
    pub migrate: Option<MigrationRequest>,
}

/// Filesystem storage location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for manifests and segments
    pub root: PathBuf,
}

/// Kafka cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Bootstrap servers
    pub bootstrap_servers: Vec<String>,

    /// Client id sent with every request
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Upper bound for a single fetch response
    #[serde(default = "default_fetch_max_bytes")]
    pub fetch_max_bytes: i32,

    /// Broker-side wait for fetch requests
    #[serde(default = "default_fetch_max_wait_ms")]
    pub fetch_max_wait_ms: i32,

    /// Socket tuning
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// TCP socket options applied to broker connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_true")]
    pub tcp_keepalive: bool,

    #[serde(default = "default_keepalive_time_secs")]
    pub keepalive_time_secs: u64,

    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,

    /// Time allowed for a single request/response exchange
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            tcp_keepalive: true,
            keepalive_time_secs: default_keepalive_time_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            tcp_nodelay: true,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Drain monitor defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Consecutive within-threshold polls required before Drained
    #[serde(default = "default_debounce_count")]
    pub debounce_count: u32,

    #[serde(default = "default_drain_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub max_lag: i64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            debounce_count: default_debounce_count(),
            timeout_secs: default_drain_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_lag: 0,
        }
    }
}

impl DrainConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Compression type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    None,
    #[default]
    Gzip,
    #[serde(alias = "snappy")]
    FastBlock,
    #[serde(alias = "lz4")]
    UltraFastBlock,
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::FastBlock => "fast_block",
            CompressionType::UltraFastBlock => "ultra_fast_block",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for CompressionType {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "fast_block" | "fast-block" | "snappy" => Ok(CompressionType::FastBlock),
            "ultra_fast_block" | "ultra-fast-block" | "lz4" => Ok(CompressionType::UltraFastBlock),
            other => Err(crate::Error::Config(format!(
                "Unknown compression type: {}",
                other
            ))),
        }
    }
}

/// Workers to run per operation when the config does not say.
pub fn default_partition_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, MAX_PARTITION_CONCURRENCY)
}

fn default_max_concurrent_backups() -> usize {
    4
}

fn default_produce_batch_size() -> usize {
    500
}

fn default_client_id() -> String {
    "kafka-recovery".to_string()
}

fn default_fetch_max_bytes() -> i32 {
    1024 * 1024
}

fn default_fetch_max_wait_ms() -> i32 {
    500
}

fn default_true() -> bool {
    true
}

fn default_keepalive_time_secs() -> u64 {
    60
}

fn default_keepalive_interval_secs() -> u64 {
    20
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_debounce_count() -> u32 {
    3
}

fn default_drain_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

impl Config {
    /// Minimal config rooted at `root` with every other field defaulted.
    pub fn with_storage_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig { root: root.into() },
            default_compression: CompressionType::default(),
            max_concurrent_backups: default_max_concurrent_backups(),
            partition_concurrency: default_partition_concurrency(),
            produce_batch_size: default_produce_batch_size(),
            retry: RetryConfig::default(),
            drain: DrainConfig::default(),
            clusters: HashMap::new(),
            backup: None,
            restore: None,
            migrate: None,
        }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> crate::Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.storage.root.as_os_str().is_empty() {
            return Err(crate::Error::Config(
                "storage.root must not be empty".to_string(),
            ));
        }

        if self.max_concurrent_backups == 0 {
            return Err(crate::Error::Config(
                "max_concurrent_backups must be > 0".to_string(),
            ));
        }

        if self.partition_concurrency == 0 {
            return Err(crate::Error::Config(
                "partition_concurrency must be > 0".to_string(),
            ));
        }

        if self.produce_batch_size == 0 {
            return Err(crate::Error::Config(
                "produce_batch_size must be > 0".to_string(),
            ));
        }

        self.retry.validate()?;

        if self.drain.debounce_count == 0 {
            return Err(crate::Error::Config(
                "drain.debounce_count must be > 0".to_string(),
            ));
        }

        if self.drain.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "drain.poll_interval_ms must be > 0".to_string(),
            ));
        }

        for (name, cluster) in &self.clusters {
            if cluster.bootstrap_servers.is_empty() {
                return Err(crate::Error::Config(format!(
                    "Cluster '{}' has no bootstrap_servers",
                    name
                )));
            }
        }

        Ok(())
    }
}

impl RetryConfig {
    /// Validate retry parameters
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_attempts == 0 {
            return Err(crate::Error::Config(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }

        if self.multiplier < 1.0 {
            return Err(crate::Error::Config(format!(
                "retry.multiplier must be >= 1.0 (got {})",
                self.multiplier
            )));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(crate::Error::Config(format!(
                "retry.max_delay_ms ({}) < retry.base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }

        Ok(())
    }
}
