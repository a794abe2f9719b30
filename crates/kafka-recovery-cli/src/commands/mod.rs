pub mod backup;
pub mod describe;
pub mod drain;
pub mod list;
pub mod migrate;
pub mod restore;
pub mod validate;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use kafka_recovery_core::{Config, OperationState, OperationStatus, RecoveryService};
use tracing::{info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// Read and validate a YAML configuration file
pub async fn load_config(config_path: &str) -> Result<Config> {
    info!("Loading configuration from: {}", config_path);

    let contents = tokio::fs::read_to_string(config_path)
        .await
        .with_context(|| format!("failed to read {}", config_path))?;
    let config = Config::from_yaml(&contents)
        .with_context(|| format!("invalid configuration in {}", config_path))?;
    Ok(config)
}

/// Wait for a background operation, logging progress periodically.
/// Ctrl-C cancels the operation; the wait continues until it winds down.
pub async fn wait_with_progress(service: &RecoveryService, id: &str) -> Result<OperationStatus> {
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.tick().await;

    let wait = service.wait(id);
    tokio::pin!(wait);
    let mut interrupted = false;

    loop {
        tokio::select! {
            status = &mut wait => return Ok(status?),
            _ = ticker.tick() => {
                let progress = service
                    .list_operations()
                    .into_iter()
                    .find(|s| s.id == id)
                    .and_then(|s| s.progress);
                if let Some(p) = progress {
                    info!(
                        operation = id,
                        records = p.records_processed,
                        failed = p.records_failed,
                        partitions_done = p.partitions_completed,
                        partitions_total = p.partitions_total,
                        "Progress"
                    );
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                warn!(operation = id, "Interrupted, cancelling");
                service.cancel(id)?;
                interrupted = true;
            }
        }
    }
}

/// Turn a failed operation into an error
pub fn ensure_completed(status: &OperationStatus) -> Result<()> {
    if let OperationState::Failed { kind, error } = &status.state {
        bail!("{} failed ({:?}): {}", status.id, kind, error);
    }
    Ok(())
}

pub fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    const TB: u64 = GB * 1024;

    if bytes >= TB {
        format!("{:.2} TB", bytes as f64 / TB as f64)
    } else if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

pub fn format_duration_ms(millis: i64) -> String {
    let secs = millis.max(0) as f64 / 1000.0;
    if secs >= 3600.0 {
        format!("{:.1}h", secs / 3600.0)
    } else if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.2}s", secs)
    }
}
