use anyhow::{bail, Context, Result};
use kafka_recovery_core::{BackupStatus, RecoveryService};
use tracing::info;

use super::{ensure_completed, format_bytes, format_duration_ms, wait_with_progress};

pub async fn run(config_path: &str) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let request = config
        .backup
        .clone()
        .context("configuration has no `backup` section")?;

    let service = RecoveryService::new(config)?;

    info!(
        "Starting backup of topic {} from cluster {}",
        request.topic, request.cluster
    );
    let backup_id = service.start_backup(request)?;

    let status = wait_with_progress(&service, &backup_id).await?;
    ensure_completed(&status)?;

    let manifest = service
        .backup_result(&backup_id)
        .context("backup finished without a manifest")?;

    println!("Backup ID:   {}", manifest.backup_id);
    println!("Topic:       {}", manifest.topic);
    println!("Status:      {}", manifest.status);
    println!(
        "Partitions:  {}/{} captured",
        manifest.segments.len(),
        manifest.partition_count
    );
    println!("Messages:    {}", manifest.total_messages);
    println!(
        "Size:        {} ({} stored, {})",
        format_bytes(manifest.total_bytes),
        format_bytes(manifest.stored_bytes()),
        manifest.compression
    );
    if let Some(completed) = manifest.completed_at {
        println!(
            "Duration:    {}",
            format_duration_ms(completed - manifest.created_at)
        );
    }
    for failure in &manifest.failed_partitions {
        println!(
            "  partition {} failed after {} attempts: {}",
            failure.partition, failure.attempts, failure.detail
        );
    }
    if manifest.deadline_exceeded {
        println!("  deadline exceeded before every partition reached its boundary");
    }

    match manifest.status {
        BackupStatus::Success => {
            info!("Backup completed successfully");
            Ok(())
        }
        status => bail!("backup {} finished with status {}", backup_id, status),
    }
}
