use anyhow::{bail, Context, Result};
use kafka_recovery_core::{PartitionReplayReport, RecoveryService};
use tracing::info;

use super::{ensure_completed, format_duration_ms, wait_with_progress};

pub async fn run(config_path: &str) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let request = config
        .restore
        .clone()
        .context("configuration has no `restore` section")?;

    let service = RecoveryService::new(config)?;

    info!(
        "Starting restore from backup: {} into {} on {}",
        request.backup_id, request.target_topic, request.target_cluster
    );
    let restore_id = service.start_restore(request)?;

    let status = wait_with_progress(&service, &restore_id).await?;
    ensure_completed(&status)?;

    let report = service
        .restore_result(&restore_id)
        .context("restore finished without a report")?;

    println!("Restore ID:  {}", report.restore_id);
    println!("Backup ID:   {}", report.backup_id);
    println!("Target:      {} ({})", report.target_topic, report.target_cluster);
    println!("Status:      {}", report.status);
    println!(
        "Messages:    {} restored, {} failed, {} skipped",
        report.messages_restored, report.messages_failed, report.messages_skipped
    );
    println!(
        "Duration:    {}",
        format_duration_ms(report.end_time - report.start_time)
    );
    print_partitions(&report.partitions);
    if !report.missing_partitions.is_empty() {
        println!(
            "  partitions missing from the backup: {:?}",
            report.missing_partitions
        );
    }

    if report.is_success() {
        info!("Restore completed successfully");
        Ok(())
    } else {
        bail!("restore {} finished with status {}", restore_id, report.status)
    }
}

/// Per-partition table shared with the migrate command
pub fn print_partitions(partitions: &[PartitionReplayReport]) {
    if partitions.is_empty() {
        return;
    }
    println!();
    println!(
        "  {:>9}  {:>12}  {:>8}  {:>8}",
        "Partition", "Restored", "Failed", "Skipped"
    );
    for p in partitions {
        println!(
            "  {:>9}  {:>12}  {:>8}  {:>8}",
            p.partition, p.messages_restored, p.messages_failed, p.messages_skipped
        );
        if let Some(error) = &p.last_error {
            println!("             last error: {}", error);
        }
    }
}
