use anyhow::{bail, Context, Result};
use kafka_recovery_core::RecoveryService;
use tracing::{info, warn};

use super::restore::print_partitions;
use super::{ensure_completed, format_duration_ms, wait_with_progress};

pub async fn run(config_path: &str) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let request = config
        .migrate
        .clone()
        .context("configuration has no `migrate` section")?;

    let service = RecoveryService::new(config)?;

    info!(
        "Starting {} migration {}/{} -> {}/{}",
        request.mode,
        request.source_cluster,
        request.source_topic,
        request.target_cluster,
        request.target_topic
    );
    let migration_id = service.start_migration(request)?;

    let status = wait_with_progress(&service, &migration_id).await?;
    ensure_completed(&status)?;

    let report = service
        .migration_result(&migration_id)
        .context("migration finished without a report")?;

    println!("Migration ID: {}", report.migration_id);
    println!("Mode:         {}", report.mode);
    println!(
        "Source:       {} ({})",
        report.source_topic, report.source_cluster
    );
    println!(
        "Target:       {} ({})",
        report.target_topic, report.target_cluster
    );
    println!("Status:       {}", report.status);
    println!(
        "Messages:     {} migrated, {} failed, {} skipped",
        report.messages_migrated, report.messages_failed, report.messages_skipped
    );
    println!(
        "Duration:     {}",
        format_duration_ms(report.end_time - report.start_time)
    );
    print_partitions(&report.partitions);
    if !report.missing_partitions.is_empty() {
        println!("  partitions not migrated: {:?}", report.missing_partitions);
    }
    if let Some(staged) = &report.staged_backup_id {
        warn!("Staged backup {} was kept for inspection", staged);
    }

    if report.is_success() {
        info!("Migration completed successfully");
        Ok(())
    } else {
        bail!(
            "migration {} finished with status {}",
            migration_id,
            report.status
        )
    }
}
