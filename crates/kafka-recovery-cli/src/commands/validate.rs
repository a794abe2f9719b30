use anyhow::{bail, Result};
use kafka_recovery_core::{validate_backup, FilesystemBackend, ValidationReport};
use std::path::PathBuf;
use tracing::info;

fn print_report(report: &ValidationReport) {
    println!("\n=== Validation Report ===\n");
    println!("Backup ID:          {}", report.backup_id);
    println!("Backup Status:      {}", report.status);
    println!(
        "Mode:               {}",
        if report.deep { "deep" } else { "shallow" }
    );
    println!("Segments Checked:   {}", report.segments_checked);
    println!("Segments Valid:     {}", report.segments_valid);
    println!("Records Recorded:   {}", report.total_messages);
    if !report.missing_partitions.is_empty() {
        println!("Missing Partitions: {:?}", report.missing_partitions);
    }

    if !report.issues.is_empty() {
        println!("\nIssues Found:");
        for issue in &report.issues {
            match issue.partition {
                Some(p) => println!("  - partition {}: {}", p, issue.detail),
                None => println!("  - manifest: {}", issue.detail),
            }
        }
    }

    println!();
    if report.is_valid() {
        println!("Result: VALID");
    } else {
        println!("Result: INVALID");
    }
}

pub async fn run(path: &str, backup_id: &str, deep: bool) -> Result<()> {
    info!("Validating backup: {} (deep={})", backup_id, deep);

    let storage = FilesystemBackend::new(PathBuf::from(path));
    let report = validate_backup(&storage, backup_id, deep).await?;

    print_report(&report);

    if !report.is_valid() {
        bail!("backup {} failed validation", backup_id);
    }

    Ok(())
}
