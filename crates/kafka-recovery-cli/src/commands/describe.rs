use anyhow::Result;
use kafka_recovery_core::{load_manifest, BackupManifest, FilesystemBackend};
use tracing::info;

use super::{format_bytes, format_duration_ms, format_timestamp};

/// Describe command output format
pub enum OutputFormat {
    Text,
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "yaml" => Self::Yaml,
            _ => Self::Text,
        }
    }
}

pub async fn run(path: &str, backup_id: &str, format: &str) -> Result<()> {
    let storage = FilesystemBackend::new(path.into());
    let output_format = OutputFormat::from_str(format);

    info!("Loading backup manifest: {}", backup_id);
    let manifest = load_manifest(&storage, backup_id).await?;

    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml::to_string(&manifest)?);
        }
        OutputFormat::Text => {
            print_manifest_text(&manifest);
        }
    }

    Ok(())
}

fn print_manifest_text(manifest: &BackupManifest) {
    println!("╔══════════════════════════════════════════════════════════════════════╗");
    println!("║                         BACKUP MANIFEST                              ║");
    println!("╠══════════════════════════════════════════════════════════════════════╣");
    println!("║ Backup ID:      {:55} ║", manifest.backup_id);
    println!("║ Created:        {:55} ║", format_timestamp(manifest.created_at));
    if let Some(completed) = manifest.completed_at {
        println!(
            "║ Duration:       {:55} ║",
            format_duration_ms(completed - manifest.created_at)
        );
    }
    println!("║ Source Cluster: {:55} ║", manifest.source_cluster);
    println!("║ Topic:          {:55} ║", manifest.topic);
    println!("║ Compression:    {:55} ║", manifest.compression.to_string());
    println!("║ Status:         {:55} ║", manifest.status.to_string());
    println!("╠══════════════════════════════════════════════════════════════════════╣");
    println!("║                              SUMMARY                                 ║");
    println!("╠══════════════════════════════════════════════════════════════════════╣");
    println!(
        "║ Partitions:     {:55} ║",
        format!("{}/{}", manifest.segments.len(), manifest.partition_count)
    );
    println!("║ Total Records:  {:55} ║", manifest.total_messages);
    println!(
        "║ Compressed Size: {:54} ║",
        format_bytes(manifest.stored_bytes())
    );
    println!(
        "║ Uncompressed Size: {:52} ║",
        format_bytes(manifest.total_bytes)
    );
    if manifest.total_bytes > 0 {
        let ratio = (manifest.stored_bytes() as f64 / manifest.total_bytes as f64) * 100.0;
        println!("║ Compression Ratio: {:51.1}% ║", ratio);
    }
    println!(
        "║ Checksum:       {:55} ║",
        format!("{:08x}", manifest.manifest_checksum)
    );

    println!("╠══════════════════════════════════════════════════════════════════════╣");
    println!("║                             PARTITIONS                               ║");
    println!("╠══════════════════════════════════════════════════════════════════════╣");

    for segment in &manifest.segments {
        let line = format!(
            "P{}: {} records, offsets {}-{}{}",
            segment.partition_id,
            segment.message_count,
            segment.start_offset,
            segment.end_offset,
            if segment.is_complete() { "" } else { " (incomplete)" }
        );
        println!("║   {:67} ║", line);
    }

    if !manifest.failed_partitions.is_empty() {
        println!("╠══════════════════════════════════════════════════════════════════════╣");
        println!("║                          FAILED PARTITIONS                           ║");
        println!("╠══════════════════════════════════════════════════════════════════════╣");
        for failure in &manifest.failed_partitions {
            let line = format!(
                "P{}: {:?} after {} attempts",
                failure.partition, failure.kind, failure.attempts
            );
            println!("║   {:67} ║", line);
        }
    }

    println!("╚══════════════════════════════════════════════════════════════════════╝");
}
