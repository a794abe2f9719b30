use anyhow::Result;
use kafka_recovery_core::{list_backups, load_manifest, FilesystemBackend};
use tracing::{info, warn};

use super::{format_bytes, format_timestamp};

pub async fn run(path: &str, backup_id: Option<&str>) -> Result<()> {
    let storage = FilesystemBackend::new(path.into());

    match backup_id {
        Some(id) => {
            info!("Loading backup manifest: {}", id);
            let manifest = load_manifest(&storage, id).await?;

            println!("Backup ID: {}", manifest.backup_id);
            println!("Created: {}", format_timestamp(manifest.created_at));
            println!("Source Cluster: {}", manifest.source_cluster);
            println!("Topic: {}", manifest.topic);
            println!("Status: {}", manifest.status);
            println!(
                "Partitions: {}/{} ({} records, {})",
                manifest.segments.len(),
                manifest.partition_count,
                manifest.total_messages,
                format_bytes(manifest.total_bytes)
            );
        }
        None => {
            info!("Listing backups in: {}", path);
            let backup_ids = list_backups(&storage).await?;

            if backup_ids.is_empty() {
                println!("No backups found in {}", path);
                return Ok(());
            }

            println!("Available backups:");
            for id in backup_ids {
                match load_manifest(&storage, &id).await {
                    Ok(m) => println!(
                        "  - {} [{}] {} records, created {}",
                        id,
                        m.status,
                        m.total_messages,
                        format_timestamp(m.created_at)
                    ),
                    Err(e) => {
                        warn!("Unreadable manifest for {}: {}", id, e);
                        println!("  - {} [unreadable]", id);
                    }
                }
            }
        }
    }

    Ok(())
}
