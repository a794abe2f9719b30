use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "kafka-recovery")]
#[command(about = "Kafka backup, restore and migration tool", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a topic into the storage root
    Backup {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,
    },

    /// Restore a backup into a target topic
    Restore {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,
    },

    /// Copy a topic from one cluster to another
    Migrate {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,
    },

    /// Wait for a consumer group to catch up on a topic
    Drain {
        /// Path to the configuration file
        #[arg(short, long)]
        config: String,

        /// Cluster name from the configuration
        #[arg(long)]
        cluster: String,

        /// Consumer group to watch
        #[arg(short, long)]
        group: String,

        /// Topic the group consumes
        #[arg(short, long)]
        topic: String,

        /// Give up after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Milliseconds between lag checks
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Largest per-partition lag still considered drained
        #[arg(long)]
        max_lag: Option<u64>,

        /// Consecutive drained polls required
        #[arg(long)]
        debounce: Option<u32>,
    },

    /// List available backups
    List {
        /// Path to the storage location
        #[arg(short, long)]
        path: String,

        /// Specific backup ID to show details for
        #[arg(short, long)]
        backup_id: Option<String>,
    },

    /// Validate backup integrity
    Validate {
        /// Path to the storage location
        #[arg(short, long)]
        path: String,

        /// Backup ID to validate
        #[arg(short, long)]
        backup_id: String,

        /// Decode every segment and verify its checksums
        #[arg(long)]
        deep: bool,
    },

    /// Show detailed backup manifest
    Describe {
        /// Path to the storage location
        #[arg(short, long)]
        path: String,

        /// Backup ID to describe
        #[arg(short, long)]
        backup_id: String,

        /// Output format: text, json, yaml
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(level)
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Backup { config } => {
            commands::backup::run(&config).await?;
        }
        Commands::Restore { config } => {
            commands::restore::run(&config).await?;
        }
        Commands::Migrate { config } => {
            commands::migrate::run(&config).await?;
        }
        Commands::Drain {
            config,
            cluster,
            group,
            topic,
            timeout_secs,
            poll_interval_ms,
            max_lag,
            debounce,
        } => {
            let overrides = commands::drain::DrainOverrides {
                timeout_secs,
                poll_interval_ms,
                max_lag,
                debounce,
            };
            commands::drain::run(&config, &cluster, &group, &topic, overrides).await?;
        }
        Commands::List { path, backup_id } => {
            commands::list::run(&path, backup_id.as_deref()).await?;
        }
        Commands::Validate {
            path,
            backup_id,
            deep,
        } => {
            commands::validate::run(&path, &backup_id, deep).await?;
        }
        Commands::Describe {
            path,
            backup_id,
            format,
        } => {
            commands::describe::run(&path, &backup_id, &format).await?;
        }
    }

    Ok(())
}
