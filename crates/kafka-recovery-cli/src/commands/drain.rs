use std::time::Duration;

use anyhow::{bail, Result};
use kafka_recovery_core::{DrainOptions, DrainStatus, RecoveryService};
use tracing::{info, warn};

/// Command-line values that take precedence over the `drain` config section
#[derive(Debug, Default)]
pub struct DrainOverrides {
    pub timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub max_lag: Option<u64>,
    pub debounce: Option<u32>,
}

impl DrainOverrides {
    fn apply(&self, mut options: DrainOptions) -> DrainOptions {
        if let Some(secs) = self.timeout_secs {
            options.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.poll_interval_ms {
            options.poll_interval = Duration::from_millis(ms);
        }
        if let Some(max_lag) = self.max_lag {
            options.max_lag = max_lag;
        }
        if let Some(debounce) = self.debounce {
            options.debounce = debounce;
        }
        options
    }
}

pub async fn run(
    config_path: &str,
    cluster: &str,
    group: &str,
    topic: &str,
    overrides: DrainOverrides,
) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let options = overrides.apply(DrainOptions::from_config(&config.drain));

    let service = RecoveryService::new(config)?;

    info!(
        "Watching group {} on {}/{} (timeout {:?}, poll {:?}, max lag {}, debounce {})",
        group, cluster, topic, options.timeout, options.poll_interval, options.max_lag,
        options.debounce
    );
    let monitor_id = service.start_drain_monitor(cluster, group, topic, Some(options))?;

    let state = tokio::select! {
        state = service.wait_drain(&monitor_id) => state?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping drain monitor");
            match service.stop_drain_monitor(&monitor_id)? {
                Some(state) => state,
                None => bail!("drain monitor {} ended before it could be stopped", monitor_id),
            }
        }
    };

    println!("Group:       {}", state.group_id);
    println!("Topic:       {}", state.topic);
    println!("Status:      {}", state.status);
    println!("Polls:       {}", state.polls);
    if let Some(start) = state.total_lag_start {
        println!("Lag:         {} -> {}", start, state.total_lag());
    }
    for (partition, lag) in &state.per_partition_lag {
        println!("  partition {:>5}: {}", partition, lag);
    }
    if let Some(error) = &state.error {
        println!("Error:       {}", error);
    }

    match state.status {
        DrainStatus::Drained => Ok(()),
        status => bail!("group {} did not drain: {}", group, status),
    }
}
