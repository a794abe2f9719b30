//! Consumer group drain monitor.
//!
//! Polls a group's lag on a topic until every partition stays at or below
//! `max_lag` for `debounce` consecutive polls, the timeout passes, or the
//! lag lookup fails for good. State is published on a watch channel.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::broker::BrokerClient;
use crate::config::DrainConfig;
use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Drain monitor lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainStatus {
    Draining,
    Drained,
    TimedOut,
    Error,
}

impl DrainStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DrainStatus::Draining)
    }
}

impl std::fmt::Display for DrainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DrainStatus::Draining => "Draining",
            DrainStatus::Drained => "Drained",
            DrainStatus::TimedOut => "TimedOut",
            DrainStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Latest observation of a group's lag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainState {
    pub group_id: String,
    pub topic: String,
    pub per_partition_lag: BTreeMap<u32, u64>,
    /// Lag at the first successful poll
    pub lag_start: BTreeMap<u32, u64>,
    pub total_lag_start: Option<u64>,
    pub total_lag_end: Option<u64>,
    /// Epoch millis of the last poll
    pub checked_at: Option<i64>,
    pub status: DrainStatus,
    pub consecutive_drained_polls: u32,
    pub polls: u32,
    pub error: Option<String>,
    pub started_at: i64,
}

impl DrainState {
    fn new(group_id: &str, topic: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            per_partition_lag: BTreeMap::new(),
            lag_start: BTreeMap::new(),
            total_lag_start: None,
            total_lag_end: None,
            checked_at: None,
            status: DrainStatus::Draining,
            consecutive_drained_polls: 0,
            polls: 0,
            error: None,
            started_at: Utc::now().timestamp_millis(),
        }
    }

    pub fn total_lag(&self) -> u64 {
        self.per_partition_lag.values().sum()
    }
}

/// Thresholds for one monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Lag per partition that still counts as drained
    pub max_lag: u64,
    /// Consecutive drained polls required
    pub debounce: u32,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(5000),
            max_lag: 0,
            debounce: 3,
        }
    }
}

impl DrainOptions {
    pub fn from_config(config: &DrainConfig) -> Self {
        Self {
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            max_lag: config.max_lag.max(0) as u64,
            debounce: config.debounce_count,
        }
    }
}

/// The drain state machine, free of any timer or broker
#[derive(Debug, Clone)]
pub struct DrainTracker {
    state: DrainState,
    options: DrainOptions,
}

impl DrainTracker {
    pub fn new(group_id: &str, topic: &str, options: DrainOptions) -> Self {
        Self {
            state: DrainState::new(group_id, topic),
            options,
        }
    }

    pub fn state(&self) -> &DrainState {
        &self.state
    }

    /// Feed one poll result taken `elapsed` after the monitor started.
    ///
    /// A terminal state is never left again.
    pub fn observe(&mut self, lags: BTreeMap<u32, u64>, elapsed: Duration) -> DrainStatus {
        if self.state.status.is_terminal() {
            return self.state.status;
        }

        let total: u64 = lags.values().sum();
        let drained = lags.values().all(|lag| *lag <= self.options.max_lag);

        let state = &mut self.state;
        state.polls += 1;
        state.checked_at = Some(Utc::now().timestamp_millis());
        if state.total_lag_start.is_none() {
            state.lag_start = lags.clone();
            state.total_lag_start = Some(total);
        }
        state.total_lag_end = Some(total);
        state.per_partition_lag = lags;

        if drained {
            state.consecutive_drained_polls += 1;
        } else {
            state.consecutive_drained_polls = 0;
        }

        if state.consecutive_drained_polls >= self.options.debounce.max(1) {
            state.status = DrainStatus::Drained;
        } else if !drained && elapsed > self.options.timeout {
            state.status = DrainStatus::TimedOut;
        }
        state.status
    }

    /// Lag could not be read; terminal
    pub fn fail(&mut self, error: &Error) {
        if self.state.status.is_terminal() {
            return;
        }
        self.state.status = DrainStatus::Error;
        self.state.error = Some(error.to_string());
        self.state.checked_at = Some(Utc::now().timestamp_millis());
    }
}

/// Lag of `group` on every partition of `topic`.
///
/// A partition with no commit lags by its whole high watermark.
pub async fn consumer_lag(
    client: &dyn BrokerClient,
    group: &str,
    topic: &str,
) -> Result<BTreeMap<u32, u64>> {
    let committed = client.committed_offsets(group, topic).await?;
    let info = client.topic_metadata(topic).await?;

    let mut lags = BTreeMap::new();
    for partition in info.partitions {
        let high = client.watermarks(topic, partition).await?.high;
        let lag = match committed.get(&partition).copied().flatten() {
            Some(offset) => high.saturating_sub(offset),
            None => high,
        };
        lags.insert(partition, lag);
    }
    Ok(lags)
}

/// A running drain monitor
pub struct DrainMonitor {
    monitor_id: String,
    state: watch::Receiver<DrainState>,
    cancel: CancellationToken,
    stopped: AtomicBool,
}

impl DrainMonitor {
    /// Start polling in the background
    pub fn start(
        client: Arc<dyn BrokerClient>,
        group_id: &str,
        topic: &str,
        options: DrainOptions,
        retry: RetryPolicy,
    ) -> Self {
        let monitor_id = format!("drain-{}", Ulid::new());
        let tracker = DrainTracker::new(group_id, topic, options);
        let (tx, rx) = watch::channel(tracker.state().clone());
        let cancel = CancellationToken::new();

        info!(
            monitor_id = %monitor_id,
            group_id,
            topic,
            timeout_secs = options.timeout.as_secs(),
            poll_interval_ms = options.poll_interval.as_millis() as u64,
            max_lag = options.max_lag,
            debounce = options.debounce,
            "Starting drain monitor"
        );

        tokio::spawn(poll_loop(
            monitor_id.clone(),
            client,
            tracker,
            options,
            retry,
            tx,
            cancel.clone(),
        ));

        Self {
            monitor_id,
            state: rx,
            cancel,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    /// Latest published state
    pub fn state(&self) -> DrainState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DrainState> {
        self.state.clone()
    }

    /// Stop polling. Returns `false` if the monitor was already stopped.
    ///
    /// The last published state is kept as is.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        debug!(monitor_id = %self.monitor_id, "Drain monitor stopped");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait for a terminal state, or for the monitor to be stopped
    pub async fn wait(&self) -> DrainState {
        let mut rx = self.state.clone();
        tokio::select! {
            result = rx.wait_for(|s| s.status.is_terminal()) => {
                if let Ok(state) = result {
                    return state.clone();
                }
            }
            _ = self.cancel.cancelled() => {}
        }
        let state = rx.borrow().clone();
        state
    }
}

impl Drop for DrainMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(
    monitor_id: String,
    client: Arc<dyn BrokerClient>,
    mut tracker: DrainTracker,
    options: DrainOptions,
    retry: RetryPolicy,
    tx: watch::Sender<DrainState>,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let group = tracker.state().group_id.clone();
    let topic = tracker.state().topic.clone();
    let mut ticker = tokio::time::interval(options.poll_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let lags = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            lags = retry.execute("consumer lag", &cancel, None, |_| {
                consumer_lag(client.as_ref(), &group, &topic)
            }) => lags,
        };
        if cancel.is_cancelled() {
            break;
        }

        match lags {
            Ok(lags) => {
                let status = tracker.observe(lags, started.elapsed());
                debug!(
                    monitor_id = %monitor_id,
                    status = %status,
                    total_lag = tracker.state().total_lag(),
                    consecutive = tracker.state().consecutive_drained_polls,
                    "Drain poll"
                );
            }
            Err(e) => {
                warn!(monitor_id = %monitor_id, group_id = %group, error = %e, "Lag lookup failed");
                tracker.fail(&e);
            }
        }

        let state = tracker.state().clone();
        let status = state.status;
        tx.send_replace(state);

        if status.is_terminal() {
            info!(
                monitor_id = %monitor_id,
                group_id = %group,
                topic = %topic,
                status = %status,
                polls = tracker.state().polls,
                total_lag_start = ?tracker.state().total_lag_start,
                total_lag_end = ?tracker.state().total_lag_end,
                "Drain monitor finished"
            );
            break;
        }
    }
}
