//! Bounded partition worker pool.
//!
//! Runs one task per partition with at most `concurrency` in flight and
//! collects every result, so a failing partition never hides its siblings.

use futures::FutureExt;
use std::collections::BTreeSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{Error, Result};

/// Partition workers for one operation
#[derive(Debug, Clone)]
pub struct PartitionPool {
    concurrency: usize,
}

impl PartitionPool {
    /// Pool running at most `concurrency` workers, never more than `partitions`
    pub fn new(concurrency: usize, partitions: usize) -> Self {
        Self {
            concurrency: concurrency.min(partitions).max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `work` for every partition and return `(partition, result)` sorted by partition.
    ///
    /// A worker that panics is reported as [`Error::Worker`] for its partition.
    pub async fn run<T, F, Fut>(&self, partitions: &[u32], work: F) -> Vec<(u32, Result<T>)>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut results = Vec::with_capacity(partitions.len());

        for &partition in partitions {
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    results.push((partition, Err(Error::Worker(e.to_string()))));
                    continue;
                }
            };

            let fut = work(partition);
            tasks.spawn(async move {
                let result = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Worker(format!(
                        "worker for partition {} panicked",
                        partition
                    ))),
                };
                drop(permit);
                (partition, result)
            });
        }

        debug!(
            tasks = partitions.len(),
            concurrency = self.concurrency,
            "Spawned partition workers"
        );

        let mut pending: BTreeSet<u32> = partitions.iter().copied().collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((partition, result)) => {
                    pending.remove(&partition);
                    results.push((partition, result));
                }
                Err(e) => error!("Task join error: {}", e),
            }
        }

        // Tasks lost to cancellation never reported back.
        for partition in pending {
            if !results.iter().any(|(p, _)| *p == partition) {
                results.push((
                    partition,
                    Err(Error::Worker(format!(
                        "worker for partition {} did not complete",
                        partition
                    ))),
                ));
            }
        }

        results.sort_by_key(|(partition, _)| *partition);
        results
    }
}

/// Cancel `stop` once `deadline` passes; the flag is set only if the deadline fired.
///
/// The timer ends early when `stop` is cancelled by anything else.
pub fn spawn_deadline(
    operation: &'static str,
    deadline: Option<Duration>,
    stop: CancellationToken,
) -> Arc<AtomicBool> {
    let fired = Arc::new(AtomicBool::new(false));
    let Some(deadline) = deadline else {
        return fired;
    };
    if deadline.is_zero() {
        warn!(operation, "No time left, stopping workers before they start");
        fired.store(true, Ordering::SeqCst);
        stop.cancel();
        return fired;
    }

    let flag = Arc::clone(&fired);
    tokio::spawn(async move {
        tokio::select! {
            _ = stop.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                warn!(operation, deadline_secs = deadline.as_secs(), "Deadline reached, stopping workers");
                flag.store(true, Ordering::SeqCst);
                stop.cancel();
            }
        }
    });
    fired
}
