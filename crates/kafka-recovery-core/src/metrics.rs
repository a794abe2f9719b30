//! Per-operation progress counters.
//!
//! Every backup, restore and migration owns one [`OperationMetrics`]. Workers
//! bump the counters as they go; the operations service reads a
//! [`ProgressReport`] snapshot to answer status queries.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MAX_LATENCY_SAMPLES: usize = 1000;

/// Progress counters for one operation
pub struct OperationMetrics {
    /// Records written to a segment or produced to a target
    pub records_processed: AtomicU64,
    /// Records that exhausted their retries
    pub records_failed: AtomicU64,
    /// Bytes written (compressed)
    pub bytes_written: AtomicU64,
    /// Bytes before compression
    pub bytes_uncompressed: AtomicU64,
    pub segments_written: AtomicU64,
    pub partitions_total: AtomicU64,
    pub partitions_completed: AtomicU64,
    pub partitions_failed: AtomicU64,
    /// Retried attempts across all broker calls
    pub retries: AtomicU64,
    segment_write_latencies_ns: Mutex<VecDeque<u64>>,
    broker_latencies_ns: Mutex<VecDeque<u64>>,
    start_time: Instant,
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationMetrics {
    pub fn new() -> Self {
        Self {
            records_processed: AtomicU64::new(0),
            records_failed: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_uncompressed: AtomicU64::new(0),
            segments_written: AtomicU64::new(0),
            partitions_total: AtomicU64::new(0),
            partitions_completed: AtomicU64::new(0),
            partitions_failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            segment_write_latencies_ns: Mutex::new(VecDeque::with_capacity(64)),
            broker_latencies_ns: Mutex::new(VecDeque::with_capacity(64)),
            start_time: Instant::now(),
        }
    }

    pub fn set_partitions_total(&self, total: u64) {
        self.partitions_total.store(total, Ordering::Relaxed);
    }

    pub fn record_records(&self, count: u64) {
        self.records_processed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed_records(&self, count: u64) {
        self.records_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, compressed: u64, uncompressed: u64) {
        self.bytes_written.fetch_add(compressed, Ordering::Relaxed);
        self.bytes_uncompressed
            .fetch_add(uncompressed, Ordering::Relaxed);
    }

    pub fn record_segment(&self, latency: Duration) {
        self.segments_written.fetch_add(1, Ordering::Relaxed);
        push_sample(&self.segment_write_latencies_ns, latency);
    }

    pub fn record_broker_latency(&self, latency: Duration) {
        push_sample(&self.broker_latencies_ns, latency);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partition_done(&self, success: bool) {
        if success {
            self.partitions_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.partitions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Snapshot of the counters
    pub fn report(&self) -> ProgressReport {
        let elapsed = self.elapsed().as_secs_f64();
        let records = self.records_processed.load(Ordering::Relaxed);
        let written = self.bytes_written.load(Ordering::Relaxed);
        let uncompressed = self.bytes_uncompressed.load(Ordering::Relaxed);

        ProgressReport {
            elapsed_secs: elapsed,
            records_processed: records,
            records_failed: self.records_failed.load(Ordering::Relaxed),
            bytes_written: written,
            bytes_uncompressed: uncompressed,
            segments_written: self.segments_written.load(Ordering::Relaxed),
            partitions_total: self.partitions_total.load(Ordering::Relaxed),
            partitions_completed: self.partitions_completed.load(Ordering::Relaxed),
            partitions_failed: self.partitions_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            records_per_second: if elapsed > 0.0 {
                records as f64 / elapsed
            } else {
                0.0
            },
            compression_ratio: if written > 0 {
                uncompressed as f64 / written as f64
            } else {
                1.0
            },
            segment_write_latency: LatencyStats::from_samples(
                &self.segment_write_latencies_ns.lock(),
            ),
            broker_latency: LatencyStats::from_samples(&self.broker_latencies_ns.lock()),
        }
    }
}

fn push_sample(samples: &Mutex<VecDeque<u64>>, latency: Duration) {
    let mut samples = samples.lock();
    if samples.len() == MAX_LATENCY_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(latency.as_nanos() as u64);
}

/// Latency statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl LatencyStats {
    /// Calculate stats from samples (in nanoseconds)
    fn from_samples(samples: &VecDeque<u64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        let ns_to_ms = |ns: u64| ns as f64 / 1_000_000.0;
        let pick = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        Self {
            count,
            avg_ms: ns_to_ms(sum / count as u64),
            p50_ms: ns_to_ms(pick(0.5)),
            p95_ms: ns_to_ms(pick(0.95)),
            p99_ms: ns_to_ms(pick(0.99)),
            max_ms: ns_to_ms(sorted[count - 1]),
        }
    }
}

/// Point-in-time progress of an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub elapsed_secs: f64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub bytes_written: u64,
    pub bytes_uncompressed: u64,
    pub segments_written: u64,
    pub partitions_total: u64,
    pub partitions_completed: u64,
    pub partitions_failed: u64,
    pub retries: u64,
    pub records_per_second: f64,
    pub compression_ratio: f64,
    pub segment_write_latency: LatencyStats,
    pub broker_latency: LatencyStats,
}

impl std::fmt::Display for ProgressReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Duration: {:.2}s", self.elapsed_secs)?;
        writeln!(
            f,
            "Partitions: {}/{} done, {} failed",
            self.partitions_completed, self.partitions_total, self.partitions_failed
        )?;
        writeln!(
            f,
            "Records: {} processed, {} failed ({:.0}/s)",
            self.records_processed, self.records_failed, self.records_per_second
        )?;
        if self.segments_written > 0 {
            writeln!(
                f,
                "Segments: {} ({} -> {} bytes, {:.2}x)",
                self.segments_written,
                self.bytes_uncompressed,
                self.bytes_written,
                self.compression_ratio
            )?;
        }
        writeln!(f, "Retries: {}", self.retries)?;
        write!(
            f,
            "Broker latency (ms): avg={:.2} p95={:.2} max={:.2}",
            self.broker_latency.avg_ms, self.broker_latency.p95_ms, self.broker_latency.max_ms
        )
    }
}
