//! Reusable retry policy with exponential backoff.
//!
//! A [`RetryPolicy`] wraps any fallible async operation. Only errors whose
//! [`Error::is_transient`] is true are retried; everything else returns
//! immediately as [`RetryOutcome::NonRetryable`]. Backoff sleeps observe a
//! [`CancellationToken`] so deadlines and shutdown interrupt them.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::metrics::OperationMetrics;
use crate::{Error, Result};

/// Retry parameters
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

/// Progress of one retried operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_backoff_ms: u64,
}

/// Result of running an operation under a [`RetryPolicy`]
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success(T),
    /// Every attempt failed with a transient error, or backoff was cancelled
    ExhaustedRetries { attempts: u32, last_error: Error },
    /// The operation failed with an error retrying cannot fix
    NonRetryable(Error),
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success(_))
    }

    /// Collapse into a `Result`, wrapping exhaustion in [`Error::RetriesExhausted`].
    pub fn into_result(self, operation: &str) -> Result<T> {
        match self {
            RetryOutcome::Success(value) => Ok(value),
            RetryOutcome::ExhaustedRetries {
                attempts,
                last_error,
            } => Err(Error::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                last_error: Box::new(last_error),
            }),
            RetryOutcome::NonRetryable(e) => Err(e),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Delay before attempt `failed_attempts + 1`
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        metrics: Option<&OperationMetrics>,
        mut op: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::default();

        loop {
            state.attempt_count += 1;
            let error = match op(state.attempt_count).await {
                Ok(value) => {
                    if state.attempt_count > 1 {
                        debug!(
                            operation,
                            attempts = state.attempt_count,
                            "Operation succeeded after retry"
                        );
                    }
                    return RetryOutcome::Success(value);
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                debug!(operation, error = %error, "Non-retryable failure");
                return RetryOutcome::NonRetryable(error);
            }

            if state.attempt_count >= self.max_attempts {
                warn!(
                    operation,
                    attempts = state.attempt_count,
                    error = %error,
                    "Retries exhausted"
                );
                return RetryOutcome::ExhaustedRetries {
                    attempts: state.attempt_count,
                    last_error: error,
                };
            }

            let delay = self.backoff(state.attempt_count);
            state.last_error = Some(error.to_string());
            state.next_backoff_ms = delay.as_millis() as u64;
            warn!(
                operation,
                attempt = state.attempt_count,
                max_attempts = self.max_attempts,
                backoff_ms = state.next_backoff_ms,
                error = %error,
                "Transient failure, retrying"
            );
            if let Some(metrics) = metrics {
                metrics.record_retry();
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(operation, attempts = state.attempt_count, "Retry cancelled during backoff");
                    return RetryOutcome::ExhaustedRetries {
                        attempts: state.attempt_count,
                        last_error: error,
                    };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// [`run`](Self::run) collapsed into a `Result`
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        metrics: Option<&OperationMetrics>,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, cancel, metrics, op)
            .await
            .into_result(operation)
    }
}
