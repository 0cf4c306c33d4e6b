//! Retry engine with exponential backoff and jitter
//!
//! Wraps any fallible async operation. Only `Transient` failures are retried;
//! everything else returns on the first attempt. A retry budget that runs out,
//! by attempt count or by deadline, ends the call with `Unavailable`.
//!
//! Delay before retry `n` (0-based):
//!
//! ```text
//! delay = min(base * 2^n, max)
//! sleep = delay + uniform(0, delay * jitter_ratio)
//! ```
//!
//! Jitter is only ever added, so the total wait is never below the plain
//! exponential schedule.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use stowage_core::{Result, StorageError, StoreConfig};
use tokio::time::{self, Instant};

/// Backoff and attempt limits for one client
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for a single attempt
    pub request_timeout: Duration,
    /// Extra random delay as a fraction of the backoff (0.0 - 1.0)
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            request_timeout: config.request_timeout(),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Policy that makes a single attempt
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry `retry` (0-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
        delay + delay.mul_f64(extra)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget is spent.
    ///
    /// Each attempt is bounded by `min(request_timeout, deadline - now)`; an
    /// attempt that runs out of time counts as a transient failure.
    pub async fn run<T, F, Fut>(&self, operation: &str, deadline: Instant, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = RetryState::new();

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(state.deadline_exceeded(operation));
            }
            let budget = self.request_timeout.min(deadline - now);

            state.attempts += 1;
            let err = match time::timeout(budget, op()).await {
                Ok(Ok(value)) => {
                    if state.attempts > 1 {
                        tracing::debug!(
                            operation,
                            attempts = state.attempts,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => StorageError::transient(format!("attempt timed out after {:?}", budget)),
            };

            if !err.is_transient() {
                return Err(err);
            }
            if state.attempts > self.max_retries {
                tracing::error!(
                    operation,
                    attempts = state.attempts,
                    error = %err,
                    "retries exhausted"
                );
                return Err(StorageError::Unavailable(format!(
                    "{}: gave up after {} attempts: {}",
                    operation,
                    state.attempts,
                    err.message()
                )));
            }

            let mut delay = self.jittered(state.attempts - 1);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint);
            }
            // An absurd hint overflows the clock; that crosses any deadline too.
            match Instant::now().checked_add(delay) {
                Some(wake) if wake < deadline => {}
                _ => return Err(state.deadline_exceeded(operation)),
            }

            tracing::warn!(
                operation,
                attempt = state.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, backing off"
            );
            time::sleep(delay).await;
            state.backoff += delay;
        }
    }
}

/// Bookkeeping for one call
#[derive(Debug)]
pub struct RetryState {
    pub attempts: u32,
    /// Total time spent sleeping between attempts
    pub backoff: Duration,
    pub started: Instant,
}

impl RetryState {
    fn new() -> Self {
        Self {
            attempts: 0,
            backoff: Duration::ZERO,
            started: Instant::now(),
        }
    }

    fn deadline_exceeded(&self, operation: &str) -> StorageError {
        StorageError::Unavailable(format!(
            "{}: deadline exceeded after {} attempts in {:?}",
            operation,
            self.attempts,
            self.started.elapsed()
        ))
    }
}
