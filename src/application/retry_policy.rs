//! 재시도 정책 - 지수 백오프 + 지터
//!
//! Retryable errors are retried up to `max_retries` times with
//! `base × 2^(attempt−1) ± jitter`, capped at `max_delay`.
//! Terminal errors propagate after the first attempt.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::domain::errors::{BatchError, Result};
use crate::infrastructure::config::RetryConfig;

/// What happened across all attempts of one operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts actually made (1 ..= 1 + max_retries)
    pub attempts: u32,
    /// Total wall time spent inside failed attempts (backoff sleeps excluded)
    pub failed_elapsed: Duration,
    /// Duration of the successful attempt, if any
    pub success_elapsed: Option<Duration>,
}

impl<T> RetryOutcome<T> {
    pub const fn failed_attempts(&self) -> u32 {
        if self.result.is_ok() {
            self.attempts.saturating_sub(1)
        } else {
            self.attempts
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub const fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 2u64.saturating_pow(exponent);
        let millis = self.config.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(millis.min(self.config.max_delay_ms))
    }

    /// Jittered delay before retry number `attempt`; `unit` is a sample from [0, 1)
    pub fn backoff_with_unit(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_backoff(attempt).as_secs_f64();
        // unit 0..1 maps onto factor (1 - j)..(1 + j)
        let factor = 1.0 + self.config.jitter_ratio * (2.0f64.mul_add(unit, -1.0));
        let jittered = (base * factor).max(0.0);
        Duration::from_secs_f64(jittered).min(self.config.max_delay())
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with_unit(attempt, fastrand::f64())
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The closure receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts();
        let mut failed_elapsed = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let started = Instant::now();
            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("✅ {} succeeded on attempt {}/{}", label, attempt, max_attempts);
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        failed_elapsed,
                        success_elapsed: Some(started.elapsed()),
                    };
                }
                Err(error) => error,
            };
            failed_elapsed += started.elapsed();

            let class = error.classify();
            if !class.is_retryable() {
                debug!("{} failed terminally ({:?}): {}", label, class, error);
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    failed_elapsed,
                    success_elapsed: None,
                };
            }

            if attempt >= max_attempts {
                warn!("❌ {} exhausted {} attempts: {}", label, attempt, error);
                return RetryOutcome {
                    result: Err(BatchError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(error),
                    }),
                    attempts: attempt,
                    failed_elapsed,
                    success_elapsed: None,
                };
            }

            let delay = self.backoff(attempt);
            warn!(
                "🔄 {} attempt {}/{} failed ({:?}), retrying in {:?}: {}",
                label, attempt, max_attempts, class, delay, error
            );
            tokio::time::sleep(delay).await;
        }
    }
}
