//! Retry policy shared by every asynchronous tier write

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};

/// Growth of the delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// `base * n` after the n-th failure
    Linear,
    /// `base * 2^(n-1)` after the n-th failure
    Exponential,
}

/// Bounded retry with backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay unit
    pub base_delay: Duration,
    /// Delay growth
    pub backoff: Backoff,
    /// Cap on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff: Backoff::Linear,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Final failure of a retried operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    /// Attempts made
    pub attempts: u32,
    /// Error from the last attempt
    pub last_error: Error,
}

impl RetryPolicy {
    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry max_attempts must be at least 1".into()));
        }
        if self.max_delay < self.base_delay {
            return Err(Error::Config("retry max_delay must be >= base_delay".into()));
        }
        Ok(())
    }

    /// Delay to wait after the `failed_attempt`-th failure (1-based)
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let n = failed_attempt.max(1);
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(n),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> std::result::Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => {
                    return Err(RetryFailure {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:?}",
                        label, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(20), Duration::from_secs(10));
    }

    #[test]
    fn test_exponential_delays_capped() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(10), Duration::from_secs(1));
        assert_eq!(policy.delay_after(40), Duration::from_secs(1));
    }

    #[test]
    fn test_validate() {
        let zero = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
        assert!(RetryPolicy::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run("test", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::DurableUnreachable("blip".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget() {
        let start = tokio::time::Instant::now();
        let result: std::result::Result<(), _> = RetryPolicy::default()
            .run("test", |_| async { Err(Error::DurableUnreachable("down".into())) })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.last_error, Error::DurableUnreachable("down".into()));
        // 1s + 2s of linear backoff between the three attempts
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: std::result::Result<(), _> = RetryPolicy::default()
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Internal("bug".into())) }
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
