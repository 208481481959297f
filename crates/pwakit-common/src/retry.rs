//! Backoff policy and timeout helpers.
//!
//! [`RetryConfig`] is used two ways: [`retry_with_backoff`] loops in place
//! (installing over a flaky network), while the sync queue only asks
//! [`RetryConfig::delay_for_attempt`] when to deliver a failed tag again.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::PwaKitError;

/// Exponential backoff policy. Attempts are 1-indexed.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first; `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each delay by up to a quarter so clients do not retry in lockstep.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether `attempt` used up the budget.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts.max(1)
    }

    /// Delay to wait before `attempt`. The first attempt never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(retries) = attempt.checked_sub(2) else {
            return Duration::ZERO;
        };

        let factor = self.backoff_multiplier.powi(retries.min(i32::MAX as u32) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        let delay = Duration::from_secs_f64(secs.max(0.0));

        if self.jitter {
            delay.mul_f64(1.0 + 0.25 * unit_random())
        } else {
            delay
        }
    }
}

/// Uniform-ish value in `[0, 1)` from the std hasher's random keys.
fn unit_random() -> f64 {
    let bits = RandomState::new().build_hasher().finish();
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

/// Retry `operation` until it succeeds or the attempts run out. The last
/// error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, |_| true, operation).await
}

/// Like [`retry_with_backoff`], but gives up at once on errors for which
/// `retryable` returns false.
pub async fn retry_with_backoff_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !retryable(&error) {
            warn!(attempt, error = %error, "Permanent failure, not retrying");
            return Err(error);
        }
        if config.is_exhausted(attempt) {
            warn!(attempt, error = %error, "Out of attempts");
            return Err(error);
        }

        attempt += 1;
        let delay = config.delay_for_attempt(attempt);
        warn!(attempt, ?delay, error = %error, "Attempt failed, backing off");
        sleep(delay).await;
    }
}

/// Await `operation` for at most `timeout`.
pub async fn with_timeout<T, Fut>(timeout: Duration, operation: Fut) -> Result<T, PwaKitError>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| PwaKitError::Timeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(initial_ms: u64, max_ms: u64) -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_none_allows_single_attempt() {
        let config = RetryConfig::none();
        assert!(config.is_exhausted(1));

        let zero = RetryConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(zero.is_exhausted(1));
    }

    #[test]
    fn test_exponential_schedule() {
        let config = fixed(100, 10_000);
        let delays: Vec<u128> = (1..=4).map(|a| config.delay_for_attempt(a).as_millis()).collect();
        assert_eq!(delays, vec![0, 100, 200, 400]);
    }

    #[test]
    fn test_delay_capped() {
        let config = fixed(10_000, 15_000);
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(15));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(15));
    }

    #[test]
    fn test_jitter_stays_within_a_quarter() {
        let config = RetryConfig {
            jitter: true,
            ..fixed(1000, 60_000)
        };
        for _ in 0..50 {
            let delay = config.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, String> = retry_with_backoff(&fixed(10, 100), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(format!("connection refused ({n})"))
                } else {
                    Ok("installed")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("installed"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry_with_backoff(&fixed(10, 100), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("failure {n}")) }
        })
        .await;

        assert_eq!(result, Err("failure 4".to_string()));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry_with_backoff_if(
            &fixed(10, 100),
            |e: &&str| *e != "bad manifest",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("bad manifest") }
            },
        )
        .await;

        assert_eq!(result, Err("bad manifest"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let result = with_timeout(Duration::from_millis(10), async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;
        assert!(matches!(result, Err(PwaKitError::Timeout(_))));

        let quick = with_timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(quick.unwrap(), 7);
    }
}
