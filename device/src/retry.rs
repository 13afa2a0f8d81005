//! Bounded retry combinator
//!
//! One policy type drives every retry loop in the system: transport
//! retries inside the channel, telescope lock acquisition and the
//! weather wait.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt in milliseconds
    pub delay_ms: u64,
    /// Multiplier applied to the delay after every attempt (1.0 keeps it fixed)
    pub backoff_multiplier: f64,
    /// Upper bound for the delay in milliseconds
    pub max_delay_ms: u64,
    /// Whether to add +/- 25% jitter to the delay
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 3000,
            backoff_multiplier: 1.0,
            max_delay_ms: 60_000,
            use_jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between a fixed number of attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
            max_delay_ms: delay_ms,
            use_jitter: false,
        }
    }

    /// A single attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate the delay after a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms.max(self.delay_ms) as f64);

        let delay = if self.use_jitter {
            let factor = rand::thread_rng().gen_range(0.75..1.25);
            capped * factor
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }

    /// Total time spent sleeping if every attempt fails
    pub fn total_delay(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }
}

/// Why a retry loop stopped without a result
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with an error that must not be retried
    Aborted(E),
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last_error: E },
}

impl<E> RetryError<E> {
    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { last_error, .. } => last_error,
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempt budget is spent.
///
/// The operation receives the 1-based attempt number.
pub async fn retry<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: R,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(RetryError::Aborted(e));
                }
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    label, attempt, max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_default_policy_matches_channel_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 5000,
            use_jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(5000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy {
            use_jitter: true,
            ..RetryPolicy::fixed(3, Duration::from_millis(1000))
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(0).as_millis();
            assert!((750..=1250).contains(&delay));
        }
    }

    #[test]
    fn test_total_delay() {
        let policy = RetryPolicy::fixed(6, Duration::from_secs(300));
        assert_eq!(policy.total_delay(), Duration::from_secs(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, RetryError<String>> = retry(
            &RetryPolicy::default(),
            "probe",
            |_| true,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(format!("attempt {} failed", attempt))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(result.ok(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable() {
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<String>> = retry(
            &RetryPolicy::default(),
            "parse",
            |e: &String| !e.starts_with("parse"),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("parse miss".to_string()) }
            },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Aborted(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let start = tokio::time::Instant::now();
        let result: Result<(), RetryError<String>> = retry(
            &RetryPolicy::fixed(6, Duration::from_secs(300)),
            "lock",
            |_| true,
            |_| async { Err("busy".to_string()) },
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last_error, "busy");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(1500));
    }
}
