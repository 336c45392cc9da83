//! Retry utilities with configurable backoff.
//!
//! Used where an operation must succeed or fail as an indivisible unit.
//! Batch stages use [`BatchRetryTracker`](super::BatchRetryTracker) instead,
//! which spends its budget per item.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::errors::RetryError;

/// Backoff curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// delay = base
    Linear,
    /// delay = base * 2^(attempt - 1)
    #[default]
    Exponential,
}

/// Jitter applied on top of the backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Returns the raw backoff delay for a 1-indexed attempt.
///
/// Attempt `0` is treated as attempt `1`.
#[must_use]
pub fn calculate_delay(policy: BackoffPolicy, attempt: u32, base: Duration) -> Duration {
    match policy {
        BackoffPolicy::Linear => base,
        BackoffPolicy::Exponential => {
            let exponent = attempt.max(1) - 1;
            let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
            base.saturating_mul(factor)
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Backoff curve.
    #[serde(default)]
    pub backoff: BackoffPolicy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter: JitterStrategy,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff: BackoffPolicy::default(),
            jitter: JitterStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff curve.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterStrategy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Base delay as a duration.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay to sleep after the given 1-indexed failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let delay = calculate_delay(self.backoff, attempt, self.base_delay()).min(max);
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);

        let jittered = match self.jitter {
            JitterStrategy::None => millis,
            JitterStrategy::Full => {
                if millis == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=millis)
                }
            }
            JitterStrategy::Equal => {
                let half = millis / 2;
                if half == 0 {
                    millis
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
        };

        Duration::from_millis(jittered)
    }
}

/// Runs `operation` until it succeeds or `policy.max_attempts` is spent.
///
/// Each failure is logged; the sleep between attempts follows
/// [`RetryPolicy::delay_for`]. The final error is wrapped in
/// [`RetryError::Exhausted`].
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::error!(
                    operation = operation_name,
                    attempts = attempt,
                    error = %e,
                    "Retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    operation: operation_name.to_string(),
                    attempts: attempt,
                    last_error: e,
                });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Attempt failed, retrying"
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
    use std::sync::Arc;

    #[test]
    fn test_backoff_policy_default() {
        assert_eq!(BackoffPolicy::default(), BackoffPolicy::Exponential);
        assert_eq!(JitterStrategy::default(), JitterStrategy::None);
    }

    #[test]
    fn test_linear_delay_is_constant() {
        let base = Duration::from_millis(250);
        for attempt in 1..=10 {
            assert_eq!(calculate_delay(BackoffPolicy::Linear, attempt, base), base);
        }
    }

    #[test]
    fn test_exponential_delay_doubles() {
        let base = Duration::from_millis(100);
        for attempt in 1..=8u32 {
            let expected = base * 2u32.pow(attempt - 1);
            assert_eq!(calculate_delay(BackoffPolicy::Exponential, attempt, base), expected);
        }
    }

    #[test]
    fn test_exponential_delay_saturates() {
        let delay = calculate_delay(BackoffPolicy::Exponential, 200, Duration::from_secs(1));
        assert!(delay >= Duration::from_secs(u64::from(u32::MAX)));
    }

    #[test]
    fn test_delay_for_capped_at_max() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(5000);
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_full_jitter_bounded() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffPolicy::Linear)
            .with_jitter(JitterStrategy::Full);
        for _ in 0..20 {
            assert!(policy.delay_for(1) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"backoff": "linear"}"#).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff, BackoffPolicy::Linear);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_first_try() {
        let policy = RetryPolicy::new();
        let result: Result<i32, RetryError<String>> =
            retry_with_backoff(&policy, "test", |_| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_failures() {
        let policy = RetryPolicy::new().with_max_attempts(5).with_base_delay_ms(10);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&policy, "test", |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("attempt {attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_carries_last_error() {
        let policy = RetryPolicy::new().with_max_attempts(3).with_base_delay_ms(100);
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = retry_with_backoff(&policy, "story", |attempt| async move {
            Err(format!("failure {attempt}"))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.into_last_error(), "failure 3");
        // 100ms after attempt 1, 200ms after attempt 2, none after the last.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }
}
