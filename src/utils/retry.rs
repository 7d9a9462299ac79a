//! Retry utilities for resilient operations
//!
//! This module provides pluggable backoff strategies and a retry driver that
//! runs an operation until it succeeds or the retry budget is exhausted.
//!
//! Attempts are numbered from zero. After a failed attempt `n` the driver
//! asks the strategy whether to retry (`n < max_retries` by default) and, if
//! so, waits `delay(n)` before attempt `n + 1`. When the budget runs out the
//! last error is returned unchanged.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Jitter amplitude applied by [`ExponentialBackoff`] (fraction of the delay)
const JITTER_FRACTION: f64 = 0.2;

/// Largest exponent used by [`ExponentialBackoff`]; anything above saturates at `max`
const MAX_EXPONENT: u32 = 1023;

// ============================================================================
// Backoff Strategies
// ============================================================================

/// Maps an attempt number to the delay before the next attempt
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    /// Delay to wait after the failed attempt `attempt`
    fn delay(&self, attempt: u32) -> Duration;

    /// Whether another attempt should follow the failed attempt `attempt`
    fn should_retry(&self, attempt: u32, max_retries: u32) -> bool {
        attempt < max_retries
    }
}

/// Always waits the same amount of time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantDelay {
    delay: Duration,
}

impl ConstantDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for ConstantDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `min(base + attempt * increment, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    base: Duration,
    increment: Duration,
    max: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration, increment: Duration, max: Duration) -> Self {
        Self {
            base,
            increment,
            max,
        }
    }
}

impl BackoffStrategy for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.increment
            .checked_mul(attempt)
            .and_then(|step| self.base.checked_add(step))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// `min(base * 2^attempt, max)`, optionally perturbed by up to ±20% jitter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Deterministic part of the delay (no jitter applied)
    fn raw_delay_secs(&self, attempt: u32) -> f64 {
        let exponent = attempt.min(MAX_EXPONENT) as i32;
        let exponential = self.base.as_secs_f64() * 2f64.powi(exponent);
        exponential.min(self.max.as_secs_f64())
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let mut secs = self.raw_delay_secs(attempt);

        if self.jitter {
            let factor = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
            secs += secs * factor;
        }

        Duration::from_secs_f64(secs.max(0.0))
    }
}

// ============================================================================
// Backoff Configuration
// ============================================================================

/// Serializable description of a backoff strategy
///
/// ```toml
/// [backoff]
/// strategy = "exponential"
/// base_ms = 500
/// max_ms = 30000
/// jitter = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Fixed delay between attempts
    Constant { delay_ms: u64 },

    /// Linearly growing delay
    Linear {
        base_ms: u64,
        increment_ms: u64,
        max_ms: u64,
    },

    /// Doubling delay with optional jitter
    Exponential {
        base_ms: u64,
        max_ms: u64,
        #[serde(default)]
        jitter: bool,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1000,
            max_ms: 30_000,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Build the strategy described by this configuration
    pub fn build(&self) -> Arc<dyn BackoffStrategy> {
        match *self {
            Self::Constant { delay_ms } => Arc::new(ConstantDelay::new(Duration::from_millis(delay_ms))),
            Self::Linear {
                base_ms,
                increment_ms,
                max_ms,
            } => Arc::new(LinearBackoff::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(increment_ms),
                Duration::from_millis(max_ms),
            )),
            Self::Exponential {
                base_ms,
                max_ms,
                jitter,
            } => Arc::new(ExponentialBackoff::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
                jitter,
            )),
        }
    }
}

// ============================================================================
// Retry Driver
// ============================================================================

/// Runs an operation up to `max_retries + 1` times using a backoff strategy
#[derive(Debug, Clone)]
pub struct RetryWithStrategy {
    strategy: Arc<dyn BackoffStrategy>,
    max_retries: u32,
}

impl RetryWithStrategy {
    pub fn new(strategy: Arc<dyn BackoffStrategy>, max_retries: u32) -> Self {
        Self {
            strategy,
            max_retries,
        }
    }

    /// Maximum number of retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Retry every error until the budget is exhausted
    ///
    /// # Example
    ///
    /// ```no_run
    /// use orbweaver::utils::retry::{ConstantDelay, RetryWithStrategy};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// # async fn example() -> Result<(), String> {
    /// let retry = RetryWithStrategy::new(Arc::new(ConstantDelay::new(Duration::from_millis(10))), 3);
    /// let value = retry.run(|| async { Ok::<_, String>(42) }).await?;
    /// assert_eq!(value, 42);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_if(operation, |_| true).await
    }

    /// Retry only the errors accepted by `retryable`; other errors return at once
    pub async fn run_if<T, E, F, Fut, P>(&self, mut operation: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !retryable(&e) {
                        warn!(error = %e, "Non-retryable error encountered");
                        return Err(e);
                    }

                    if !self.strategy.should_retry(attempt, self.max_retries) {
                        warn!(
                            attempt = attempt,
                            max_retries = self.max_retries,
                            error = %e,
                            "Retries exhausted"
                        );
                        return Err(e);
                    }

                    let delay = self.strategy.delay(attempt);
                    warn!(
                        attempt = attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Blocking variant of [`run`](Self::run) for synchronous callers
    pub fn run_blocking<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: fmt::Display,
    {
        let mut attempt = 0;

        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !self.strategy.should_retry(attempt, self.max_retries) {
                        warn!(attempt = attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    }

                    let delay = self.strategy.delay(attempt);
                    debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_delay(max_retries: u32) -> RetryWithStrategy {
        RetryWithStrategy::new(Arc::new(ConstantDelay::new(Duration::ZERO)), max_retries)
    }

    #[test]
    fn test_constant_delay() {
        let strategy = ConstantDelay::new(Duration::from_millis(250));
        assert_eq!(strategy.delay(0), Duration::from_millis(250));
        assert_eq!(strategy.delay(9), Duration::from_millis(250));
    }

    #[test]
    fn test_linear_backoff_caps_at_max() {
        let strategy = LinearBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(6),
        );
        assert_eq!(strategy.delay(0), Duration::from_secs(1));
        assert_eq!(strategy.delay(1), Duration::from_secs(3));
        assert_eq!(strategy.delay(2), Duration::from_secs(5));
        assert_eq!(strategy.delay(3), Duration::from_secs(6));
        assert_eq!(strategy.delay(u32::MAX), Duration::from_secs(6));
    }

    #[test]
    fn test_default_should_retry() {
        let strategy = ConstantDelay::new(Duration::ZERO);
        assert!(strategy.should_retry(0, 3));
        assert!(strategy.should_retry(2, 3));
        assert!(!strategy.should_retry(3, 3));
    }

    #[test]
    fn test_exponential_jitter_stays_within_bounds() {
        let strategy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), true);
        for attempt in 0..8 {
            let raw = strategy.raw_delay_secs(attempt);
            let delay = strategy.delay(attempt).as_secs_f64();
            assert!(delay >= raw * (1.0 - JITTER_FRACTION) - 1e-6);
            assert!(delay <= raw * (1.0 + JITTER_FRACTION) + 1e-6);
        }
    }

    proptest! {
        #[test]
        fn prop_exponential_without_jitter(n in 0u32..200) {
            let strategy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), false);
            let expected = 2f64.powi(n as i32).min(30.0);
            prop_assert_eq!(strategy.delay(n), Duration::from_secs_f64(expected));
        }
    }

    #[test]
    fn test_backoff_config_from_toml() {
        let config: BackoffConfig = toml::from_str(
            r#"
            strategy = "linear"
            base_ms = 100
            increment_ms = 50
            max_ms = 400
            "#,
        )
        .unwrap();

        let strategy = config.build();
        assert_eq!(strategy.delay(2), Duration::from_millis(200));
        assert_eq!(strategy.delay(20), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let attempts = AtomicU32::new(0);

        let result = no_delay(3)
            .run(|| async {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(format!("failure {count}"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = no_delay(2)
            .run(|| async {
                let count = attempts.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure {count}"))
            })
            .await;

        assert_eq!(result, Err("failure 2".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_if_stops_on_non_retryable() {
        let attempts = AtomicU32::new(0);

        let result: Result<(), String> = no_delay(5)
            .run_if(
                || async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("validation error".to_string())
                },
                |e| !e.contains("validation"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_blocking() {
        let mut attempts = 0;
        let result = no_delay(1).run_blocking(|| {
            attempts += 1;
            Err::<(), _>("boom")
        });

        assert_eq!(result, Err("boom"));
        assert_eq!(attempts, 2);
    }
}
