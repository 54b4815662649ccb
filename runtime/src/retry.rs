//! Redelivery with exponential backoff.
//!
//! A flow configured with a [`RetryPolicy`] re-runs a failed chain before it
//! gives the failure to its exception strategy ("until successful"). The
//! helpers here are generic over the operation so they can be reused for any
//! fallible async step.
//!
//! # Example
//!
//! ```rust
//! use courier_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::new()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10));
//!
//! let result = retry_with_backoff(&policy, || async { Ok::<_, String>(42) }).await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How often and how patiently to retry.
///
/// # Default Values
///
/// - `max_retries`: 3
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0
/// - `jitter`: off
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    /// Policy with default values
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Policy that never retries
    #[must_use]
    pub const fn none() -> Self {
        Self::new().max_retries(0)
    }

    /// Set the number of retries after the first attempt
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay before the first retry
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the cap on any single delay
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Scale each delay by a random factor in `0.5..=1.0`
    #[must_use]
    pub const fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Configured number of retries
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (0-indexed).
    ///
    /// `initial_delay * multiplier^attempt`, capped at `max_delay`, then
    /// jittered if enabled.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let secs = if self.jitter {
            use rand::Rng;
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

/// The last error of an operation that never succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    /// Error of the final attempt
    pub error: E,
    /// Attempts made, including the first
    pub attempts: u32,
}

/// Retry an async operation with exponential backoff.
///
/// # Errors
///
/// Returns the error of the last attempt once `max_retries` retries failed.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, operation, |_| true)
        .await
        .map_err(|exhausted| exhausted.error)
}

/// Retry an async operation while `is_retryable` accepts its error.
///
/// A non-retryable error ends the loop immediately.
///
/// # Errors
///
/// Returns [`Exhausted`] with the final error and the number of attempts.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt: u32 = 0;

    loop {
        let error = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    metrics::counter!("courier_redelivery_successes_total").increment(1);
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(error) => error,
        };

        if !is_retryable(&error) {
            tracing::debug!(error = %error, "Error is not retryable, failing immediately");
            return Err(Exhausted {
                error,
                attempts: attempt + 1,
            });
        }

        if attempt >= policy.max_retries {
            if policy.max_retries > 0 {
                metrics::counter!("courier_redelivery_exhausted_total").increment(1);
                tracing::error!(attempt, error = %error, "Operation failed after max retries");
            }
            return Err(Exhausted {
                error,
                attempts: attempt + 1,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        metrics::counter!("courier_redelivery_attempts_total").increment(1);
        tracing::warn!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Operation failed, retrying"
        );

        sleep(delay).await;
        attempt += 1;
    }
}
