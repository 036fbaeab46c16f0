//! Retry policy for calls to the coordinator.
//!
//! Exponential backoff with jitter, used by the client both for connecting
//! and for idempotent calls that fail with `Unavailable`.

use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::CoordinationError;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (e.g., 2.0 for exponential backoff).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl From<&ClientConfig> for RetryConfig {
    fn from(client: &ClientConfig) -> Self {
        Self {
            max_retries: client.max_reconnect_attempts,
            initial_delay: Duration::from_millis(client.reconnect_delay_ms),
            max_delay: Duration::from_millis(client.max_reconnect_delay_ms),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Calculates the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt >= self.max_retries {
            return Duration::ZERO;
        }

        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            // Up to 25% on top
            delay_secs * (1.0 + jitter_fraction(attempt) * 0.25)
        } else {
            delay_secs
        };

        Duration::from_secs_f64(final_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Deterministic value in [0, 1) derived from the attempt number.
fn jitter_fraction(seed: u32) -> f64 {
    let x = seed.wrapping_mul(1103515245).wrapping_add(12345);
    (x as f64) / (u32::MAX as f64 + 1.0)
}

/// Outcome of one attempt of a retried operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Ok(T),
    /// Failed, may be attempted again.
    Retry(E),
    /// Failed for good.
    Fail(E),
}

impl<T> From<Result<T, CoordinationError>> for RetryResult<T, CoordinationError> {
    fn from(result: Result<T, CoordinationError>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) if e.is_transient() => Self::Retry(e),
            Err(e) => Self::Fail(e),
        }
    }
}

impl<T, E> RetryResult<T, E> {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retry(_))
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Retry(e) | Self::Fail(e) => Err(e),
        }
    }
}

/// Execute an async operation with retries.
pub async fn retry_async<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = RetryResult<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Fail(error) => return Err(error),
            RetryResult::Retry(error) => {
                if !config.should_retry(attempt) {
                    return Err(error);
                }

                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    "Attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
