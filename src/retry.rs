//! Retry with exponential backoff (spec §4.1).
//!
//! Spec formula: on a per-attempt basis, retryable failures are retried up
//! to 3 times with delays `min(1000·2^attempt, 8000) ms` plus uniform
//! jitter in `[0, 500) ms`. `RetryConfig` keeps the teacher's builder shape
//! (`retry.rs`) but its defaults and delay calculation are pinned to the
//! spec's formula rather than the teacher's own percentage-jitter scheme.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::{ProviderError, Result};

/// Retry configuration. Defaults match spec §4.1 exactly.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound (exclusive) of the uniform jitter window added to every
    /// delay, e.g. 500ms per spec.
    pub jitter_window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(8000),
            backoff_multiplier: 2.0,
            jitter_window: Duration::from_millis(500),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter_window(mut self, window: Duration) -> Self {
        self.jitter_window = window;
        self
    }

    /// `min(initial_delay * multiplier^attempt, max_delay) + uniform(0, jitter_window)`.
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let exponential_ms = base_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as f64);

        let jitter_ms = rand::random::<f64>() * self.jitter_window.as_millis() as f64;

        Duration::from_millis((capped_ms + jitter_ms) as u64)
    }
}

/// Retries `operation` unconditionally on every `Err`, up to
/// `config.max_attempts` times, sleeping between attempts per
/// `calculate_delay`. Does not sleep after the final attempt.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<crate::error::Error>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                let err = err.into();
                log::debug!("retry attempt {attempt} failed: {err}");
                last_error = Some(err);
                if attempt + 1 < config.max_attempts {
                    let delay = config.calculate_delay(attempt);
                    log::debug!("retrying after {delay:?}");
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| crate::error::Error::other("retry failed with no error")))
}

/// Retries `operation` only while the yielded `ProviderError` is retryable
/// per spec §4.1 (HTTP 429/5xx, or message matches rate-limit/overloaded/503).
/// A non-retryable error short-circuits immediately without further attempts.
pub async fn retry_with_backoff_conditional<F, Fut, T>(
    config: &RetryConfig,
    mut operation: F,
) -> std::result::Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let mut last_error = None;

    for attempt in 0..config.max_attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                log::debug!("retryable attempt {attempt} failed: {err}");
                last_error = Some(err);
                if attempt + 1 < config.max_attempts {
                    let delay = config.calculate_delay(attempt);
                    log::debug!("retrying after {delay:?}");
                    sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or(ProviderError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_builder() {
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(1.5);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.backoff_multiplier, 1.5);
    }

    #[test]
    fn test_calculate_delay_capped_at_max_before_jitter() {
        let config = RetryConfig::default();
        // attempt 3: 1000 * 2^3 = 8000, already at the cap.
        let delay = config.calculate_delay(3);
        assert!(delay >= Duration::from_millis(8000));
        assert!(delay < Duration::from_millis(8500));
    }

    #[test]
    fn test_calculate_delay_matches_spec_bounds_for_attempt_zero() {
        let config = RetryConfig::default();
        let delay = config.calculate_delay(0);
        assert!(delay >= Duration::from_millis(1000));
        assert!(delay < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt_no_sleep() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result: Result<i32> = retry_with_backoff(&RetryConfig::default(), || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, crate::error::Error>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let config = RetryConfig::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2))
            .with_jitter_window(Duration::from_millis(1));
        let result: Result<i32> = retry_with_backoff(&config, || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(crate::error::Error::timeout())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let config = RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter_window(Duration::from_millis(1));
        let result: Result<i32> = retry_with_backoff(&config, || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(crate::error::Error::timeout())
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_conditional_retry_stops_on_non_retryable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let config = RetryConfig::default().with_initial_delay(Duration::from_millis(1));
        let result = retry_with_backoff_conditional(&config, || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(ProviderError::Config("bad key".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_is_retryable_error_matrix() {
        assert!(ProviderError::Api {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProviderError::Config(String::new()).is_retryable());
    }
}
