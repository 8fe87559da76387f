//! Retry utilities with exponential backoff and jitter.
//!
//! Used by the watch source to pace stream reconnects and by the runtime for
//! the catch-up list after a leadership promotion. Jitter avoids thundering
//! herds when many operator replicas restart together.

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }
}

/// Stateful backoff sequence derived from a [`RetryConfig`].
///
/// `next_delay` returns the jittered delay to sleep before the next attempt
/// and advances the sequence; `reset` rewinds to the initial delay after a
/// success (e.g. a watch event arrived).
#[derive(Debug)]
pub struct Backoff {
    config: RetryConfig,
    current: Duration,
}

impl Backoff {
    /// Start a backoff sequence at the configured initial delay
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            current: config.initial_delay,
            config: config.clone(),
        }
    }

    /// Jittered delay for the next attempt, advancing the sequence
    pub fn next_delay(&mut self) -> Duration {
        // Jitter: 0.5x to 1.5x of the current delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = Duration::from_secs_f64(self.current.as_secs_f64() * jitter);

        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.config.backoff_multiplier)
                .min(self.config.max_delay.as_secs_f64()),
        );

        delay
    }

    /// Rewind to the initial delay after a successful operation
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut backoff = Backoff::new(config);

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = backoff.next_delay();

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_caps_at_max_delay() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            backoff_multiplier: 2.0,
        };
        let mut backoff = Backoff::new(&config);

        for _ in 0..10 {
            let delay = backoff.next_delay();
            // Jitter ranges 0.5x..1.5x, so the cap is 1.5 * max_delay
            assert!(delay <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_backoff_reset_rewinds() {
        let config = RetryConfig::default();
        let mut backoff = Backoff::new(&config);

        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();

        // After reset the next delay is at most 1.5x the initial delay
        let delay = backoff.next_delay();
        assert!(delay <= config.initial_delay.mul_f64(1.5));
    }
}
