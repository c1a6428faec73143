//! Blocking retry with exponential backoff.
//!
//! Used around connects, where a robot that is still booting or a busy
//! Bluetooth adapter often succeeds on a second attempt.
//!
//! ```
//! use rover_core::{Error, RetryConfig, with_retry};
//!
//! let config = RetryConfig::none();
//! let value = with_retry(&config, "answer", || Ok::<_, Error>(42)).unwrap();
//! assert_eq!(value, 42);
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one (0 disables retrying).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Stretch each delay by up to 25% at random.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default policy with `max_retries` retries.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Single attempt.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Patient policy for establishing a link.
    pub fn for_connect() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set the retry count.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the first delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = Duration::try_from_secs_f64(base)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if self.jitter {
            capped.mul_f64(1.0 + rand::rng().random::<f64>() * 0.25)
        } else {
            capped
        }
    }
}

/// Run `operation` until it succeeds, fails permanently or runs out of
/// retries. Sleeps the calling thread between attempts.
///
/// Returns the last error when every attempt failed.
pub fn with_retry<F, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{operation_name} succeeded after {attempt} retries");
                }
                return Ok(value);
            }
            Err(e) if attempt < config.max_retries && is_retryable(&e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    "{operation_name} failed (attempt {}/{}): {e}; retrying in {delay:?}",
                    attempt + 1,
                    config.max_retries + 1,
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Whether another attempt could plausibly succeed.
pub fn is_retryable(error: &Error) -> bool {
    matches!(
        error,
        Error::Timeout { .. }
            | Error::Io(_)
            | Error::Serial(_)
            | Error::Bluetooth(_)
            | Error::NotConnected
            | Error::ConnectionFailed { .. }
    )
}
