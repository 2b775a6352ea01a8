//! Retry policy with capped exponential backoff.

use std::time::Duration;

use postbox_common::config::RetrySettings;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts a job gets unless the producer overrides it.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(3600 * 6),
            multiplier: 2.0,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        let initial_delay = Duration::from_secs(settings.base_delay_secs.max(1));
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(settings.max_delay_secs).max(initial_delay),
            // A multiplier at or below 1 would stop the delays from growing.
            multiplier: if settings.multiplier.is_finite() && settings.multiplier > 1.0 {
                settings.multiplier
            } else {
                2.0
            },
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows `attempts` failed deliveries.
    ///
    /// `initial_delay * multiplier^(attempts - 1)`, capped at `max_delay`.
    /// `attempts` is 1 after the first failure.
    #[must_use]
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        Duration::from_secs_f64(delay_secs).min(self.max_delay)
    }

    /// Whether a job that has made `attempts` deliveries out of
    /// `max_attempts` may be tried again.
    #[must_use]
    pub const fn should_retry(attempts: u32, max_attempts: u32) -> bool {
        attempts < max_attempts
    }
}
