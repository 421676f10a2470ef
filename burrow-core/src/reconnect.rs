//! Exponential backoff reconnection logic

use rand::Rng;
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay
    pub base: Duration,
    /// Maximum delay
    pub max: Duration,
    /// Multiplier for each attempt
    pub factor: f64,
    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Get the next delay and increment the attempt counter
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.calculate_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset the backoff (call after a successful connection)
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consecutive failures so far
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn calculate_delay(&self) -> Duration {
        // Exponential growth, attempt capped to keep powi in range.
        let base_secs = self.config.base.as_secs_f64();
        let attempt: i32 = self
            .attempt
            .min(i32::MAX as u32)
            .try_into()
            .unwrap_or(i32::MAX);
        let exp_delay = base_secs * self.config.factor.powi(attempt);

        let jitter_range = exp_delay * self.config.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let delay_with_jitter = (exp_delay + jitter).max(0.0);

        let final_secs = delay_with_jitter.min(self.config.max.as_secs_f64());
        Duration::from_secs_f64(final_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let config = BackoffConfig {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: 0.0, // No jitter for a predictable test
        };
        let mut backoff = Backoff::new(config);

        let d1 = backoff.next_delay();
        assert!(d1.as_secs_f64() >= 0.9 && d1.as_secs_f64() <= 1.1);

        let d2 = backoff.next_delay();
        assert!(d2.as_secs_f64() >= 1.9 && d2.as_secs_f64() <= 2.1);

        let d3 = backoff.next_delay();
        assert!(d3.as_secs_f64() >= 3.9 && d3.as_secs_f64() <= 4.1);
    }

    #[test]
    fn test_backoff_max_cap() {
        let config = BackoffConfig {
            base: Duration::from_secs(10),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(config);

        let _ = backoff.next_delay(); // 10
        let _ = backoff.next_delay(); // 20
        let d3 = backoff.next_delay(); // 40 -> capped to 30

        assert!(d3.as_secs() <= 30);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(BackoffConfig::default());

        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
    }
}
