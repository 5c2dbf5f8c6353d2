//! Capped exponential backoff
//!
//! Retry delays grow as `base * multiplier^(attempt - 1)` up to a cap. Delays
//! are deterministic unless a jitter factor is configured.

use async_trait::async_trait;
use rand::Rng;
use safeop_traits::Sleeper;
use std::time::Duration;

/// Backoff strategy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0), 0.0 disables jitter
    pub jitter: f64,
    /// Maximum number of delays handed out by [`ExponentialBackoff`]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 3,
        }
    }
}

impl BackoffConfig {
    /// Create a new backoff config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set maximum attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Deterministic delay before retry `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        let raw = self.initial_delay.as_secs_f64() * factor;

        if raw.is_nan() || raw >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(raw)
    }

    /// Delay before retry `attempt` with the configured jitter applied.
    ///
    /// The result never exceeds `max_delay`.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if self.jitter <= 0.0 {
            return base;
        }

        let mut rng = rand::thread_rng();
        let jitter_range = base.as_secs_f64() * self.jitter;
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        let jittered = (base.as_secs_f64() + jitter).max(0.0);

        Duration::from_secs_f64(jittered).min(self.max_delay)
    }
}

/// Delay before retry `attempt` under the default policy
/// (1 s base, factor 2, 10 s cap).
pub fn delay_for(attempt: u32) -> Duration {
    BackoffConfig::default().delay_for(attempt)
}

/// Exponential backoff iterator
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff instance
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Number of delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Check if more retries are allowed
    pub fn can_retry(&self) -> bool {
        self.attempt < self.config.max_attempts
    }

    /// Get remaining attempts
    pub fn remaining_attempts(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.attempt)
    }

    /// Reset the backoff state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Get next delay without advancing (peek)
    pub fn peek_delay(&self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        Some(self.config.jittered_delay_for(self.attempt + 1))
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.can_retry() {
            return None;
        }

        self.attempt += 1;
        Some(self.config.jittered_delay_for(self.attempt))
    }
}

/// [`Sleeper`] backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(1000));
        assert_eq!(config.max_delay, Duration::from_millis(10_000));
        assert_eq!(config.jitter, 0.0);
    }

    #[test]
    fn test_delay_sequence() {
        assert_eq!(delay_for(1), Duration::from_millis(1000));
        assert_eq!(delay_for(2), Duration::from_millis(2000));
        assert_eq!(delay_for(3), Duration::from_millis(4000));
        assert_eq!(delay_for(4), Duration::from_millis(8000));
        assert_eq!(delay_for(5), Duration::from_millis(10_000));
        assert_eq!(delay_for(6), Duration::from_millis(10_000));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        assert_eq!(delay_for(0), delay_for(1));
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        assert_eq!(delay_for(u32::MAX), Duration::from_millis(10_000));
    }

    #[test]
    fn test_backoff_iteration() {
        let config = BackoffConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_attempts(3);

        let delays: Vec<_> = ExponentialBackoff::new(config).collect();

        assert_eq!(delays.len(), 3);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
        assert_eq!(delays[2], Duration::from_millis(400));
    }

    #[test]
    fn test_can_retry() {
        let config = BackoffConfig::new().with_max_attempts(2);
        let mut backoff = ExponentialBackoff::new(config);

        assert!(backoff.can_retry());
        backoff.next();
        assert!(backoff.can_retry());
        backoff.next();
        assert!(!backoff.can_retry());
        assert!(backoff.peek_delay().is_none());
    }

    #[test]
    fn test_reset() {
        let config = BackoffConfig::new().with_max_attempts(2);
        let mut backoff = ExponentialBackoff::new(config);

        backoff.next();
        backoff.next();
        assert_eq!(backoff.remaining_attempts(), 0);

        backoff.reset();
        assert!(backoff.can_retry());
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.peek_delay(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = BackoffConfig::new().with_jitter(0.5);

        for attempt in 1..=6 {
            let base = config.delay_for(attempt);
            let delay = config.jittered_delay_for(attempt);
            assert!(delay <= config.max_delay);
            assert!(delay.as_secs_f64() >= base.as_secs_f64() * 0.5 - 1e-9);
        }
    }

    #[test]
    fn test_jitter_clamped() {
        let config = BackoffConfig::new().with_jitter(3.0);
        assert_eq!(config.jitter, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_sleeper_waits() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_millis(1500)).await;
        assert!(start.elapsed() >= Duration::from_millis(1500));
    }
}
