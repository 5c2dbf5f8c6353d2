//! Resilience configuration
//!
//! Retry budgets, backoff policy, deadlines and queue limits shared by every
//! operation run through a [`ResilienceContext`](crate::ResilienceContext).

use crate::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// The configuration document could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Layer-wide resilience settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retry budget for ordinary operations
    pub max_retries: u32,
    /// Extra retries granted to critical operations
    pub critical_extra_retries: u32,
    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between consecutive retry delays
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0), 0.0 keeps delays deterministic
    pub jitter: f64,
    /// Default deadline for an operation in milliseconds
    pub network_timeout_ms: u64,
    /// Deadline used when replaying queued operations
    pub queued_operation_timeout_ms: u64,
    /// Deadline for the auth precondition lookup
    pub auth_check_timeout_ms: u64,
    /// Replays allowed per queued operation before it is dropped
    pub queue_max_attempts: u32,
    /// Pause between queued operations during a drain
    pub queue_spacing_ms: u64,
    /// Interval between backend health probes in milliseconds
    pub health_check_interval_ms: u64,
    /// Deadline for a single health probe in milliseconds
    pub health_check_timeout_ms: u64,
    /// Table queried by the health probe
    pub health_table: String,
    /// Number of entries kept by the in-memory error log
    pub error_log_capacity: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            critical_extra_retries: 2,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: 0.0,
            network_timeout_ms: 15_000,
            queued_operation_timeout_ms: 30_000,
            auth_check_timeout_ms: 5000,
            queue_max_attempts: 3,
            queue_spacing_ms: 200,
            health_check_interval_ms: 30_000,
            health_check_timeout_ms: 10_000,
            health_table: "user_profiles".to_string(),
            error_log_capacity: 100,
        }
    }
}

impl ResilienceConfig {
    /// Create a config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a (possibly partial) JSON document over the defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the base retry delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the maximum retry delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the default operation deadline
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the pause between queued operations
    pub fn with_queue_spacing(mut self, spacing: Duration) -> Self {
        self.queue_spacing_ms = spacing.as_millis() as u64;
        self
    }

    /// Set the health probe interval
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Retry budget for an operation
    pub fn retry_budget(&self, is_critical: bool) -> u32 {
        if is_critical {
            self.max_retries.saturating_add(self.critical_extra_retries)
        } else {
            self.max_retries
        }
    }

    /// Backoff policy derived from this config
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig::new()
            .with_initial_delay(Duration::from_millis(self.base_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.backoff_multiplier)
            .with_jitter(self.jitter)
            .with_max_attempts(self.retry_budget(true))
    }

    /// Default operation deadline
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Deadline for replayed queue items
    pub fn queued_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.queued_operation_timeout_ms)
    }

    /// Deadline for the auth precondition lookup
    pub fn auth_check_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_check_timeout_ms)
    }

    /// Pause between queued operations
    pub fn queue_spacing(&self) -> Duration {
        Duration::from_millis(self.queue_spacing_ms)
    }

    /// Interval between health probes
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Deadline for a single health probe
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_delay_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "base_delay_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "max_delay_ms",
                reason: format!("must be at least base_delay_ms ({})", self.base_delay_ms),
            });
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "backoff_multiplier",
                reason: format!("{} is below 1.0", self.backoff_multiplier),
            });
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidValue {
                field: "jitter",
                reason: format!("{} is outside 0.0..=1.0", self.jitter),
            });
        }
        if self.network_timeout_ms == 0 || self.queued_operation_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "network_timeout_ms",
                reason: "timeouts must be greater than zero".to_string(),
            });
        }
        if self.health_check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "health_check_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.queue_max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "queue_max_attempts",
                reason: "must allow at least one replay".to_string(),
            });
        }
        if self.error_log_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "error_log_capacity",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
