//! Backend health monitoring
//!
//! A cheap probe query is issued periodically while online. Results feed a
//! [`HealthMonitor`], which smooths them into a status using consecutive
//! failure and success thresholds.

use crate::config::ResilienceConfig;
use crate::executor::with_timeout;
use safeop_error::OperationError;
use safeop_traits::{Backend, BackendReply};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Error-sink category for failed probes
pub const HEALTH_CHECK_CATEGORY: &str = "BACKEND_HEALTH_CHECK";

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Probes succeed quickly
    Healthy,
    /// Probes succeed slowly, or started failing
    Degraded,
    /// Probes keep failing
    Unhealthy,
    /// No probe recorded yet
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    /// How long the probe took
    pub latency: Duration,
    /// Failure, if the probe did not succeed
    pub error: Option<OperationError>,
    /// When the probe finished
    pub checked_at: Instant,
}

impl ProbeOutcome {
    /// Successful probe
    pub fn ok(latency: Duration) -> Self {
        Self {
            latency,
            error: None,
            checked_at: Instant::now(),
        }
    }

    /// Failed probe
    pub fn failed(latency: Duration, error: OperationError) -> Self {
        Self {
            latency,
            error: Some(error),
            checked_at: Instant::now(),
        }
    }

    /// Whether the probe succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Thresholds for the health monitor
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Interval between probes
    pub check_interval: Duration,
    /// Deadline for one probe
    pub check_timeout: Duration,
    /// Latency above which a successful probe counts as degraded
    pub degraded_threshold: Duration,
    /// Consecutive failures before unhealthy
    pub failure_threshold: u32,
    /// Consecutive successes before healthy again
    pub recovery_threshold: u32,
    /// Table the probe selects from
    pub probe_table: String,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

impl HealthMonitorConfig {
    /// Thresholds derived from the layer config
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            check_interval: config.health_check_interval(),
            check_timeout: config.health_check_timeout(),
            degraded_threshold: Duration::from_secs(5),
            failure_threshold: 3,
            recovery_threshold: 2,
            probe_table: config.health_table.clone(),
        }
    }

    /// Set degraded threshold
    pub fn with_degraded_threshold(mut self, threshold: Duration) -> Self {
        self.degraded_threshold = threshold;
        self
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

#[derive(Debug)]
struct BackendHealth {
    status: HealthStatus,
    consecutive_failures: u32,
    consecutive_successes: u32,
    total_checks: u64,
    total_failures: u64,
    last_latency: Option<Duration>,
    last_error: Option<String>,
    last_checked: Option<Instant>,
}

impl BackendHealth {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            total_failures: 0,
            last_latency: None,
            last_error: None,
            last_checked: None,
        }
    }

    fn record(&mut self, outcome: &ProbeOutcome, config: &HealthMonitorConfig) {
        self.total_checks += 1;
        self.last_latency = Some(outcome.latency);
        self.last_checked = Some(outcome.checked_at);

        match &outcome.error {
            None => {
                self.consecutive_failures = 0;
                self.consecutive_successes += 1;
                self.last_error = None;

                if outcome.latency > config.degraded_threshold {
                    self.status = HealthStatus::Degraded;
                } else if self.status == HealthStatus::Unknown
                    || self.consecutive_successes >= config.recovery_threshold
                {
                    // Recovery from a failed state needs a streak; a first check does not
                    self.status = HealthStatus::Healthy;
                }
            }
            Some(error) => {
                self.total_failures += 1;
                self.consecutive_successes = 0;
                self.consecutive_failures += 1;
                self.last_error = Some(error.to_string());

                if self.consecutive_failures >= config.failure_threshold {
                    self.status = HealthStatus::Unhealthy;
                } else if matches!(self.status, HealthStatus::Healthy | HealthStatus::Unknown) {
                    self.status = HealthStatus::Degraded;
                }
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.total_failures as f64 / self.total_checks as f64
        }
    }
}

/// Snapshot of backend health
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Current status
    pub status: HealthStatus,
    /// Probes recorded
    pub total_checks: u64,
    /// Share of probes that failed
    pub failure_rate: f64,
    /// Current failure streak
    pub consecutive_failures: u32,
    /// Latency of the latest probe in milliseconds
    pub last_latency_ms: Option<u64>,
    /// Error text of the latest probe, if it failed
    pub last_error: Option<String>,
    /// Time since the latest probe in milliseconds
    pub since_last_check_ms: Option<u64>,
}

/// Tracks backend health across probes
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    state: RwLock<BackendHealth>,
}

impl HealthMonitor {
    /// Create a monitor
    pub fn new(config: HealthMonitorConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BackendHealth::new()),
        }
    }

    /// Thresholds in use
    pub fn config(&self) -> &HealthMonitorConfig {
        &self.config
    }

    /// Folds a probe outcome into the status
    pub async fn record(&self, outcome: &ProbeOutcome) {
        let mut state = self.state.write().await;
        let before = state.status;
        state.record(outcome, &self.config);

        if state.status != before {
            tracing::info!(from = %before, to = %state.status, "Backend health changed");
        }
    }

    /// Current status
    pub async fn status(&self) -> HealthStatus {
        self.state.read().await.status
    }

    /// Whether the backend is healthy
    pub async fn is_healthy(&self) -> bool {
        self.status().await == HealthStatus::Healthy
    }

    /// Detailed snapshot
    pub async fn report(&self) -> HealthReport {
        let state = self.state.read().await;
        HealthReport {
            status: state.status,
            total_checks: state.total_checks,
            failure_rate: state.failure_rate(),
            consecutive_failures: state.consecutive_failures,
            last_latency_ms: state.last_latency.map(|d| d.as_millis() as u64),
            last_error: state.last_error.clone(),
            since_last_check_ms: state.last_checked.map(|t| t.elapsed().as_millis() as u64),
        }
    }

    /// Issues one probe query against `backend`
    pub async fn probe(&self, backend: &dyn Backend) -> ProbeOutcome {
        let start = Instant::now();
        let result = with_timeout(self.config.check_timeout, "health_check", async {
            backend
                .select(&self.config.probe_table, "id", 1)
                .await
                .into_data()
        })
        .await;

        match result {
            Ok(_) => ProbeOutcome::ok(start.elapsed()),
            Err(error) => ProbeOutcome::failed(start.elapsed(), error),
        }
    }
}
