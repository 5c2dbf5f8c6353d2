//! # safeop Resilience
//!
//! Operation resilience for clients of a hosted backend. Every backend call
//! goes through [`RecoveryOrchestrator::execute_with_recovery`], which adds:
//!
//! - **Timeouts**: each attempt races a deadline and is cancelled when it loses
//! - **Error classification**: failures are mapped to a kind, a retryability
//!   flag and a severity
//! - **Exponential backoff**: retryable failures are retried with capped,
//!   growing delays
//! - **Offline queueing**: work that fails while offline is parked and
//!   replayed when connectivity returns
//! - **Health checks**: the backend is probed periodically while online
//!
//! Callers never see an `Err`; every call resolves to an [`OperationResult`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use safeop_resilience::{Operation, ResilienceContext};
//! use safeop_traits::BackendResponse;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = ResilienceContext::builder().build()?;
//! ctx.start().await;
//!
//! let load = Operation::new(|| async {
//!     // Your backend call here
//!     Ok(BackendResponse::ok(vec!["note".to_string()]))
//! });
//!
//! let result = ctx
//!     .execute_with_recovery(load, ctx.operation_config("load notes").with_fallback(None))
//!     .await;
//!
//! if result.queued {
//!     println!("will sync later");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Error classification
//!
//! ```rust
//! use safeop_resilience::{classify_parts, ErrorKind};
//!
//! let analysis = classify_parts("Failed to fetch", None);
//! assert_eq!(analysis.kind, ErrorKind::Network);
//! assert!(analysis.is_retryable);
//!
//! let analysis = classify_parts("JWT expired", Some("401"));
//! assert_eq!(analysis.kind, ErrorKind::AuthError);
//! assert!(!analysis.is_retryable);
//! ```
//!
//! ## Backoff
//!
//! ```rust
//! use safeop_resilience::delay_for;
//! use std::time::Duration;
//!
//! assert_eq!(delay_for(1), Duration::from_millis(1000));
//! assert_eq!(delay_for(4), Duration::from_millis(8000));
//! assert_eq!(delay_for(6), Duration::from_millis(10_000));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod classifier;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod error_log;
pub mod executor;
pub mod health;
pub mod orchestrator;
pub mod queue;
pub mod retry;

// Re-export main types
pub use backoff::{delay_for, BackoffConfig, ExponentialBackoff, TokioSleeper};

pub use classifier::{classify, classify_parts, ErrorAnalysis, ErrorKind, SuggestedAction};

pub use config::{ConfigError, ResilienceConfig};

pub use connectivity::Connectivity;

pub use context::{ResilienceContext, ResilienceContextBuilder};

pub use error_log::{ErrorEntry, ErrorLog, ErrorReport};

pub use executor::{
    generate_operation_id, with_timeout, ExecutionOutcome, ExecutionRecord, Operation,
    OperationExecutor, OperationFuture,
};

pub use health::{
    HealthMonitor, HealthMonitorConfig, HealthReport, HealthStatus, ProbeOutcome,
    HEALTH_CHECK_CATEGORY,
};

pub use orchestrator::{
    ErrorHook, OperationConfig, OperationResult, RecoveryOrchestrator, AUTH_CHECK_CATEGORY,
    UNRECOVERABLE_CATEGORY,
};

pub use queue::{
    DrainReport, DrainSettings, OfflineQueue, QueueItem, QueueStatus, QueuedOperation, Replay,
};

pub use retry::{RecoveryPhase, RecoveryStep, RetryMachine, RetrySettings};

pub use safeop_error::{OperationError, Severity};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_backoff_config() {
        let config = BackoffConfig::default();
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_resilience_config() {
        let config = ResilienceConfig::default();
        assert_eq!(config.network_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_classify_reexport() {
        assert_eq!(classify(&OperationError::failed("")).kind, ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_health_monitor() {
        let monitor = HealthMonitor::new(HealthMonitorConfig::default());
        assert_eq!(monitor.status().await, HealthStatus::Unknown);
    }
}
