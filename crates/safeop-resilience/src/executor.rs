//! Operation execution under a deadline
//!
//! Runs one attempt of an operation, racing it against a timer. Backend
//! replies that carry an error payload are raised as errors here, so nothing
//! above this layer has to look at reply shapes.

use chrono::{DateTime, Utc};
use safeop_error::OperationError;
use safeop_traits::BackendReply;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

/// Boxed future produced by an [`Operation`]
pub type OperationFuture<T> = Pin<Box<dyn Future<Output = Result<T, OperationError>> + Send>>;

/// A re-runnable unit of asynchronous work.
///
/// Each call produces a fresh future, which is what makes retries and
/// deferred replays possible.
pub struct Operation<T> {
    inner: Arc<dyn Fn() -> OperationFuture<T> + Send + Sync>,
}

impl<T> Clone for Operation<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Operation(<fn>)")
    }
}

impl<T: Send + 'static> Operation<T> {
    /// Wraps a closure returning a backend reply.
    ///
    /// A reply carrying an error payload becomes `OperationError::Backend`.
    pub fn new<F, Fut, R>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, OperationError>> + Send + 'static,
        R: BackendReply<Data = T> + Send + 'static,
    {
        Self {
            inner: Arc::new(move || -> OperationFuture<T> {
                let fut = f();
                Box::pin(async move { fut.await?.into_data() })
            }),
        }
    }

    /// Wraps a closure whose result needs no reply normalization
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, OperationError>> + Send + 'static,
    {
        Self {
            inner: Arc::new(move || -> OperationFuture<T> { Box::pin(f()) }),
        }
    }

    /// Starts one attempt
    pub fn call(&self) -> OperationFuture<T> {
        (self.inner)()
    }

    /// Same work, output dropped. Used for deferred replays.
    pub fn discard_output(self) -> Operation<()> {
        let inner = self.inner;
        Operation {
            inner: Arc::new(move || -> OperationFuture<()> {
                let fut = inner();
                Box::pin(async move { fut.await.map(drop) })
            }),
        }
    }
}

/// Outcome of a single execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOutcome {
    /// The attempt produced data
    Success,
    /// The attempt failed or timed out
    Error,
}

/// Structured record of one execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,
    /// Success or error
    pub outcome: ExecutionOutcome,
    /// Operation name from its config
    pub operation_name: String,
    /// Identifier of this attempt
    pub operation_id: String,
    /// Wall time spent in the attempt
    pub duration_ms: u64,
    /// Error text for failed attempts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Logs this record through `tracing`
    pub fn emit(&self) {
        match self.outcome {
            ExecutionOutcome::Success => tracing::info!(
                operation = %self.operation_name,
                operation_id = %self.operation_id,
                duration_ms = self.duration_ms,
                timestamp = %self.timestamp.to_rfc3339(),
                "Operation succeeded"
            ),
            ExecutionOutcome::Error => tracing::warn!(
                operation = %self.operation_name,
                operation_id = %self.operation_id,
                duration_ms = self.duration_ms,
                timestamp = %self.timestamp.to_rfc3339(),
                error = self.error.as_deref().unwrap_or_default(),
                "Operation failed"
            ),
        }
    }
}

/// Generates a unique operation id
pub fn generate_operation_id() -> String {
    format!("op_{}", Uuid::new_v4().simple())
}

/// Execute a future with a timeout.
///
/// The future is dropped when the deadline passes, which cancels it at its
/// next suspension point.
pub async fn with_timeout<T>(
    duration: Duration,
    operation_id: &str,
    future: impl Future<Output = Result<T, OperationError>>,
) -> Result<T, OperationError> {
    let start = Instant::now();
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(OperationError::Timeout {
            operation_id: operation_id.to_string(),
            timeout_ms: duration.as_millis() as u64,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }),
    }
}

/// Runs single attempts and reports them
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationExecutor;

impl OperationExecutor {
    /// Create an executor
    pub fn new() -> Self {
        Self
    }

    /// Runs one attempt of `operation` under `deadline`
    pub async fn run<T: Send + 'static>(
        &self,
        operation: &Operation<T>,
        deadline: Duration,
        operation_id: &str,
        operation_name: &str,
    ) -> Result<T, OperationError> {
        let (result, record) = self
            .run_recorded(operation, deadline, operation_id, operation_name)
            .await;
        record.emit();
        result
    }

    /// Runs one attempt and returns the execution record alongside the result
    pub async fn run_recorded<T: Send + 'static>(
        &self,
        operation: &Operation<T>,
        deadline: Duration,
        operation_id: &str,
        operation_name: &str,
    ) -> (Result<T, OperationError>, ExecutionRecord) {
        let start = Instant::now();
        let result = with_timeout(deadline, operation_id, operation.call()).await;

        let record = ExecutionRecord {
            timestamp: Utc::now(),
            outcome: if result.is_ok() {
                ExecutionOutcome::Success
            } else {
                ExecutionOutcome::Error
            },
            operation_name: operation_name.to_string(),
            operation_id: operation_id.to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| e.to_string()),
        };

        (result, record)
    }
}
