//! Recovery orchestration
//!
//! [`RecoveryOrchestrator::execute_with_recovery`] is the single entry point
//! callers use for backend work. It validates preconditions, runs the
//! operation under a deadline, classifies failures and then retries, queues
//! or surfaces them. Every path ends in an [`OperationResult`]; nothing here
//! returns `Err` or panics.

use crate::classifier::{classify, ErrorAnalysis, ErrorKind};
use crate::config::ResilienceConfig;
use crate::connectivity::Connectivity;
use crate::executor::{generate_operation_id, with_timeout, Operation, OperationExecutor};
use crate::queue::{DrainReport, DrainSettings, OfflineQueue, Replay};
use crate::retry::{RecoveryStep, RetryMachine, RetrySettings};
use async_trait::async_trait;
use safeop_error::{OperationError, Severity};
use safeop_traits::{
    AuthEvent, AuthState, Backend, BackendReply, ErrorSink, NotificationLevel, Notifier, Sleeper,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Error-sink category for operations that could not be recovered
pub const UNRECOVERABLE_CATEGORY: &str = "OPERATION_UNRECOVERABLE";

/// Error-sink category for failed auth precondition lookups
pub const AUTH_CHECK_CATEGORY: &str = "AUTH_CHECK";

/// How long a "queued" notification stays visible
const QUEUED_NOTICE: Duration = Duration::from_millis(3000);

/// Caller hook invoked with the first classified failure of a call
pub type ErrorHook = Arc<dyn Fn(&OperationError, &ErrorAnalysis) + Send + Sync>;

/// Per-call recovery options
#[derive(Clone)]
pub struct OperationConfig<T> {
    /// Human-readable operation name used in logs and messages
    pub name: String,
    /// Critical operations get a larger retry budget and need connectivity up front
    pub is_critical: bool,
    /// Whether retryable failures are retried
    pub enable_retry: bool,
    /// Whether the operation may be parked while offline
    pub enable_offline_queue: bool,
    /// Whether a signed-in user is required
    pub requires_auth: bool,
    /// Whether unrecoverable failures are shown to the user
    pub show_user_error: bool,
    /// Deadline for each attempt
    pub timeout: Duration,
    /// Data returned instead of real data when the operation does not succeed
    pub fallback_value: Option<T>,
    /// Free-form context attached to error reports
    pub metadata: BTreeMap<String, String>,
    /// Called once per call with the first failure and its analysis
    pub on_error: Option<ErrorHook>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for OperationConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationConfig")
            .field("name", &self.name)
            .field("is_critical", &self.is_critical)
            .field("enable_retry", &self.enable_retry)
            .field("enable_offline_queue", &self.enable_offline_queue)
            .field("requires_auth", &self.requires_auth)
            .field("show_user_error", &self.show_user_error)
            .field("timeout", &self.timeout)
            .field("fallback_value", &self.fallback_value)
            .field("metadata", &self.metadata)
            .field("has_on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<T> OperationConfig<T> {
    /// Config with defaults: retry and offline queueing on, 15 s deadline
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_critical: false,
            enable_retry: true,
            enable_offline_queue: true,
            requires_auth: false,
            show_user_error: true,
            timeout: ResilienceConfig::default().network_timeout(),
            fallback_value: None,
            metadata: BTreeMap::new(),
            on_error: None,
        }
    }

    /// Mark as critical
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.is_critical = critical;
        self
    }

    /// Enable or disable retries
    pub fn with_retry(mut self, enabled: bool) -> Self {
        self.enable_retry = enabled;
        self
    }

    /// Enable or disable offline queueing
    pub fn with_offline_queue(mut self, enabled: bool) -> Self {
        self.enable_offline_queue = enabled;
        self
    }

    /// Require a signed-in user
    pub fn with_auth_required(mut self, required: bool) -> Self {
        self.requires_auth = required;
        self
    }

    /// Show or hide unrecoverable failures
    pub fn with_user_error(mut self, show: bool) -> Self {
        self.show_user_error = show;
        self
    }

    /// Set the per-attempt deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the fallback value
    pub fn with_fallback(mut self, value: T) -> Self {
        self.fallback_value = Some(value);
        self
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set the failure hook.
    ///
    /// A panicking hook is logged and otherwise ignored.
    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&OperationError, &ErrorAnalysis) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Same options without the fallback, for queued replays
    pub fn for_replay(&self) -> OperationConfig<()> {
        OperationConfig {
            name: self.name.clone(),
            is_critical: self.is_critical,
            enable_retry: self.enable_retry,
            enable_offline_queue: self.enable_offline_queue,
            requires_auth: self.requires_auth,
            show_user_error: self.show_user_error,
            timeout: self.timeout,
            fallback_value: None,
            metadata: self.metadata.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

/// Normalized outcome of `execute_with_recovery`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult<T> {
    /// The operation produced data
    pub success: bool,
    /// Real data on success, the fallback otherwise
    pub data: Option<T>,
    /// User-facing failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The operation was parked in the offline queue
    pub queued: bool,
    /// Queue id when `queued`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<Uuid>,
    /// Raw error text behind `error`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl<T> OperationResult<T> {
    /// Successful result
    pub fn succeeded(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            queued: false,
            queue_id: None,
            detail: None,
        }
    }

    /// Operation parked for later replay
    pub fn queued(queue_id: Uuid, fallback: Option<T>) -> Self {
        Self {
            success: false,
            data: fallback,
            error: None,
            queued: true,
            queue_id: Some(queue_id),
            detail: None,
        }
    }

    /// Unrecoverable failure
    pub fn failed(message: impl Into<String>, detail: impl Into<String>, fallback: Option<T>) -> Self {
        Self {
            success: false,
            data: fallback,
            error: Some(message.into()),
            queued: false,
            queue_id: None,
            detail: Some(detail.into()),
        }
    }
}

/// Runs operations through validation, retry, queueing and failure handling
pub struct RecoveryOrchestrator {
    config: ResilienceConfig,
    connectivity: Arc<Connectivity>,
    queue: Arc<OfflineQueue>,
    sleeper: Arc<dyn Sleeper>,
    backend: RwLock<Option<Arc<dyn Backend>>>,
    auth_state: RwLock<AuthState>,
    notifier: Option<Arc<dyn Notifier>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    executor: OperationExecutor,
}

impl std::fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("config", &self.config)
            .field("connectivity", &self.connectivity)
            .field("has_notifier", &self.notifier.is_some())
            .field("has_error_sink", &self.error_sink.is_some())
            .finish_non_exhaustive()
    }
}

impl RecoveryOrchestrator {
    /// Create an orchestrator over shared connectivity and queue state
    pub fn new(
        config: ResilienceConfig,
        connectivity: Arc<Connectivity>,
        queue: Arc<OfflineQueue>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            config,
            connectivity,
            queue,
            sleeper,
            backend: RwLock::new(None),
            auth_state: RwLock::new(AuthState::Unknown),
            notifier: None,
            error_sink: None,
            executor: OperationExecutor::new(),
        }
    }

    /// Set the backend client
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = RwLock::new(Some(backend));
        self
    }

    /// Set the notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the error sink
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Layer config
    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// Shared connectivity state
    pub fn connectivity(&self) -> &Arc<Connectivity> {
        &self.connectivity
    }

    /// Shared offline queue
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Attaches or replaces the backend client
    pub async fn attach_backend(&self, backend: Arc<dyn Backend>) {
        *self.backend.write().await = Some(backend);
    }

    /// Current backend client, if attached
    pub async fn backend(&self) -> Option<Arc<dyn Backend>> {
        self.backend.read().await.clone()
    }

    /// Last known auth state
    pub async fn auth_state(&self) -> AuthState {
        self.auth_state.read().await.clone()
    }

    /// Folds an auth event into the cached auth state
    pub async fn apply_auth_event(&self, event: &AuthEvent) {
        let mut state = self.auth_state.write().await;
        *state = state.apply(event);
        tracing::debug!(?state, "Auth state updated");
    }

    /// Shows a notification when a notifier is configured
    pub fn notify(&self, message: &str, level: NotificationLevel, duration: Duration) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(message, level, duration);
        }
    }

    /// Records an error when an error sink is configured
    pub fn log_error(
        &self,
        category: &str,
        error: &OperationError,
        severity: Severity,
        context: &BTreeMap<String, String>,
    ) {
        if let Some(sink) = &self.error_sink {
            sink.log_error(category, error, severity, context);
        }
    }

    /// Runs `operation` with validation, retry, offline queueing and
    /// failure handling as configured by `config`.
    pub async fn execute_with_recovery<T: Send + 'static>(
        &self,
        operation: Operation<T>,
        config: OperationConfig<T>,
    ) -> OperationResult<T> {
        let operation_id = generate_operation_id();
        let mut machine = RetryMachine::new(
            RetrySettings {
                budget: self.config.retry_budget(config.is_critical),
                enable_retry: config.enable_retry,
                enable_offline_queue: config.enable_offline_queue,
            },
            self.config.backoff(),
        );

        if let Err(error) = self.validate(config.is_critical, config.requires_auth).await {
            machine.on_validation_failed();
            tracing::warn!(operation = %config.name, operation_id = %operation_id, %error, "Precondition failed");
            if let Some(hook) = &config.on_error {
                run_error_hook(hook, &error, &classify(&error), &config.name);
            }
            return self.unrecoverable(error, None, &operation_id, config);
        }

        let mut last_error: Option<OperationError> = None;
        let mut on_error = config.on_error.clone();
        let mut step = machine.on_validated();

        loop {
            step = match step {
                RecoveryStep::Execute => {
                    match self
                        .executor
                        .run(&operation, config.timeout, &operation_id, &config.name)
                        .await
                    {
                        Ok(data) => {
                            machine.on_success();
                            if machine.attempt() > 0 {
                                tracing::info!(
                                    operation = %config.name,
                                    retries = machine.attempt(),
                                    "Operation succeeded after retry"
                                );
                            }
                            return OperationResult::succeeded(data);
                        }
                        Err(error) => {
                            let analysis = classify(&error);
                            tracing::debug!(
                                operation = %config.name,
                                kind = %analysis.kind,
                                retryable = analysis.is_retryable,
                                "Classified failure"
                            );
                            if let Some(hook) = on_error.take() {
                                run_error_hook(&hook, &error, &analysis, &config.name);
                            }
                            last_error = Some(error);
                            machine.on_failure(analysis, self.connectivity.is_online())
                        }
                    }
                }
                RecoveryStep::Retry { attempt, delay } => {
                    tracing::debug!(
                        operation = %config.name,
                        attempt,
                        max_retries = self.config.retry_budget(config.is_critical),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying operation"
                    );
                    self.sleeper.sleep(delay).await;
                    machine.on_wake(self.connectivity.is_online())
                }
                RecoveryStep::Queue => return self.enqueue(operation, config).await,
                RecoveryStep::Fail => {
                    let kind = machine.last_analysis().map(|a| a.kind);
                    let error = last_error.unwrap_or_else(|| {
                        OperationError::failed(format!("{} failed", config.name))
                    });
                    return self.unrecoverable(error, kind, &operation_id, config);
                }
            };
        }
    }

    /// Replays everything in the offline queue while online
    pub async fn drain_queue(&self) -> DrainReport {
        self.queue
            .drain(
                self,
                &self.connectivity,
                self.sleeper.as_ref(),
                DrainSettings::from_config(&self.config),
            )
            .await
    }

    async fn validate(&self, is_critical: bool, requires_auth: bool) -> Result<(), OperationError> {
        let Some(backend) = self.backend().await else {
            return Err(OperationError::validation("Backend client not initialized"));
        };

        if is_critical && !self.connectivity.is_online() {
            return Err(OperationError::validation(
                "No network connection for critical operation",
            ));
        }

        if requires_auth && !self.is_authenticated(backend.as_ref()).await {
            return Err(OperationError::validation(
                "Authentication required for this operation",
            ));
        }

        Ok(())
    }

    async fn is_authenticated(&self, backend: &dyn Backend) -> bool {
        if self.auth_state.read().await.is_signed_in() {
            return true;
        }

        let lookup = with_timeout(self.config.auth_check_timeout(), "auth_check", async {
            backend.current_user().await.into_data()
        })
        .await;

        match lookup {
            Ok(Some(Some(user))) => {
                self.apply_auth_event(&AuthEvent::SignedIn(user)).await;
                true
            }
            Ok(_) => false,
            Err(error) => {
                tracing::warn!(%error, "Authentication check failed");
                self.log_error(AUTH_CHECK_CATEGORY, &error, Severity::High, &BTreeMap::new());
                false
            }
        }
    }

    async fn enqueue<T: Send + 'static>(
        &self,
        operation: Operation<T>,
        config: OperationConfig<T>,
    ) -> OperationResult<T> {
        let queue_id = self
            .queue
            .enqueue(operation.discard_output(), config.for_replay())
            .await;

        self.notify(
            &format!(
                "{} queued - will sync when connection is restored",
                config.name
            ),
            NotificationLevel::Info,
            QUEUED_NOTICE,
        );

        OperationResult::queued(queue_id, config.fallback_value)
    }

    fn unrecoverable<T>(
        &self,
        error: OperationError,
        kind: Option<ErrorKind>,
        operation_id: &str,
        config: OperationConfig<T>,
    ) -> OperationResult<T> {
        let user_message = match kind {
            Some(kind) => kind.user_message(&config.name),
            None => error.to_string(),
        };

        if config.show_user_error {
            self.notify(
                &user_message,
                NotificationLevel::Error,
                NotificationLevel::Error.default_duration(),
            );
        }

        let severity = if config.is_critical {
            Severity::Critical
        } else {
            Severity::High
        };

        let mut context = config.metadata;
        context.insert("operation".to_string(), config.name.clone());
        context.insert("operation_id".to_string(), operation_id.to_string());
        self.log_error(UNRECOVERABLE_CATEGORY, &error, severity, &context);

        if config.is_critical {
            tracing::error!(operation = %config.name, operation_id, %error, "Critical operation failed");
        } else {
            tracing::warn!(operation = %config.name, operation_id, %error, "Operation failed");
        }

        OperationResult::failed(user_message, error.to_string(), config.fallback_value)
    }
}

fn run_error_hook(
    hook: &ErrorHook,
    error: &OperationError,
    analysis: &ErrorAnalysis,
    operation: &str,
) {
    if catch_unwind(AssertUnwindSafe(|| hook(error, analysis))).is_err() {
        tracing::warn!(operation, "Custom error handler failed");
    }
}

#[async_trait]
impl Replay for RecoveryOrchestrator {
    async fn replay(&self, operation: &Operation<()>, config: &OperationConfig<()>) -> bool {
        self.execute_with_recovery(operation.clone(), config.clone())
            .await
            .success
    }
}
