//! Resilience context
//!
//! Owns everything the layer shares between calls: connectivity, the offline
//! queue, configuration, collaborators and the background listeners that
//! react to connectivity and auth changes. Build one per process with
//! [`ResilienceContext::builder`] and hand it to call sites.

use crate::backoff::TokioSleeper;
use crate::config::{ConfigError, ResilienceConfig};
use crate::connectivity::Connectivity;
use crate::error_log::ErrorLog;
use crate::executor::Operation;
use crate::health::{
    HealthMonitor, HealthMonitorConfig, HealthReport, ProbeOutcome, HEALTH_CHECK_CATEGORY,
};
use crate::orchestrator::{OperationConfig, OperationResult, RecoveryOrchestrator};
use crate::queue::{DrainReport, OfflineQueue, QueueStatus};
use safeop_error::Severity;
use safeop_traits::{Backend, ErrorSink, NotificationLevel, Notifier, Sleeper};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

const RESTORED_NOTICE: Duration = Duration::from_millis(2000);
const LOST_NOTICE: Duration = Duration::from_millis(3000);

/// Builder for [`ResilienceContext`]
pub struct ResilienceContextBuilder {
    config: ResilienceConfig,
    online: bool,
    backend: Option<Arc<dyn Backend>>,
    notifier: Option<Arc<dyn Notifier>>,
    error_sink: Option<Arc<dyn ErrorSink>>,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for ResilienceContextBuilder {
    fn default() -> Self {
        Self {
            config: ResilienceConfig::default(),
            online: true,
            backend: None,
            notifier: None,
            error_sink: None,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

impl ResilienceContextBuilder {
    /// Set the layer config
    pub fn with_config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the connectivity state at construction
    pub fn with_initial_connectivity(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Set the backend client
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the notifier
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Replace the built-in [`ErrorLog`] with another sink
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Set the sleeper used for backoff and queue spacing
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Validates the config and assembles the context
    pub fn build(self) -> Result<ResilienceContext, ConfigError> {
        self.config.validate()?;

        let (sink, error_log): (Arc<dyn ErrorSink>, _) = match self.error_sink {
            Some(sink) => (sink, None),
            None => {
                let log = Arc::new(ErrorLog::new(self.config.error_log_capacity));
                (log.clone(), Some(log))
            }
        };

        let health = Arc::new(HealthMonitor::new(HealthMonitorConfig::from_config(
            &self.config,
        )));

        let mut orchestrator = RecoveryOrchestrator::new(
            self.config,
            Arc::new(Connectivity::new(self.online)),
            Arc::new(OfflineQueue::new()),
            self.sleeper,
        )
        .with_error_sink(sink);
        if let Some(backend) = self.backend {
            orchestrator = orchestrator.with_backend(backend);
        }
        if let Some(notifier) = self.notifier {
            orchestrator = orchestrator.with_notifier(notifier);
        }

        Ok(ResilienceContext {
            orchestrator: Arc::new(orchestrator),
            health,
            error_log,
            listeners: Mutex::new(Listeners::default()),
        })
    }
}

#[derive(Default)]
struct Listeners {
    started: bool,
    handles: Vec<JoinHandle<()>>,
    auth: Option<JoinHandle<()>>,
}

impl Listeners {
    fn abort_all(&mut self) {
        for handle in self.handles.drain(..).chain(self.auth.take()) {
            handle.abort();
        }
        self.started = false;
    }
}

/// Shared resilience state for a process
pub struct ResilienceContext {
    orchestrator: Arc<RecoveryOrchestrator>,
    health: Arc<HealthMonitor>,
    error_log: Option<Arc<ErrorLog>>,
    listeners: Mutex<Listeners>,
}

impl std::fmt::Debug for ResilienceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceContext")
            .field("orchestrator", &self.orchestrator)
            .field("listening", &self.is_listening())
            .finish_non_exhaustive()
    }
}

impl ResilienceContext {
    /// Start building a context
    pub fn builder() -> ResilienceContextBuilder {
        ResilienceContextBuilder::default()
    }

    /// Layer config
    pub fn config(&self) -> &ResilienceConfig {
        self.orchestrator.config()
    }

    /// The orchestrator behind this context
    pub fn orchestrator(&self) -> &Arc<RecoveryOrchestrator> {
        &self.orchestrator
    }

    /// Shared connectivity state
    pub fn connectivity(&self) -> &Arc<Connectivity> {
        self.orchestrator.connectivity()
    }

    /// Reports a connectivity change from the embedding environment
    pub fn set_online(&self, online: bool) {
        self.connectivity().set_online(online);
    }

    /// Built-in error log, absent when a custom sink was configured
    pub fn error_log(&self) -> Option<&Arc<ErrorLog>> {
        self.error_log.as_ref()
    }

    /// Operation config whose deadline follows this context's network timeout
    pub fn operation_config<T>(&self, name: impl Into<String>) -> OperationConfig<T> {
        OperationConfig::new(name).with_timeout(self.config().network_timeout())
    }

    /// See [`RecoveryOrchestrator::execute_with_recovery`]
    pub async fn execute_with_recovery<T: Send + 'static>(
        &self,
        operation: Operation<T>,
        config: OperationConfig<T>,
    ) -> OperationResult<T> {
        self.orchestrator
            .execute_with_recovery(operation, config)
            .await
    }

    /// Attaches or replaces the backend client.
    ///
    /// When listeners are running, the auth subscription moves to the new
    /// backend.
    pub async fn attach_backend(&self, backend: Arc<dyn Backend>) {
        self.orchestrator.attach_backend(backend.clone()).await;

        let mut listeners = self.listeners();
        if listeners.started {
            if let Some(previous) = listeners.auth.take() {
                previous.abort();
            }
            listeners.auth = Some(spawn_auth_listener(self.orchestrator.clone(), backend));
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether background listeners are running
    pub fn is_listening(&self) -> bool {
        self.listeners().started
    }

    /// Spawns the connectivity, auth and health listeners.
    ///
    /// Must be called from within a tokio runtime. Calling it again while
    /// running has no effect.
    pub async fn start(&self) {
        let backend = self.orchestrator.backend().await;

        let mut listeners = self.listeners();
        if listeners.started {
            return;
        }

        listeners
            .handles
            .push(spawn_connectivity_listener(self.orchestrator.clone()));
        listeners.auth =
            backend.map(|backend| spawn_auth_listener(self.orchestrator.clone(), backend));
        listeners.handles.push(spawn_health_monitor(
            self.orchestrator.clone(),
            self.health.clone(),
        ));
        listeners.started = true;

        tracing::info!(
            online = self.connectivity().is_online(),
            "Resilience listeners started"
        );
    }

    /// Stops every background listener
    pub fn shutdown(&self) {
        let mut listeners = self.listeners();
        if listeners.started {
            listeners.abort_all();
            tracing::info!("Resilience listeners stopped");
        }
    }

    /// Replays the offline queue now
    pub async fn drain_offline_queue(&self) -> DrainReport {
        self.orchestrator.drain_queue().await
    }

    /// Replays the offline queue when online; returns `None` when offline
    pub async fn force_process_queue(&self) -> Option<DrainReport> {
        if self.connectivity().is_online() {
            Some(self.drain_offline_queue().await)
        } else {
            None
        }
    }

    /// Snapshot of the offline queue
    pub async fn queue_status(&self) -> QueueStatus {
        self.orchestrator
            .queue()
            .status(self.orchestrator.connectivity())
            .await
    }

    /// Drops every queued operation
    pub async fn clear_offline_queue(&self) -> usize {
        self.orchestrator.queue().clear().await
    }

    /// Runs one backend health probe now and records it
    pub async fn check_backend_health(&self) -> Option<ProbeOutcome> {
        probe_and_record(&self.orchestrator, &self.health).await
    }

    /// Backend health snapshot
    pub async fn health_report(&self) -> HealthReport {
        self.health.report().await
    }
}

impl Drop for ResilienceContext {
    fn drop(&mut self) {
        self.listeners
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
    }
}

fn spawn_connectivity_listener(orchestrator: Arc<RecoveryOrchestrator>) -> JoinHandle<()> {
    let mut rx = orchestrator.connectivity().subscribe();

    tokio::spawn(async move {
        // Drains run beside the listener so later transitions are reported
        // while a replay is in flight. Dropping the set aborts them.
        let mut drains = JoinSet::new();

        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *rx.borrow_and_update();
                    if online {
                        orchestrator.notify(
                            "Connection restored - syncing queued operations",
                            NotificationLevel::Success,
                            RESTORED_NOTICE,
                        );
                        let orchestrator = orchestrator.clone();
                        drains.spawn(async move {
                            orchestrator.drain_queue().await;
                        });
                    } else {
                        orchestrator.notify(
                            "Connection lost - operations will be queued",
                            NotificationLevel::Warning,
                            LOST_NOTICE,
                        );
                    }
                }
                Some(joined) = drains.join_next(), if !drains.is_empty() => {
                    if let Err(error) = joined {
                        tracing::warn!(%error, "Queue drain task ended abnormally");
                    }
                }
            }
        }
    })
}

fn spawn_auth_listener(
    orchestrator: Arc<RecoveryOrchestrator>,
    backend: Arc<dyn Backend>,
) -> JoinHandle<()> {
    let mut rx = backend.auth_events();

    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => orchestrator.apply_auth_event(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Auth listener lagged behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_health_monitor(
    orchestrator: Arc<RecoveryOrchestrator>,
    health: Arc<HealthMonitor>,
) -> JoinHandle<()> {
    let period = health.config().check_interval;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if orchestrator.connectivity().is_online() {
                probe_and_record(&orchestrator, &health).await;
            }
        }
    })
}

async fn probe_and_record(
    orchestrator: &RecoveryOrchestrator,
    health: &HealthMonitor,
) -> Option<ProbeOutcome> {
    let backend = orchestrator.backend().await?;
    let outcome = health.probe(backend.as_ref()).await;
    health.record(&outcome).await;

    if let Some(error) = &outcome.error {
        tracing::warn!(%error, "Backend health check failed");
        let mut context = BTreeMap::new();
        context.insert("table".to_string(), health.config().probe_table.clone());
        orchestrator.log_error(HEALTH_CHECK_CATEGORY, error, Severity::Low, &context);
    }

    Some(outcome)
}
