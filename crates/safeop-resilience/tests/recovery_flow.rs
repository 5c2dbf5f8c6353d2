//! End-to-end recovery behavior through `ResilienceContext`

use safeop_resilience::{
    Connectivity, ErrorKind, HealthStatus, OfflineQueue, Operation, OperationConfig,
    OperationError, RecoveryOrchestrator, ResilienceConfig, ResilienceContext, Severity,
    HEALTH_CHECK_CATEGORY, UNRECOVERABLE_CATEGORY,
};
use safeop_testing::{
    network_error, validation_error, MockBackend, RecordingErrorSink, RecordingNotifier,
    RecordingSleeper, Script,
};
use safeop_traits::{AuthEvent, AuthUser, BackendError, BackendResponse, NotificationLevel};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    ctx: ResilienceContext,
    backend: Arc<MockBackend>,
    sleeper: Arc<RecordingSleeper>,
    notifier: Arc<RecordingNotifier>,
    sink: Arc<RecordingErrorSink>,
}

fn harness(online: bool) -> Harness {
    let backend = MockBackend::new().shared();
    let sleeper = Arc::new(RecordingSleeper::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let sink = Arc::new(RecordingErrorSink::new());

    let ctx = ResilienceContext::builder()
        .with_initial_connectivity(online)
        .with_backend(backend.clone())
        .with_sleeper(sleeper.clone())
        .with_notifier(notifier.clone())
        .with_error_sink(sink.clone())
        .build()
        .unwrap();

    Harness {
        ctx,
        backend,
        sleeper,
        notifier,
        sink,
    }
}

fn scripted<T: Clone + Send + Sync + 'static>(script: &Arc<Script<T>>) -> Operation<T> {
    let script = script.clone();
    Operation::from_fn(move || {
        let script = script.clone();
        async move { script.next() }
    })
}

fn unknown_error() -> OperationError {
    OperationError::failed("Something happened")
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn succeeds_after_two_network_failures() {
    let h = harness(true);
    let script = Script::new(vec![Err(network_error()), Err(network_error()), Ok(5)]);

    let result = h
        .ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("load profile"))
        .await;

    assert!(result.success);
    assert_eq!(result.data, Some(5));
    assert_eq!(script.calls(), 3);
    assert_eq!(
        h.sleeper.sleeps(),
        vec![Duration::from_millis(1000), Duration::from_millis(2000)]
    );
    assert_eq!(h.sleeper.total(), Duration::from_millis(3000));
    assert!(h.sink.logged().is_empty());
}

#[tokio::test]
async fn offline_failure_queues_without_delay() {
    let h = harness(false);
    let script: Arc<Script<()>> = Script::always_err(network_error());

    let result = h
        .ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("save note"))
        .await;

    assert!(!result.success);
    assert!(result.queued);
    assert!(result.queue_id.is_some());
    assert!(h.sleeper.sleeps().is_empty());
    assert_eq!(h.ctx.queue_status().await.length, 1);

    let info = h.notifier.with_level(NotificationLevel::Info);
    assert_eq!(info.len(), 1);
    assert_eq!(
        info[0].message,
        "save note queued - will sync when connection is restored"
    );
    assert_eq!(info[0].duration, Duration::from_millis(3000));
}

#[tokio::test]
async fn validation_error_is_not_retried_or_queued() {
    let h = harness(false);
    let script: Arc<Script<()>> = Script::always_err(validation_error());

    let result = h
        .ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("create profile"))
        .await;

    assert!(!result.success);
    assert!(!result.queued);
    assert_eq!(
        result.error.as_deref(),
        Some(ErrorKind::ValidationError.user_message("create profile").as_str())
    );
    assert_eq!(script.calls(), 1);
    assert!(h.sleeper.sleeps().is_empty());
    assert_eq!(h.ctx.queue_status().await.length, 0);

    let logged = h.sink.in_category(UNRECOVERABLE_CATEGORY);
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].severity, Severity::High);
    assert_eq!(logged[0].context["operation"], "create profile");
}

#[tokio::test]
async fn auth_error_stops_retry_loop() {
    let h = harness(true);
    let script: Arc<Script<()>> = Script::new(vec![
        Err(network_error()),
        Err(OperationError::backend("JWT expired").with_code("401")),
        Ok(()),
    ]);

    let result = h
        .ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("sync"))
        .await;

    assert!(!result.success);
    assert_eq!(script.calls(), 2);
    assert_eq!(
        result.error.as_deref(),
        Some("Your session has expired. Please refresh the page and log in again.")
    );
}

#[tokio::test]
async fn critical_operation_gets_larger_budget_and_critical_log() {
    let h = harness(true);
    let script: Arc<Script<u8>> = Script::always_err(network_error());

    let result = h
        .ctx
        .execute_with_recovery(
            scripted(&script),
            OperationConfig::new("submit payment")
                .with_critical(true)
                .with_fallback(0)
                .with_metadata("invoice", "inv_1"),
        )
        .await;

    assert!(!result.success);
    assert_eq!(result.data, Some(0));
    assert_eq!(script.calls(), 6);
    assert_eq!(
        h.sleeper.sleeps(),
        [1000, 2000, 4000, 8000, 10_000]
            .into_iter()
            .map(Duration::from_millis)
            .collect::<Vec<_>>()
    );

    let logged = h.sink.in_category(UNRECOVERABLE_CATEGORY);
    assert_eq!(logged[0].severity, Severity::Critical);
    assert_eq!(logged[0].context["invoice"], "inv_1");

    let errors = h.notifier.with_level(NotificationLevel::Error);
    assert_eq!(
        errors[0].message,
        ErrorKind::Network.user_message("submit payment")
    );
}

#[tokio::test]
async fn hidden_user_error_skips_notification() {
    let h = harness(true);
    let script: Arc<Script<()>> = Script::always_err(unknown_error());

    let result = h
        .ctx
        .execute_with_recovery(
            scripted(&script),
            OperationConfig::new("prefetch").with_user_error(false),
        )
        .await;

    assert_eq!(
        result.error.as_deref(),
        Some("prefetch failed. Please try again or contact support if the issue persists.")
    );
    assert!(h.notifier.with_level(NotificationLevel::Error).is_empty());
    assert_eq!(h.sink.logged().len(), 1);
}

#[tokio::test]
async fn retry_disabled_fails_after_one_attempt() {
    let h = harness(true);
    let script: Arc<Script<()>> = Script::always_err(network_error());

    let result = h
        .ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("ping").with_retry(false))
        .await;

    assert!(!result.success);
    assert_eq!(script.calls(), 1);
}

#[tokio::test]
async fn going_offline_during_backoff_queues() {
    let connectivity = Arc::new(Connectivity::online());
    let flag = connectivity.clone();
    let sleeper = Arc::new(RecordingSleeper::new().with_hook(move |_, _| flag.set_online(false)));
    let queue = Arc::new(OfflineQueue::new());

    let orchestrator = RecoveryOrchestrator::new(
        ResilienceConfig::default(),
        connectivity,
        queue.clone(),
        sleeper.clone(),
    )
    .with_backend(MockBackend::new().shared());

    let script: Arc<Script<()>> = Script::always_err(network_error());
    let result = orchestrator
        .execute_with_recovery(scripted(&script), OperationConfig::new("upload"))
        .await;

    assert!(result.queued);
    assert_eq!(script.calls(), 1);
    assert_eq!(sleeper.sleeps().len(), 1);
    assert_eq!(queue.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_is_classified_and_retried() {
    let h = harness(true);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let slow = Operation::from_fn(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1)
        }
    });

    let result = h
        .ctx
        .execute_with_recovery(
            slow,
            OperationConfig::new("slow query").with_timeout(Duration::from_millis(100)),
        )
        .await;

    assert!(!result.success);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert!(result
        .detail
        .unwrap()
        .starts_with("Operation timeout after 100ms"));
}

#[tokio::test]
async fn requires_auth_caches_lookup() {
    let h = harness(true);
    h.backend.set_user(Some(AuthUser::new("user-1")));

    for _ in 0..2 {
        let result = h
            .ctx
            .execute_with_recovery(
                Operation::from_fn(|| async { Ok(()) }),
                OperationConfig::new("load").with_auth_required(true),
            )
            .await;
        assert!(result.success);
    }

    assert_eq!(h.backend.user_lookups(), 1);
}

#[tokio::test]
async fn drain_drops_item_after_three_failed_replays() {
    let h = harness(false);
    let script: Arc<Script<()>> = Script::always_err(unknown_error());

    let queued = h
        .ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("save goals"))
        .await;
    assert!(queued.queued);

    h.ctx.set_online(true);
    let report = h.ctx.drain_offline_queue().await;

    assert_eq!(report.processed, 3);
    assert_eq!(report.requeued, 2);
    assert_eq!(report.dropped, vec![queued.queue_id.unwrap()]);
    assert_eq!(script.calls(), 4);
    assert_eq!(h.ctx.queue_status().await.length, 0);
    assert_eq!(
        h.sleeper.sleeps(),
        vec![Duration::from_millis(200), Duration::from_millis(200)]
    );
}

#[tokio::test]
async fn drain_removes_item_after_second_attempt_succeeds() {
    let h = harness(false);
    let script: Arc<Script<()>> =
        Script::new(vec![Err(unknown_error()), Err(unknown_error()), Ok(())]);

    let queued = h
        .ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("save goals"))
        .await;

    h.ctx.set_online(true);
    let report = h.ctx.drain_offline_queue().await;

    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, vec![queued.queue_id.unwrap()]);
    assert!(report.dropped.is_empty());
    assert_eq!(script.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn cancelled_drain_keeps_queued_operation() {
    let h = harness(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let sync = Operation::from_fn(move || {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if call == 0 {
                return Err(network_error());
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    });

    let queued = h
        .ctx
        .execute_with_recovery(sync, OperationConfig::new("sync notes"))
        .await;
    assert!(queued.queued);

    h.ctx.set_online(true);
    let drained =
        tokio::time::timeout(Duration::from_secs(1), h.ctx.drain_offline_queue()).await;
    assert!(drained.is_err());

    let status = h.ctx.queue_status().await;
    assert_eq!(status.length, 1);
    assert!(!status.is_draining);
    assert_eq!(status.items[0].id, queued.queue_id.unwrap());

    let report = h.ctx.drain_offline_queue().await;
    assert_eq!(report.succeeded, vec![queued.queue_id.unwrap()]);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(h.ctx.queue_status().await.length, 0);
}

#[tokio::test]
async fn force_process_queue_requires_connectivity() {
    let h = harness(false);
    let script: Arc<Script<()>> = Script::new(vec![Err(network_error()), Ok(())]);
    h.ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("save"))
        .await;

    assert!(h.ctx.force_process_queue().await.is_none());
    assert_eq!(h.ctx.queue_status().await.length, 1);

    h.ctx.set_online(true);
    let report = h.ctx.force_process_queue().await.unwrap();
    assert_eq!(report.succeeded.len(), 1);
}

#[tokio::test]
async fn clear_offline_queue_returns_count() {
    let h = harness(false);
    for name in ["a", "b"] {
        let script: Arc<Script<()>> = Script::always_err(network_error());
        h.ctx
            .execute_with_recovery(scripted(&script), OperationConfig::new(name))
            .await;
    }

    let status = h.ctx.queue_status().await;
    assert_eq!(status.items[0].name, "a");
    assert_eq!(h.ctx.clear_offline_queue().await, 2);
    assert_eq!(h.ctx.queue_status().await.length, 0);
}

#[tokio::test]
async fn connectivity_restored_drains_queue() {
    let h = harness(false);
    h.ctx.start().await;

    let script: Arc<Script<()>> = Script::new(vec![Err(network_error()), Ok(())]);
    let result = h
        .ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("save"))
        .await;
    assert!(result.queued);

    h.ctx.set_online(true);
    wait_until(|| async { script.calls() == 2 && h.ctx.queue_status().await.length == 0 }).await;

    let restored = h.notifier.with_level(NotificationLevel::Success);
    assert_eq!(
        restored[0].message,
        "Connection restored - syncing queued operations"
    );
    assert_eq!(restored[0].duration, Duration::from_millis(2000));

    h.ctx.set_online(false);
    wait_until(|| async { !h.notifier.with_level(NotificationLevel::Warning).is_empty() }).await;
    let lost = h.notifier.with_level(NotificationLevel::Warning);
    assert_eq!(lost[0].message, "Connection lost - operations will be queued");
    assert_eq!(lost[0].duration, Duration::from_millis(3000));

    h.ctx.shutdown();
}

#[tokio::test]
async fn connection_lost_reported_during_drain() {
    let h = harness(false);
    h.ctx.start().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let hanging = Operation::from_fn(move || {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if call == 0 {
                return Err(network_error());
            }
            std::future::pending::<()>().await;
            Ok(())
        }
    });
    let queued = h
        .ctx
        .execute_with_recovery(hanging, OperationConfig::new("sync goals"))
        .await;
    assert!(queued.queued);

    h.ctx.set_online(true);
    wait_until(|| async { calls.load(Ordering::SeqCst) == 2 }).await;
    assert!(h.ctx.queue_status().await.is_draining);

    h.ctx.set_online(false);
    wait_until(|| async { !h.notifier.with_level(NotificationLevel::Warning).is_empty() }).await;
    assert!(h.ctx.queue_status().await.is_draining);

    h.ctx.shutdown();
    wait_until(|| async { !h.ctx.queue_status().await.is_draining }).await;
    assert_eq!(h.ctx.queue_status().await.length, 1);
}

#[tokio::test]
async fn shutdown_stops_listeners() {
    let h = harness(false);
    h.ctx.start().await;
    h.ctx.shutdown();

    let script: Arc<Script<()>> = Script::new(vec![Err(network_error()), Ok(())]);
    h.ctx
        .execute_with_recovery(scripted(&script), OperationConfig::new("save"))
        .await;

    h.ctx.set_online(true);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.ctx.queue_status().await.length, 1);
    assert!(h.notifier.with_level(NotificationLevel::Success).is_empty());
}

#[tokio::test]
async fn auth_events_update_cached_state() {
    let h = harness(true);
    h.ctx.start().await;

    h.backend.emit(AuthEvent::SignedIn(AuthUser::new("user-2")));
    wait_until(|| async { h.ctx.orchestrator().auth_state().await.is_signed_in() }).await;

    let result = h
        .ctx
        .execute_with_recovery(
            Operation::from_fn(|| async { Ok(()) }),
            OperationConfig::new("load").with_auth_required(true),
        )
        .await;
    assert!(result.success);
    assert_eq!(h.backend.user_lookups(), 0);

    h.backend.emit(AuthEvent::SignedOut);
    wait_until(|| async { !h.ctx.orchestrator().auth_state().await.is_signed_in() }).await;
}

#[tokio::test]
async fn failed_health_probe_is_logged_at_low_severity() {
    let h = harness(true);
    h.backend
        .push_select_reply(BackendResponse::err(BackendError::new("fetch failed")));

    let outcome = h.ctx.check_backend_health().await.unwrap();
    assert!(!outcome.is_ok());

    let logged = h.sink.in_category(HEALTH_CHECK_CATEGORY);
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].severity, Severity::Low);
    assert_eq!(logged[0].context["table"], "user_profiles");

    let report = h.ctx.health_report().await;
    assert_eq!(report.status, HealthStatus::Degraded);
    assert_eq!(report.total_checks, 1);
}

#[tokio::test(start_paused = true)]
async fn health_probe_runs_periodically_while_online() {
    let h = harness(true);
    h.ctx.start().await;

    tokio::time::sleep(Duration::from_secs(61)).await;
    let probes = h.backend.selects();
    assert_eq!(probes.len(), 2);
    assert_eq!(probes[0].table, "user_profiles");
    assert_eq!(probes[0].columns, "id");
    assert_eq!(probes[0].limit, 1);

    h.ctx.set_online(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.backend.selects().len(), 2);
}

#[tokio::test]
async fn builtin_error_log_collects_failures() {
    let ctx = ResilienceContext::builder()
        .with_backend(MockBackend::new().shared())
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .build()
        .unwrap();

    let script: Arc<Script<()>> = Script::always_err(validation_error());
    ctx.execute_with_recovery(scripted(&script), OperationConfig::new("insert"))
        .await;

    let report = ctx.error_log().unwrap().report();
    assert_eq!(report.total, 1);
    assert_eq!(report.by_category[UNRECOVERABLE_CATEGORY], 1);
    assert_eq!(report.by_severity[&Severity::High], 1);
}
