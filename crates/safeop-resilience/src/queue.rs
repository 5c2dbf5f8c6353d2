//! In-memory offline queue
//!
//! Operations that failed while the process was offline are parked here and
//! replayed in enqueue order once connectivity returns. The queue is not
//! persisted; anything still queued when the process exits is lost.

use crate::config::ResilienceConfig;
use crate::connectivity::Connectivity;
use crate::executor::Operation;
use crate::orchestrator::OperationConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use safeop_traits::Sleeper;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// A deferred operation waiting for connectivity
#[derive(Debug, Clone)]
pub struct QueueItem {
    /// Unique per enqueue
    pub id: Uuid,
    /// Work to replay
    pub operation: Operation<()>,
    /// Config the operation was originally run with
    pub config: OperationConfig<()>,
    /// When the item was queued
    pub enqueued_at: DateTime<Utc>,
    /// Replays attempted so far
    pub attempts: u32,
}

/// Replays a queued operation
#[async_trait]
pub trait Replay: Send + Sync {
    /// Runs `operation` once more under `config`. Returns whether it succeeded.
    async fn replay(&self, operation: &Operation<()>, config: &OperationConfig<()>) -> bool;
}

/// Limits applied while draining
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSettings {
    /// Replays allowed per item before it is dropped
    pub max_attempts: u32,
    /// Pause between items
    pub spacing: Duration,
    /// Deadline for each replay
    pub replay_timeout: Duration,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

impl DrainSettings {
    /// Settings taken from the layer config
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.queue_max_attempts,
            spacing: config.queue_spacing(),
            replay_timeout: config.queued_operation_timeout(),
        }
    }
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// The pass did not run because another drain held the guard
    pub skipped: bool,
    /// Replays attempted
    pub processed: usize,
    /// Items that replayed successfully and left the queue
    pub succeeded: Vec<Uuid>,
    /// Items put back at the tail for another attempt
    pub requeued: usize,
    /// Items dropped after exhausting their attempts
    pub dropped: Vec<Uuid>,
}

/// Snapshot of one queued item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedOperation {
    /// Item id
    pub id: Uuid,
    /// Operation name
    pub name: String,
    /// Replays attempted so far
    pub attempts: u32,
    /// When it was queued
    pub enqueued_at: DateTime<Utc>,
}

/// Snapshot of the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Items waiting
    pub length: usize,
    /// Whether a drain is running
    pub is_draining: bool,
    /// Connectivity at the time of the snapshot
    pub is_online: bool,
    /// Waiting items in replay order
    pub items: Vec<QueuedOperation>,
}

/// Releases the drain flag when dropped
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// FIFO of deferred operations with a single active drain
#[derive(Debug, Default)]
pub struct OfflineQueue {
    items: Mutex<VecDeque<QueueItem>>,
    draining: AtomicBool,
}

impl OfflineQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an operation and returns its queue id
    pub async fn enqueue(&self, operation: Operation<()>, config: OperationConfig<()>) -> Uuid {
        let item = QueueItem {
            id: Uuid::new_v4(),
            operation,
            config,
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        let id = item.id;
        let name = item.config.name.clone();

        let mut items = self.items.lock().await;
        items.push_back(item);
        tracing::info!(
            operation = %name,
            queue_id = %id,
            queue_len = items.len(),
            "Queued operation for offline processing"
        );
        id
    }

    /// Number of waiting items
    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Whether nothing is waiting
    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }

    /// Whether a drain is running
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Snapshot of the queue
    pub async fn status(&self, connectivity: &Connectivity) -> QueueStatus {
        let items = self.items.lock().await;
        QueueStatus {
            length: items.len(),
            is_draining: self.is_draining(),
            is_online: connectivity.is_online(),
            items: items
                .iter()
                .map(|item| QueuedOperation {
                    id: item.id,
                    name: item.config.name.clone(),
                    attempts: item.attempts,
                    enqueued_at: item.enqueued_at,
                })
                .collect(),
        }
    }

    /// Drops every waiting item and returns how many were removed
    pub async fn clear(&self) -> usize {
        let mut items = self.items.lock().await;
        let count = items.len();
        items.clear();
        tracing::info!(count, "Cleared queued operations");
        count
    }

    /// Replays waiting items in order while online.
    ///
    /// Returns immediately with `skipped` set when another drain is running.
    /// A failed replay goes back to the tail until it has used
    /// `max_attempts`, after which it is dropped. Cancelling the drain leaves
    /// the in-flight item queued with its attempt count unchanged.
    pub async fn drain(
        &self,
        replayer: &dyn Replay,
        connectivity: &Connectivity,
        sleeper: &dyn Sleeper,
        settings: DrainSettings,
    ) -> DrainReport {
        let Some(_guard) = DrainGuard::acquire(&self.draining) else {
            tracing::debug!("Queue drain already in progress");
            return DrainReport {
                skipped: true,
                ..Default::default()
            };
        };

        let mut report = DrainReport::default();
        let pending = self.len().await;
        if pending == 0 {
            return report;
        }
        tracing::info!(pending, "Processing queued operations");

        while connectivity.is_online() {
            // The item stays queued until its replay settles, so a cancelled
            // drain leaves it in place.
            let Some(mut item) = self.items.lock().await.front().cloned() else {
                break;
            };

            item.attempts += 1;
            report.processed += 1;

            let config = item
                .config
                .clone()
                .with_timeout(settings.replay_timeout)
                .with_offline_queue(false);

            let succeeded = replayer.replay(&item.operation, &config).await;
            self.settle(item, succeeded, settings.max_attempts, &mut report)
                .await;

            if self.is_empty().await {
                break;
            }
            sleeper.sleep(settings.spacing).await;
        }

        tracing::info!(
            succeeded = report.succeeded.len(),
            processed = report.processed,
            dropped = report.dropped.len(),
            "Queue processing complete"
        );
        report
    }

    /// Removes a replayed item and requeues or drops it by outcome
    async fn settle(
        &self,
        item: QueueItem,
        succeeded: bool,
        max_attempts: u32,
        report: &mut DrainReport,
    ) {
        let mut items = self.items.lock().await;
        let Some(position) = items.iter().position(|queued| queued.id == item.id) else {
            tracing::debug!(queue_id = %item.id, "Queued operation cleared during replay");
            return;
        };
        items.remove(position);

        if succeeded {
            tracing::info!(operation = %item.config.name, queue_id = %item.id, "Processed queued operation");
            report.succeeded.push(item.id);
        } else if item.attempts < max_attempts {
            tracing::warn!(
                operation = %item.config.name,
                queue_id = %item.id,
                attempt = item.attempts,
                "Requeued failed operation"
            );
            report.requeued += 1;
            items.push_back(item);
        } else {
            tracing::error!(
                operation = %item.config.name,
                queue_id = %item.id,
                attempts = item.attempts,
                "Dropping queued operation after repeated failures"
            );
            report.dropped.push(item.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    /// Replays by looking up a scripted outcome per operation name
    #[derive(Default)]
    struct ScriptedReplay {
        outcomes: StdMutex<HashMap<String, VecDeque<bool>>>,
        seen: StdMutex<Vec<(String, Duration, bool)>>,
    }

    impl ScriptedReplay {
        fn script(self, name: &str, outcomes: &[bool]) -> Self {
            self.outcomes
                .lock()
                .unwrap()
                .insert(name.to_string(), outcomes.iter().copied().collect());
            self
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|s| s.0.clone()).collect()
        }
    }

    #[async_trait]
    impl Replay for ScriptedReplay {
        async fn replay(&self, _operation: &Operation<()>, config: &OperationConfig<()>) -> bool {
            self.seen.lock().unwrap().push((
                config.name.clone(),
                config.timeout,
                config.enable_offline_queue,
            ));
            self.outcomes
                .lock()
                .unwrap()
                .get_mut(&config.name)
                .and_then(|o| o.pop_front())
                .unwrap_or(true)
        }
    }

    struct NoSleep;

    #[async_trait]
    impl Sleeper for NoSleep {
        async fn sleep(&self, _duration: Duration) {}
    }

    fn noop() -> Operation<()> {
        Operation::from_fn(|| async { Ok(()) })
    }

    async fn enqueue(queue: &OfflineQueue, name: &str) -> Uuid {
        queue.enqueue(noop(), OperationConfig::new(name)).await
    }

    #[tokio::test]
    async fn test_enqueue_and_status() {
        let queue = OfflineQueue::new();
        let a = enqueue(&queue, "save notes").await;
        let b = enqueue(&queue, "save goals").await;
        assert_ne!(a, b);

        let status = queue.status(&Connectivity::new(false)).await;
        assert_eq!(status.length, 2);
        assert!(!status.is_online);
        assert!(!status.is_draining);
        assert_eq!(status.items[0].name, "save notes");
        assert_eq!(status.items[1].attempts, 0);
    }

    #[tokio::test]
    async fn test_drain_fifo_with_replay_overrides() {
        let queue = OfflineQueue::new();
        enqueue(&queue, "first").await;
        enqueue(&queue, "second").await;

        let replay = ScriptedReplay::default();
        let report = queue
            .drain(&replay, &Connectivity::online(), &NoSleep, DrainSettings::default())
            .await;

        assert_eq!(replay.seen(), vec!["first", "second"]);
        assert_eq!(report.succeeded.len(), 2);
        assert!(queue.is_empty().await);

        for (_, timeout, offline_queue) in replay.seen.lock().unwrap().iter() {
            assert_eq!(*timeout, Duration::from_secs(30));
            assert!(!offline_queue);
        }
    }

    #[tokio::test]
    async fn test_drop_after_three_failures() {
        let queue = OfflineQueue::new();
        let id = enqueue(&queue, "flaky").await;

        let replay = ScriptedReplay::default().script("flaky", &[false, false, false, true]);
        let report = queue
            .drain(&replay, &Connectivity::online(), &NoSleep, DrainSettings::default())
            .await;

        assert_eq!(report.processed, 3);
        assert_eq!(report.requeued, 2);
        assert_eq!(report.dropped, vec![id]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_success_on_second_attempt() {
        let queue = OfflineQueue::new();
        let id = enqueue(&queue, "retry once").await;

        let replay = ScriptedReplay::default().script("retry once", &[false, true, false]);
        let report = queue
            .drain(&replay, &Connectivity::online(), &NoSleep, DrainSettings::default())
            .await;

        assert_eq!(report.processed, 2);
        assert_eq!(report.succeeded, vec![id]);
        assert!(report.dropped.is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_failed_item_goes_to_tail() {
        let queue = OfflineQueue::new();
        enqueue(&queue, "a").await;
        enqueue(&queue, "b").await;

        let replay = ScriptedReplay::default().script("a", &[false, true]);
        queue
            .drain(&replay, &Connectivity::online(), &NoSleep, DrainSettings::default())
            .await;

        assert_eq!(replay.seen(), vec!["a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_drain_noop_when_offline() {
        let queue = OfflineQueue::new();
        enqueue(&queue, "later").await;

        let replay = ScriptedReplay::default();
        let report = queue
            .drain(&replay, &Connectivity::new(false), &NoSleep, DrainSettings::default())
            .await;

        assert_eq!(report.processed, 0);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_drain_skipped_while_draining() {
        let queue = OfflineQueue::new();
        enqueue(&queue, "x").await;

        let _held = DrainGuard::acquire(&queue.draining).unwrap();
        assert!(queue.is_draining());

        let report = queue
            .drain(
                &ScriptedReplay::default(),
                &Connectivity::online(),
                &NoSleep,
                DrainSettings::default(),
            )
            .await;
        assert!(report.skipped);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_guard_released_after_drain() {
        let queue = OfflineQueue::new();
        queue
            .drain(
                &ScriptedReplay::default(),
                &Connectivity::online(),
                &NoSleep,
                DrainSettings::default(),
            )
            .await;
        assert!(!queue.is_draining());
    }

    /// Replay that never finishes
    struct StuckReplay;

    #[async_trait]
    impl Replay for StuckReplay {
        async fn replay(&self, _operation: &Operation<()>, _config: &OperationConfig<()>) -> bool {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_drain_keeps_item() {
        let queue = OfflineQueue::new();
        let id = enqueue(&queue, "slow sync").await;

        let drained = tokio::time::timeout(
            Duration::from_secs(1),
            queue.drain(&StuckReplay, &Connectivity::online(), &NoSleep, DrainSettings::default()),
        )
        .await;
        assert!(drained.is_err());
        assert!(!queue.is_draining());

        let status = queue.status(&Connectivity::online()).await;
        assert_eq!(status.length, 1);
        assert_eq!(status.items[0].id, id);
        assert_eq!(status.items[0].attempts, 0);

        let report = queue
            .drain(
                &ScriptedReplay::default(),
                &Connectivity::online(),
                &NoSleep,
                DrainSettings::default(),
            )
            .await;
        assert_eq!(report.succeeded, vec![id]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear_during_replay_is_not_requeued() {
        struct ClearingReplay<'a>(&'a OfflineQueue);

        #[async_trait]
        impl<'a> Replay for ClearingReplay<'a> {
            async fn replay(&self, _operation: &Operation<()>, _config: &OperationConfig<()>) -> bool {
                self.0.clear().await;
                false
            }
        }

        let queue = OfflineQueue::new();
        enqueue(&queue, "doomed").await;

        let report = queue
            .drain(
                &ClearingReplay(&queue),
                &Connectivity::online(),
                &NoSleep,
                DrainSettings::default(),
            )
            .await;
        assert_eq!(report.processed, 1);
        assert_eq!(report.requeued, 0);
        assert!(report.dropped.is_empty());
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear() {
        let queue = OfflineQueue::new();
        enqueue(&queue, "a").await;
        enqueue(&queue, "b").await;
        assert_eq!(queue.clear().await, 2);
        assert!(queue.is_empty().await);
    }
}
