//! Bounded-parallelism admission gate with a priority queue.
//!
//! `submit` admits an operation immediately while fewer than `max_concurrent`
//! are running; otherwise it waits in one of three FIFO tiers. When a running
//! operation finishes, the oldest waiter of the highest non-empty tier starts.
//! Each submitter gets exactly one result back through a oneshot channel.
//! Running operations are never preempted; only queued ones can be withdrawn.
//!
//! No aging: under sustained high-priority load, low-priority work can wait
//! indefinitely.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::Priority;
use crate::telemetry::metrics;

/// Identifier handed out at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct OperationId(pub u64);

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Who an operation runs for. Carried for logs and metrics only.
#[derive(Debug, Clone)]
pub struct OperationMeta {
    pub priority: Priority,
    pub user_id: String,
    pub model_id: String,
}

impl OperationMeta {
    pub fn new(priority: Priority, user_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            priority,
            user_id: user_id.into(),
            model_id: model_id.into(),
        }
    }
}

/// Read-only snapshot of controller counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ConcurrencyStats {
    pub active: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub avg_processing_time_ms: f64,
}

/// A waiting operation. The start signal is the only thing the queue owns;
/// the work itself sits in its driver task until the signal fires.
struct QueuedOperation {
    id: OperationId,
    meta: OperationMeta,
    enqueued_at: DateTime<Utc>,
    start: oneshot::Sender<()>,
}

struct State {
    next_id: u64,
    active: usize,
    tiers: [VecDeque<QueuedOperation>; 3],
    completed: u64,
    failed: u64,
    total_processing_ms: f64,
}

impl State {
    fn queued(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<QueuedOperation> {
        Priority::ORDER
            .iter()
            .find_map(|p| self.tiers[p.index()].pop_front())
    }
}

struct Inner {
    max_concurrent: usize,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record a finished operation and hand its slot to the next waiter.
    fn finish(&self, ok: bool, elapsed_ms: f64) {
        let mut state = self.lock();
        if ok {
            state.completed += 1;
        } else {
            state.failed += 1;
        }
        state.total_processing_ms += elapsed_ms;
        state.active = state.active.saturating_sub(1);

        while state.active < self.max_concurrent {
            let Some(next) = state.pop_next() else {
                break;
            };
            // A closed receiver means the submitter's task is gone; skip it.
            if next.start.send(()).is_ok() {
                state.active += 1;
                let waited_ms = (Utc::now() - next.enqueued_at).num_milliseconds().max(0);
                metrics::queue_wait_ms().record(
                    waited_ms as f64,
                    &[KeyValue::new("priority", next.meta.priority.to_string())],
                );
                debug!(
                    id = %next.id,
                    priority = %next.meta.priority,
                    user_id = %next.meta.user_id,
                    model = %next.meta.model_id,
                    waited_ms,
                    "operation admitted from queue"
                );
            }
        }
    }
}

/// One held admission slot. Dropping it gives the slot back, including when
/// the operation unwinds.
struct Slot {
    inner: Arc<Inner>,
    id: OperationId,
    started: Instant,
    ok: bool,
}

impl Drop for Slot {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!(id = %self.id, "operation panicked; releasing its slot");
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1_000.0;
        self.inner.finish(self.ok, elapsed_ms);
    }
}

/// Handle for one submitted operation.
pub struct Ticket<T> {
    id: OperationId,
    result: oneshot::Receiver<Result<T>>,
}

impl<T> Ticket<T> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Wait for the operation's result (or its withdrawal).
    pub async fn wait(self) -> Result<T> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => Err(Error::Other(format!(
                "operation {} ended without a result",
                self.id
            ))),
        }
    }
}

#[derive(Clone)]
pub struct ConcurrencyController {
    inner: Arc<Inner>,
}

impl ConcurrencyController {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(State {
                    next_id: 0,
                    active: 0,
                    tiers: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    completed: 0,
                    failed: 0,
                    total_processing_ms: 0.0,
                }),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Submit an operation. Admission is decided before this returns, so
    /// submission order is queue order. Must be called inside a Tokio runtime.
    pub fn submit<F, T>(&self, meta: OperationMeta, operation: F) -> Ticket<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (start_tx, start_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        let id = {
            let mut state = self.inner.lock();
            let id = OperationId(state.next_id);
            state.next_id += 1;

            if state.active < self.inner.max_concurrent {
                state.active += 1;
                let _ = start_tx.send(());
                debug!(%id, priority = %meta.priority, "operation admitted");
            } else {
                debug!(
                    %id,
                    priority = %meta.priority,
                    queued = state.queued() + 1,
                    "operation queued"
                );
                state.tiers[meta.priority.index()].push_back(QueuedOperation {
                    id,
                    meta: meta.clone(),
                    enqueued_at: Utc::now(),
                    start: start_tx,
                });
            }
            id
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if start_rx.await.is_err() {
                // Withdrawn from the queue before it started.
                let _ = result_tx.send(Err(Error::Cancelled(id)));
                return;
            }

            let mut slot = Slot {
                inner,
                id,
                started: Instant::now(),
                ok: false,
            };
            let result = operation.await;
            let ok = result.is_ok();
            slot.ok = ok;
            drop(slot);

            metrics::operations_finished().add(
                1,
                &[
                    KeyValue::new("model", meta.model_id.clone()),
                    KeyValue::new("result", if ok { "ok" } else { "error" }),
                ],
            );
            if result_tx.send(result).is_err() {
                warn!(%id, "submitter dropped its ticket before the result arrived");
            }
        });

        Ticket {
            id,
            result: result_rx,
        }
    }

    /// Withdraw a queued operation. Returns false if it already started
    /// (or finished); running work is never interrupted.
    pub fn cancel(&self, id: OperationId) -> bool {
        let mut state = self.inner.lock();
        for tier in state.tiers.iter_mut() {
            if let Some(pos) = tier.iter().position(|op| op.id == id) {
                // Dropping the start sender resolves the ticket as cancelled.
                tier.remove(pos);
                debug!(%id, "queued operation withdrawn");
                return true;
            }
        }
        false
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let state = self.inner.lock();
        let finished = state.completed + state.failed;
        ConcurrencyStats {
            active: state.active,
            queued: state.queued(),
            completed: state.completed,
            failed: state.failed,
            avg_processing_time_ms: if finished == 0 {
                0.0
            } else {
                state.total_processing_ms / finished as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn meta(priority: Priority) -> OperationMeta {
        OperationMeta::new(priority, "u1", "m")
    }

    #[tokio::test]
    async fn admission_bound_holds_until_first_completes() {
        let controller = ConcurrencyController::new(2);
        let gate = Arc::new(Notify::new());

        let tickets: Vec<_> = (0..3)
            .map(|i| {
                let gate = Arc::clone(&gate);
                controller.submit(meta(Priority::Medium), async move {
                    gate.notified().await;
                    Ok(i)
                })
            })
            .collect();

        let stats = controller.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.queued, 1);

        // Let the spawned tasks register on the gate, then release them one at a time.
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = controller.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.queued, 0);

        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_waiters();

        let mut results = Vec::new();
        for t in tickets {
            results.push(t.wait().await.unwrap());
        }
        results.sort();
        assert_eq!(results, vec![0, 1, 2]);
        assert_eq!(controller.stats().completed, 3);
    }

    #[tokio::test]
    async fn dequeues_in_priority_order_then_fifo() {
        let controller = ConcurrencyController::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = controller.submit(meta(Priority::High), async move {
            let _ = release_rx.await;
            Ok("blocker")
        });

        let mut tickets = Vec::new();
        for (name, priority) in [
            ("A", Priority::Low),
            ("B", Priority::High),
            ("C", Priority::Medium),
            ("D", Priority::High),
        ] {
            let order = Arc::clone(&order);
            tickets.push(controller.submit(meta(priority), async move {
                order.lock().unwrap().push(name);
                Ok(name)
            }));
        }
        assert_eq!(controller.stats().queued, 4);

        release_tx.send(()).unwrap();
        blocker.wait().await.unwrap();
        for t in tickets {
            t.wait().await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["B", "D", "C", "A"]);
    }

    #[tokio::test]
    async fn failures_are_counted_and_delivered() {
        let controller = ConcurrencyController::new(2);
        let ok = controller.submit(meta(Priority::Low), async { Ok(1) });
        let bad = controller.submit(meta(Priority::Low), async {
            Err::<i32, _>(Error::provider("boom"))
        });

        assert_eq!(ok.wait().await.unwrap(), 1);
        assert!(matches!(bad.wait().await, Err(Error::Provider { .. })));

        let stats = controller.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.active, 0);
    }

    fn explode() -> Result<i32> {
        panic!("operation exploded")
    }

    #[tokio::test]
    async fn panicking_operation_releases_its_slot() {
        let controller = ConcurrencyController::new(1);
        let crashed = controller.submit(meta(Priority::Medium), async { explode() });
        let next = controller.submit(meta(Priority::Medium), async { Ok(2) });

        assert!(matches!(crashed.wait().await, Err(Error::Other(_))));
        let value = tokio::time::timeout(Duration::from_millis(500), next.wait())
            .await
            .expect("queued work must start after a panic")
            .unwrap();
        assert_eq!(value, 2);

        let stats = controller.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn queued_operation_can_be_withdrawn() {
        let controller = ConcurrencyController::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let running = controller.submit(meta(Priority::High), async move {
            let _ = release_rx.await;
            Ok(())
        });
        let queued = controller.submit(meta(Priority::Low), async { Ok(()) });
        let queued_id = queued.id();

        assert!(controller.cancel(queued_id));
        assert!(!controller.cancel(running.id()));
        assert!(matches!(queued.wait().await, Err(Error::Cancelled(id)) if id == queued_id));

        release_tx.send(()).unwrap();
        running.wait().await.unwrap();
        let stats = controller.stats();
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn average_processing_time_tracks_finished_work() {
        let controller = ConcurrencyController::new(4);
        let t = controller.submit(meta(Priority::Medium), async {
            tokio::time::sleep(Duration::from_millis(15)).await;
            Ok(())
        });
        t.wait().await.unwrap();
        assert!(controller.stats().avg_processing_time_ms >= 10.0);
    }
}
