//! Bounded worker pool
//!
//! One pool per service instance. Concurrency is capped by a semaphore, a
//! small queue absorbs bursts, and once both are full the submitting task
//! runs the work itself (caller-runs backpressure). Shutdown joins in-flight
//! work with a bounded timeout and aborts whatever is left.
//!
//! The streaming supervision loop occupies exactly one worker for the
//! lifetime of a `start()`; the pool exists to keep the caller's own task
//! unblocked, not for parallel decode.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Live occupancy counters, shared with status snapshots.
#[derive(Debug, Default)]
pub struct WorkerStats {
    active: AtomicU64,
    completed: AtomicU64,
    queued: AtomicU64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStatsSnapshot {
    pub active: u64,
    pub completed: u64,
    pub queued: u64,
}

/// Semaphore-bounded task pool.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    queue_limit: usize,
    stats: Arc<WorkerStats>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Pool with `max_workers` concurrent tasks and a queue of the same size.
    pub fn new(max_workers: usize) -> Self {
        Self::with_limits(max_workers, max_workers)
    }

    pub fn with_limits(max_workers: usize, queue_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            queue_limit,
            stats: Arc::new(WorkerStats::default()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Submit work. Runs on a pool worker when one is free, waits in the
    /// queue when all workers are busy, and runs inline on the caller once
    /// the queue is full as well.
    pub async fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        // Fast path: a worker slot is free right now.
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            let stats = Arc::clone(&self.stats);
            stats.active.fetch_add(1, Ordering::Relaxed);
            let handle = tokio::spawn(async move {
                fut.await;
                drop(permit);
                stats.active.fetch_sub(1, Ordering::Relaxed);
                stats.completed.fetch_add(1, Ordering::Relaxed);
            });
            self.register(handle).await;
            return;
        }

        // Queue path: park the task until a worker frees up.
        if (self.stats.queued.load(Ordering::Relaxed) as usize) < self.queue_limit {
            let stats = Arc::clone(&self.stats);
            let semaphore = Arc::clone(&self.semaphore);
            stats.queued.fetch_add(1, Ordering::Relaxed);
            let handle = tokio::spawn(async move {
                let permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        stats.queued.fetch_sub(1, Ordering::Relaxed);
                        return;
                    }
                };
                stats.queued.fetch_sub(1, Ordering::Relaxed);
                stats.active.fetch_add(1, Ordering::Relaxed);
                fut.await;
                drop(permit);
                stats.active.fetch_sub(1, Ordering::Relaxed);
                stats.completed.fetch_add(1, Ordering::Relaxed);
            });
            self.register(handle).await;
            return;
        }

        // Saturated: the caller runs the work itself.
        debug!("worker pool saturated, running task on caller");
        self.stats.active.fetch_add(1, Ordering::Relaxed);
        fut.await;
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
    }

    async fn register(&self, handle: JoinHandle<()>) {
        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    /// Wait up to `timeout` for in-flight work, then abort the rest.
    /// Returns `false` when the timeout was hit.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().await;
            guard.drain(..).collect()
        };
        if handles.is_empty() {
            return true;
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let join_all = futures::future::join_all(handles);

        match tokio::time::timeout(timeout, join_all).await {
            Ok(_) => true,
            Err(_) => {
                warn!(
                    timeout_secs = timeout.as_secs_f64(),
                    "worker pool shutdown timed out, aborting remaining tasks"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::{oneshot, Notify};

    #[tokio::test]
    async fn test_spawn_runs_task() {
        let pool = WorkerPool::new(2);
        let (tx, rx) = oneshot::channel();

        pool.spawn(async move {
            let _ = tx.send(42u32);
        })
        .await;

        assert_eq!(rx.await.unwrap(), 42);
        assert!(pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(pool.stats().snapshot().completed, 1);
        assert_eq!(pool.stats().snapshot().active, 0);
    }

    #[tokio::test]
    async fn test_caller_runs_when_saturated() {
        let pool = WorkerPool::with_limits(1, 0);
        let gate = Arc::new(Notify::new());
        let (started_tx, started_rx) = oneshot::channel();

        let blocker_gate = Arc::clone(&gate);
        pool.spawn(async move {
            let _ = started_tx.send(());
            blocker_gate.notified().await;
        })
        .await;
        started_rx.await.unwrap();

        // Pool and queue are both full now, so this runs inline.
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        pool.spawn(async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await;
        assert!(ran.load(Ordering::SeqCst));

        gate.notify_one();
        assert!(pool.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_queued_task_runs_after_worker_frees() {
        let pool = WorkerPool::with_limits(1, 4);
        let gate = Arc::new(Notify::new());
        let (started_tx, started_rx) = oneshot::channel();

        let blocker_gate = Arc::clone(&gate);
        pool.spawn(async move {
            let _ = started_tx.send(());
            blocker_gate.notified().await;
        })
        .await;
        started_rx.await.unwrap();

        let (tx, rx) = oneshot::channel();
        pool.spawn(async move {
            let _ = tx.send(());
        })
        .await;
        assert_eq!(pool.stats().snapshot().queued, 1);

        gate.notify_one();
        rx.await.unwrap();
        assert!(pool.shutdown(Duration::from_secs(1)).await);

        let stats = pool.stats().snapshot();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_task() {
        let pool = WorkerPool::new(1);
        let gate = Arc::new(Notify::new());

        let stuck_gate = Arc::clone(&gate);
        pool.spawn(async move {
            stuck_gate.notified().await;
        })
        .await;

        assert!(!pool.shutdown(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_shutdown_on_empty_pool() {
        let pool = WorkerPool::new(2);
        assert!(pool.shutdown(Duration::from_millis(10)).await);
    }
}
