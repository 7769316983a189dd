//! Worker pool for message processing tasks.
//!
//! Every dispatched message runs as its own tokio task so a slow processor
//! never holds up the broker. The pool only tracks the tasks so that the
//! container can interrupt them and wait for them to finish on shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

struct PoolInner {
    name: String,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, AbortHandle>>,
    idle: Notify,
}

impl PoolInner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a task from the pool when its future is dropped, whether it
/// completed, panicked or was aborted.
struct TaskGuard {
    inner: Arc<PoolInner>,
    id: u64,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut tasks = self.inner.tasks();
        tasks.remove(&self.id);
        if tasks.is_empty() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Tracked set of spawned processing tasks. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                next_id: AtomicU64::new(0),
                tasks: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawn `future` onto the runtime and track it until it finishes.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = TaskGuard {
            inner: Arc::clone(&self.inner),
            id,
        };

        // Held across spawn + insert so the guard cannot remove the entry first.
        let mut tasks = self.inner.tasks();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            future.await;
        });
        tasks.insert(id, handle.abort_handle());
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.inner.tasks().len()
    }

    /// Abort every running task.
    pub fn abort_all(&self) {
        let handles: Vec<AbortHandle> = self.inner.tasks().values().cloned().collect();
        debug!(pool = %self.inner.name, count = handles.len(), "Aborting worker tasks");
        for handle in handles {
            handle.abort();
        }
    }

    /// Wait until no tasks are running.
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop the pool: abort running tasks first when `interrupt` is set, then
    /// wait up to `timeout` for it to drain. Returns `true` if it drained.
    pub async fn shutdown(&self, interrupt: bool, timeout: Duration) -> bool {
        let active = self.active();
        info!(pool = %self.inner.name, active, interrupt, "Shutting down worker pool");

        if interrupt {
            self.abort_all();
        }

        match tokio::time::timeout(timeout, self.wait_idle()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pool = %self.inner.name,
                    remaining = self.active(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker pool did not drain before timeout"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_tracks_and_releases_tasks() {
        let pool = WorkerPool::new("test-pool");
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        pool.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(pool.active(), 1);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), pool.wait_idle())
            .await
            .expect("pool should become idle");
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_tasks() {
        let pool = WorkerPool::new("test-pool");
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let completed = completed.clone();
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                completed.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert!(pool.shutdown(false, Duration::from_secs(5)).await);
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_shutdown_with_interrupt_aborts_tasks() {
        let pool = WorkerPool::new("test-pool");
        let completed = Arc::new(AtomicUsize::new(0));

        let counter = completed.clone();
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pool.shutdown(true, Duration::from_secs(5)).await);
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.active(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_times_out() {
        let pool = WorkerPool::new("test-pool");
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        assert!(!pool.shutdown(false, Duration::from_millis(20)).await);
        assert_eq!(pool.active(), 1);
        pool.abort_all();
    }
}
