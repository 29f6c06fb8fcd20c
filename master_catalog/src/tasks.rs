//! Pending-task sets: fire-and-forget RPC work registered with its owning
//! entity so that leadership changes can abort it and deletion can wait for
//! it to drain.

use observability_deps::tracing::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Exponential backoff with jitter for retrying RPC tasks.
#[derive(Debug)]
pub struct RetryDelay {
    next_ms: u64,
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryDelay {
    const INIT_MS: u64 = 100;
    const MAX_MS: u64 = 30_000;

    /// Start from the initial delay.
    pub fn new() -> Self {
        Self {
            next_ms: Self::INIT_MS,
        }
    }

    /// The next delay to sleep for.
    pub fn next(&mut self) -> std::time::Duration {
        use rand::Rng;

        let base = self.next_ms;
        self.next_ms = (self.next_ms * 2).min(Self::MAX_MS);
        // Jitter between half and the full delay keeps retries from herding.
        let jittered = rand::thread_rng().gen_range(base / 2..=base);
        std::time::Duration::from_millis(jittered)
    }
}

#[derive(Debug)]
struct TaskHandle {
    description: String,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct TaskSetInner {
    tasks: HashMap<u64, TaskHandle>,
}

/// A set of in-flight background tasks owned by one entity.
///
/// Tasks are tokio futures wrapped with a cancellation token. `abort_all`
/// flips every task to a no-op on its next suspension point;
/// `wait_completion` joins the whole set.
#[derive(Debug, Default)]
pub struct TaskSet {
    inner: Arc<Mutex<TaskSetInner>>,
    next_id: AtomicU64,
    drained: Arc<Notify>,
}

impl TaskSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `run` as a tracked task. The closure receives the cancellation
    /// token it must observe at its own suspension points; the wrapper also
    /// races the whole future against cancellation.
    pub fn spawn<F, Fut>(&self, description: impl Into<String>, run: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let description = description.into();
        let cancel = CancellationToken::new();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner.lock().tasks.insert(
            id,
            TaskHandle {
                description: description.clone(),
                cancel: cancel.clone(),
            },
        );

        let fut = run(cancel.clone());
        let inner = Arc::clone(&self.inner);
        let drained = Arc::clone(&self.drained);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(task=%description, "task aborted");
                }
                _ = fut => {}
            }
            let mut guard = inner.lock();
            guard.tasks.remove(&id);
            if guard.tasks.is_empty() {
                drained.notify_waiters();
            }
        });
    }

    /// Number of in-flight tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().tasks.len()
    }

    /// Whether any task is in flight.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().tasks.is_empty()
    }

    /// Signal every task to abort. Does not wait.
    pub fn abort_all(&self) {
        // Collect tokens first: cancelling while holding the lock would race
        // with task completion, which takes the same lock.
        let tokens: Vec<_> = self
            .inner
            .lock()
            .tasks
            .values()
            .map(|t| t.cancel.clone())
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    /// Wait until the set is empty.
    pub async fn wait_completion(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Descriptions of the in-flight tasks, for diagnostics.
    pub fn descriptions(&self) -> Vec<String> {
        self.inner
            .lock()
            .tasks
            .values()
            .map(|t| t.description.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_deregister_on_completion() {
        let set = TaskSet::new();
        let (tx, rx) = tokio::sync::oneshot::channel();

        set.spawn("wait for signal", |_cancel| async move {
            rx.await.ok();
        });
        assert_eq!(set.len(), 1);

        tx.send(()).unwrap();
        set.wait_completion().await;
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn abort_drains_stuck_tasks() {
        let set = TaskSet::new();
        for i in 0..3 {
            set.spawn(format!("stuck {i}"), |_cancel| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            });
        }
        assert_eq!(set.len(), 3);

        set.abort_all();
        tokio::time::timeout(Duration::from_secs(5), set.wait_completion())
            .await
            .expect("aborted tasks must drain");
    }

    #[tokio::test]
    async fn wait_completion_on_empty_set_returns_immediately() {
        let set = TaskSet::new();
        set.wait_completion().await;
    }
}
