//! The background task loop: a single worker that periodically drives tablet
//! assignment, tears down replicas of deleted tablets, and gives the load
//! balancer a turn when there is nothing else to do.

use crate::catalog::CatalogManager;
use observability_deps::tracing::{error, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Monitor and worker handle for the background loop. Wake-ups are
/// edge-triggered on the pending-updates flag, with a bounded timer as the
/// fallback.
#[derive(Debug)]
pub(crate) struct BackgroundTasks {
    pending_updates: Mutex<bool>,
    notify: Notify,
    shutdown: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundTasks {
    /// Spawn the worker. It holds only a weak reference to the manager and
    /// exits when the manager goes away or `shutdown` is called.
    pub(crate) fn start(catalog: Weak<CatalogManager>, wait: Duration) -> Arc<Self> {
        let this = Arc::new(Self {
            pending_updates: Mutex::new(false),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        });

        let worker = Arc::clone(&this);
        let handle = tokio::spawn(async move {
            worker.run(catalog, wait).await;
        });
        *this.handle.lock() = Some(handle);
        this
    }

    /// Record pending work and wake the worker.
    pub(crate) fn wake(&self) {
        *self.pending_updates.lock() = true;
        self.notify.notify_one();
    }

    /// Wake the worker only if work was recorded since its last pass.
    pub(crate) fn wake_if_has_pending_updates(&self) {
        if *self.pending_updates.lock() {
            self.notify.notify_one();
        }
    }

    /// Stop the worker and join it.
    pub(crate) async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.notify.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task worker panicked");
            }
        }
        info!("catalog manager background tasks shut down");
    }

    async fn run(self: Arc<Self>, catalog: Weak<CatalogManager>, wait: Duration) {
        while !self.shutdown.is_cancelled() {
            let Some(catalog) = catalog.upgrade() else {
                break;
            };
            catalog.run_background_pass().await;
            drop(catalog);

            self.wait_for_updates(wait).await;
        }
        info!("catalog manager background task worker shutting down");
    }

    async fn wait_for_updates(&self, wait: Duration) {
        {
            let mut pending = self.pending_updates.lock();
            if *pending {
                *pending = false;
                return;
            }
        }
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            _ = self.shutdown.cancelled() => {}
        }
        *self.pending_updates.lock() = false;
    }
}

impl CatalogManager {
    /// One pass of the background loop: report metrics, tear down replicas of
    /// deleted tablets, process pending assignments, or give the balancer a
    /// turn. Public so tests can drive passes deterministically.
    pub async fn run_background_pass(&self) {
        let guard = match self.leader_shared_lock() {
            Ok(guard) => guard,
            Err(e) => {
                warn!(reason = %e, "catalog manager background task going to sleep");
                return;
            }
        };

        self.report_metrics();

        let (to_delete, to_process) = self.extract_tablets_to_process();

        for tablet in &to_delete {
            // Keep nudging replicas that have not acknowledged deletion yet.
            if !tablet.replica_locations().is_empty() {
                let msg = tablet.metadata().read().state_msg.clone();
                self.delete_tablet_replicas(tablet, &msg);
            }
        }

        if !to_process.is_empty() {
            // An error here (e.g. leadership lost mid-pass) aborts the pass;
            // the next wake-up retries.
            if let Err(e) = self.process_pending_assignments(to_process).await {
                error!(error = %e, "error processing pending assignments, aborting this pass");
            }
        } else {
            self.balancer.run_load_balancer();
        }

        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wake_is_edge_triggered() {
        let tasks = BackgroundTasks {
            pending_updates: Mutex::new(false),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        };

        // A recorded wake makes the next wait return immediately and clears
        // the flag.
        tasks.wake();
        tokio::time::timeout(Duration::from_millis(50), tasks.wait_for_updates(Duration::from_secs(60)))
            .await
            .expect("wait must return without sleeping");
        assert!(!*tasks.pending_updates.lock());
    }

    #[tokio::test]
    async fn wait_is_bounded_by_the_timer() {
        let tasks = BackgroundTasks {
            pending_updates: Mutex::new(false),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            handle: Mutex::new(None),
        };

        tokio::time::timeout(Duration::from_secs(5), tasks.wait_for_updates(Duration::from_millis(10)))
            .await
            .expect("bounded wait must expire");
    }

    #[tokio::test]
    async fn shutdown_joins_the_worker() {
        // A worker over a dead manager exits on its own; shutdown still joins
        // cleanly afterwards, and a second shutdown is a no-op.
        let tasks = BackgroundTasks::start(Weak::new(), Duration::from_millis(5));
        tasks.shutdown().await;
        tasks.shutdown().await;
    }
}
