//! The gate that admits catalog operations only on a fully loaded leader:
//! lifecycle state, leadership checks, and the shared/exclusive leader lock.

use crate::error::{
    CatalogManagerNotInitializedSnafu, Error, IllegalStateSnafu, LeaderNotReadyToServeSnafu,
    Result, ServiceUnavailableSnafu,
};
use async_trait::async_trait;
use data_types::{ConsensusState, PeerRole, TabletServerId};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Lifecycle of the catalog manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogState {
    /// Built but not initialized.
    Constructed,
    /// Initializing.
    Starting,
    /// Serving (subject to leadership).
    Running,
    /// Shutting down.
    Closing,
}

/// View of the consensus layer that replicates the catalog tablet. Provided
/// by the external replication subsystem.
#[async_trait]
pub trait ConsensusHandle: Debug + Send + Sync {
    /// This node's permanent uuid.
    fn node_uuid(&self) -> TabletServerId;

    /// Committed consensus state of the catalog tablet.
    fn committed_consensus_state(&self) -> ConsensusState;

    /// Active consensus state (may lead the committed one during elections).
    fn active_consensus_state(&self) -> ConsensusState;

    /// Whether this node is the active leader holding a non-expired lease.
    fn check_active_leader_and_lease(&self) -> Result<()>;

    /// Wait until every operation of previous terms is committed and this
    /// node holds a leader lease.
    async fn wait_until_caught_up(&self, timeout: Duration) -> Result<()>;

    /// This node's role in the catalog tablet's config.
    fn role(&self) -> PeerRole;
}

/// A shared hold on the leader lock: between acquisition and release the
/// observed term is frozen and the loader cannot run.
#[derive(Debug)]
pub struct LeaderGuard {
    term: i64,
    _permit: OwnedRwLockReadGuard<()>,
}

impl LeaderGuard {
    /// The leader term this guard froze.
    pub fn term(&self) -> i64 {
        self.term
    }
}

/// Lifecycle state plus the leader lock.
#[derive(Debug)]
pub struct LeaderLock {
    state: Mutex<CatalogState>,
    leader_ready_term: AtomicI64,
    lock: Arc<RwLock<()>>,
}

impl Default for LeaderLock {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaderLock {
    /// A gate in the `Constructed` state with no loaded term.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CatalogState::Constructed),
            leader_ready_term: AtomicI64::new(-1),
            lock: Arc::new(RwLock::new(())),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CatalogState {
        *self.state.lock()
    }

    /// Move to `next`, returning the previous state.
    pub fn set_state(&self, next: CatalogState) -> CatalogState {
        std::mem::replace(&mut *self.state.lock(), next)
    }

    /// The most recent term the loader completed for.
    pub fn leader_ready_term(&self) -> i64 {
        self.leader_ready_term.load(Ordering::Acquire)
    }

    /// Publish that the loader completed for `term`.
    pub fn set_leader_ready_term(&self, term: i64) {
        self.leader_ready_term.store(term, Ordering::Release);
    }

    /// Admission check for one catalog operation. On success the returned
    /// guard freezes the term until it is dropped. Each refusal maps to the
    /// status the caller should relay.
    pub fn try_shared(
        &self,
        shell_mode: bool,
        consensus: &dyn ConsensusHandle,
    ) -> Result<LeaderGuard> {
        let state = self.state();
        if state != CatalogState::Running {
            return CatalogManagerNotInitializedSnafu {
                msg: format!("Catalog manager is not initialized. State: {state:?}"),
            }
            .fail();
        }

        let uuid = consensus.node_uuid();
        if shell_mode {
            // Consensus state is in transition while in shell mode and must
            // not be consulted.
            return IllegalStateSnafu {
                msg: format!("Catalog manager of {uuid} is in shell mode, not the leader"),
            }
            .fail();
        }

        let cstate = consensus.committed_consensus_state();
        if cstate.leader_uuid.as_ref() != Some(&uuid) {
            return IllegalStateSnafu {
                msg: format!(
                    "Not the leader. Local UUID: {uuid}, committed leader: {:?}",
                    cstate.leader_uuid
                ),
            }
            .fail();
        }

        consensus.check_active_leader_and_lease()?;

        let ready_term = self.leader_ready_term();
        if ready_term != cstate.current_term {
            return LeaderNotReadyToServeSnafu {
                msg: format!(
                    "Leader not yet ready to serve requests: ready term {ready_term} vs cstate term {}",
                    cstate.current_term
                ),
            }
            .fail();
        }

        match Arc::clone(&self.lock).try_read_owned() {
            Ok(permit) => Ok(LeaderGuard {
                term: cstate.current_term,
                _permit: permit,
            }),
            Err(_) => ServiceUnavailableSnafu {
                msg: "Couldn't get leader lock in shared mode. Leader still loading catalog tables",
            }
            .fail(),
        }
    }

    /// Exclusive hold for the loader: waits for every in-flight operation to
    /// finish and blocks new ones until dropped.
    pub async fn exclusive(&self) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.lock).write_owned().await
    }
}

/// Map an error from a catalog write to `ServiceUnavailable` when it
/// coincides with losing leadership, so clients retry on the new leader.
pub fn check_if_no_longer_leader(error: Error, consensus: &dyn ConsensusHandle) -> Error {
    if error.is_service_unavailable() {
        return error;
    }
    let uuid = consensus.node_uuid();
    let cstate = consensus.committed_consensus_state();
    if cstate.leader_uuid.as_ref() != Some(&uuid) {
        return Error::ServiceUnavailable {
            msg: format!("operation failed while losing leadership: {error}"),
        };
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockConsensus;
    use assert_matches::assert_matches;

    fn running_lock(term: i64) -> LeaderLock {
        let lock = LeaderLock::new();
        lock.set_state(CatalogState::Running);
        lock.set_leader_ready_term(term);
        lock
    }

    #[test]
    fn admits_a_loaded_leader() {
        let consensus = MockConsensus::leader_for_term(1);
        let lock = running_lock(1);

        let guard = lock.try_shared(false, &consensus).unwrap();
        assert_eq!(guard.term(), 1);
    }

    #[test]
    fn refuses_before_running() {
        let consensus = MockConsensus::leader_for_term(1);
        let lock = LeaderLock::new();

        assert_matches!(
            lock.try_shared(false, &consensus),
            Err(Error::CatalogManagerNotInitialized { .. })
        );
    }

    #[test]
    fn refuses_in_shell_mode() {
        let consensus = MockConsensus::leader_for_term(1);
        let lock = running_lock(1);

        assert_matches!(
            lock.try_shared(true, &consensus),
            Err(Error::IllegalState { .. })
        );
    }

    #[test]
    fn refuses_a_follower() {
        let consensus = MockConsensus::leader_for_term(1);
        consensus.set_leader(Some(TabletServerId::from("somebody-else")));
        let lock = running_lock(1);

        assert_matches!(
            lock.try_shared(false, &consensus),
            Err(Error::IllegalState { .. })
        );
    }

    #[test]
    fn refuses_an_expired_lease() {
        let consensus = MockConsensus::leader_for_term(1);
        consensus.set_lease_valid(false);
        let lock = running_lock(1);

        assert_matches!(
            lock.try_shared(false, &consensus),
            Err(Error::LeaderNotReadyToServe { .. })
        );
    }

    #[test]
    fn refuses_until_the_loader_finished_this_term() {
        let consensus = MockConsensus::leader_for_term(2);
        let lock = running_lock(1);

        assert_matches!(
            lock.try_shared(false, &consensus),
            Err(Error::LeaderNotReadyToServe { .. })
        );
    }

    #[tokio::test]
    async fn refuses_while_the_loader_holds_the_lock() {
        let consensus = MockConsensus::leader_for_term(1);
        let lock = running_lock(1);

        let exclusive = lock.exclusive().await;
        assert_matches!(
            lock.try_shared(false, &consensus),
            Err(Error::ServiceUnavailable { .. })
        );
        drop(exclusive);

        lock.try_shared(false, &consensus).unwrap();
    }

    #[test]
    fn downgrades_errors_after_losing_leadership() {
        let consensus = MockConsensus::leader_for_term(1);
        let original = Error::RemoteError {
            msg: "write failed".into(),
        };
        let kept = check_if_no_longer_leader(original, &consensus);
        assert_matches!(kept, Error::RemoteError { .. });

        consensus.set_leader(Some(TabletServerId::from("somebody-else")));
        let original = Error::RemoteError {
            msg: "write failed".into(),
        };
        let downgraded = check_if_no_longer_leader(original, &consensus);
        assert_matches!(downgraded, Error::ServiceUnavailable { .. });
    }
}
