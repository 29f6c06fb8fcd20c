//! Read-side view of the tablet server fleet. The fleet manager itself
//! (registration, liveness) is an external subsystem; the catalog only reads
//! descriptor snapshots and keeps per-server assignment statistics.

use data_types::{CloudInfo, HostPort, TabletId, TabletServerId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

/// What a tablet server registered with: where to reach it and where it runs.
#[derive(Debug, Clone)]
pub struct TsRegistration {
    /// RPC endpoints, most-preferred first.
    pub rpc_addresses: Vec<HostPort>,
    /// The cloud/region/zone the server runs in.
    pub cloud_info: CloudInfo,
}

#[derive(Debug, Default)]
struct TsDescriptorState {
    num_live_replicas: usize,
    recent_replica_creations: f64,
    has_tablet_report: bool,
    pending_tablet_deletes: HashSet<TabletId>,
}

/// Snapshot descriptor of one tablet server.
#[derive(Debug)]
pub struct TsDescriptor {
    permanent_uuid: TabletServerId,
    registration: TsRegistration,
    state: Mutex<TsDescriptorState>,
}

impl TsDescriptor {
    /// Create a descriptor for a registered server.
    pub fn new(permanent_uuid: TabletServerId, registration: TsRegistration) -> Self {
        Self {
            permanent_uuid,
            registration,
            state: Default::default(),
        }
    }

    /// The server's permanent uuid.
    pub fn permanent_uuid(&self) -> &TabletServerId {
        &self.permanent_uuid
    }

    /// The server's registration.
    pub fn registration(&self) -> &TsRegistration {
        &self.registration
    }

    /// Whether this server lives inside the given location.
    pub fn matches_cloud_info(&self, cloud_info: &CloudInfo) -> bool {
        self.registration.cloud_info == *cloud_info
    }

    /// Number of tablet replicas this server currently hosts, as last
    /// reported.
    pub fn num_live_replicas(&self) -> usize {
        self.state.lock().num_live_replicas
    }

    /// Update the hosted-replica count from a heartbeat.
    pub fn set_num_live_replicas(&self, n: usize) {
        self.state.lock().num_live_replicas = n;
    }

    /// How often this server was chosen for new replicas recently. Decays so
    /// that selections made while creates are still in flight keep counting
    /// without penalizing the server forever.
    pub fn recent_replica_creations(&self) -> f64 {
        self.state.lock().recent_replica_creations
    }

    /// Record that a replica was just assigned here.
    pub fn increment_recent_replica_creations(&self) {
        self.state.lock().recent_replica_creations += 1.0;
    }

    /// Halve the recent-creation weight; invoked periodically by the
    /// background loop.
    pub fn decay_recent_replica_creations(&self) {
        let mut state = self.state.lock();
        state.recent_replica_creations *= 0.5;
        if state.recent_replica_creations < 1e-3 {
            state.recent_replica_creations = 0.0;
        }
    }

    /// Whether a full tablet report has been processed since this server (or
    /// this master leader) started.
    pub fn has_tablet_report(&self) -> bool {
        self.state.lock().has_tablet_report
    }

    /// Mark whether a full tablet report has been seen.
    pub fn set_has_tablet_report(&self, has: bool) {
        self.state.lock().has_tablet_report = has;
    }

    /// Record an outstanding delete-replica request.
    pub fn add_pending_tablet_delete(&self, tablet_id: TabletId) {
        self.state.lock().pending_tablet_deletes.insert(tablet_id);
    }

    /// Whether a delete-replica request is outstanding for `tablet_id`.
    pub fn is_tablet_delete_pending(&self, tablet_id: &TabletId) -> bool {
        self.state.lock().pending_tablet_deletes.contains(tablet_id)
    }

    /// Clear an outstanding delete-replica request.
    pub fn clear_pending_tablet_delete(&self, tablet_id: &TabletId) {
        self.state.lock().pending_tablet_deletes.remove(tablet_id);
    }
}

/// Access to the fleet manager's descriptor table. Descriptors are shared
/// snapshots; the catalog never owns the fleet.
pub trait TsManager: Debug + Send + Sync {
    /// Every known descriptor, live or not.
    fn all_descriptors(&self) -> Vec<Arc<TsDescriptor>>;

    /// Descriptors of servers currently considered live.
    fn live_descriptors(&self) -> Vec<Arc<TsDescriptor>>;

    /// Look a server up by its permanent uuid.
    fn lookup(&self, uuid: &TabletServerId) -> Option<Arc<TsDescriptor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(uuid: &str, zone: &str) -> TsDescriptor {
        TsDescriptor::new(
            TabletServerId::from(uuid),
            TsRegistration {
                rpc_addresses: vec![HostPort::new(uuid, 9100)],
                cloud_info: CloudInfo::new("c", "r", zone),
            },
        )
    }

    #[test]
    fn cloud_matching_is_exact() {
        let ts = descriptor("a", "z1");
        assert!(ts.matches_cloud_info(&CloudInfo::new("c", "r", "z1")));
        assert!(!ts.matches_cloud_info(&CloudInfo::new("c", "r", "z2")));
    }

    #[test]
    fn recent_creations_decay_to_zero() {
        let ts = descriptor("a", "z1");
        ts.increment_recent_replica_creations();
        ts.increment_recent_replica_creations();
        assert_eq!(ts.recent_replica_creations(), 2.0);

        ts.decay_recent_replica_creations();
        assert_eq!(ts.recent_replica_creations(), 1.0);

        for _ in 0..20 {
            ts.decay_recent_replica_creations();
        }
        assert_eq!(ts.recent_replica_creations(), 0.0);
    }

    #[test]
    fn pending_deletes_round_trip() {
        let ts = descriptor("a", "z1");
        let tablet = TabletId::from("t1");
        assert!(!ts.is_tablet_delete_pending(&tablet));

        ts.add_pending_tablet_delete(tablet.clone());
        assert!(ts.is_tablet_delete_pending(&tablet));

        ts.clear_pending_tablet_delete(&tablet);
        assert!(!ts.is_tablet_delete_pending(&tablet));
    }
}
