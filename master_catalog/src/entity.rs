//! In-memory wrappers around the persisted catalog records: each entity pairs
//! a [`CowCell`] over its record with the transient state the master tracks
//! for it between heartbeats.

use crate::api::ReportedState;
use crate::cow::CowCell;
use crate::error::Error;
use crate::tasks::TaskSet;
use crate::ts_manager::TsDescriptor;
use data_types::{
    ClusterConfigMetadata, NamespaceId, NamespaceMetadata, PeerRole, RoleMetadata, RoleName,
    TableId, TableMetadata, TabletId, TabletMetadata, TabletServerId, TypeId, UdtMetadata,
};
use master_time::Time;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One replica of a tablet as last seen by the master.
#[derive(Debug, Clone)]
pub struct TabletReplica {
    /// The hosting server.
    pub ts: Arc<TsDescriptor>,
    /// Consensus role of the replica.
    pub role: PeerRole,
    /// State the replica last reported.
    pub state: ReportedState,
}

/// Map from server uuid to the replica it hosts.
pub type ReplicaMap = hashbrown::HashMap<TabletServerId, TabletReplica>;

#[derive(Debug)]
struct TableSideState {
    /// Tablets keyed by partition start key, kept sorted for range lookups.
    tablet_map: BTreeMap<Vec<u8>, Arc<TabletInfo>>,
    /// Replica-selection failure surfaced through IsCreateTableDone.
    create_table_error: Option<Error>,
}

/// A table and its transient assignment state.
#[derive(Debug)]
pub struct TableInfo {
    table_id: TableId,
    metadata: CowCell<TableMetadata>,
    state: Mutex<TableSideState>,
    tasks: TaskSet,
}

impl TableInfo {
    /// Wrap a table record.
    pub fn new(table_id: TableId, metadata: TableMetadata) -> Self {
        Self {
            table_id,
            metadata: CowCell::new(metadata),
            state: Mutex::new(TableSideState {
                tablet_map: BTreeMap::new(),
                create_table_error: None,
            }),
            tasks: TaskSet::new(),
        }
    }

    /// The table id.
    pub fn id(&self) -> &TableId {
        &self.table_id
    }

    /// The copy-on-write record.
    pub fn metadata(&self) -> &CowCell<TableMetadata> {
        &self.metadata
    }

    /// Current name (committed).
    pub fn name(&self) -> String {
        self.metadata.read().name.clone()
    }

    /// Owning namespace (committed).
    pub fn namespace_id(&self) -> NamespaceId {
        self.metadata.read().namespace_id.clone()
    }

    /// Whether the table serves traffic (committed).
    pub fn is_running(&self) -> bool {
        self.metadata.read().is_running()
    }

    /// Register a tablet under its partition start key.
    pub fn add_tablet(&self, tablet: Arc<TabletInfo>) {
        let key = tablet.metadata().read().partition.partition_key_start.clone();
        self.state.lock().tablet_map.insert(key, tablet);
    }

    /// Register several tablets.
    pub fn add_tablets(&self, tablets: impl IntoIterator<Item = Arc<TabletInfo>>) {
        let mut state = self.state.lock();
        for tablet in tablets {
            let key = tablet.metadata().read().partition.partition_key_start.clone();
            state.tablet_map.insert(key, tablet);
        }
    }

    /// Remove the tablet registered under `partition_key_start`, returning
    /// whether one was present.
    pub fn remove_tablet(&self, partition_key_start: &[u8]) -> bool {
        self.state.lock().tablet_map.remove(partition_key_start).is_some()
    }

    /// Detach every tablet from this table. Used on deletion to break the
    /// table/tablet reference cycle.
    pub fn detach_tablets(&self) {
        self.state.lock().tablet_map.clear();
    }

    /// All registered tablets in partition order.
    pub fn all_tablets(&self) -> Vec<Arc<TabletInfo>> {
        self.state.lock().tablet_map.values().cloned().collect()
    }

    /// Tablets whose ranges intersect `[partition_key_start, partition_key_end)`,
    /// at most `max` of them, in partition order.
    pub fn tablets_in_range(
        &self,
        partition_key_start: Option<&[u8]>,
        partition_key_end: Option<&[u8]>,
        max: usize,
    ) -> Vec<Arc<TabletInfo>> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for (start_key, tablet) in &state.tablet_map {
            if out.len() >= max {
                break;
            }
            if let Some(end) = partition_key_end {
                if !end.is_empty() && start_key.as_slice() >= end {
                    break;
                }
            }
            if let Some(start) = partition_key_start {
                let tablet_end = &tablet.metadata().read().partition.partition_key_end;
                if !tablet_end.is_empty() && tablet_end.as_slice() <= start {
                    continue;
                }
            }
            out.push(Arc::clone(tablet));
        }
        out
    }

    /// Whether any tablet has not yet caught up to schema version `version`.
    pub fn is_alter_in_progress(&self, version: u32) -> bool {
        self.state
            .lock()
            .tablet_map
            .values()
            .any(|t| t.reported_schema_version() < version)
    }

    /// Whether any tablet is not yet running.
    pub fn is_create_in_progress(&self) -> bool {
        self.state
            .lock()
            .tablet_map
            .values()
            .any(|t| !t.metadata().read().is_running())
    }

    /// Park a replica-selection failure for IsCreateTableDone to surface.
    pub fn set_create_table_error(&self, error: Error) {
        self.state.lock().create_table_error = Some(error);
    }

    /// Drop a parked failure once assignment made progress again.
    pub fn clear_create_table_error(&self) {
        self.state.lock().create_table_error = None;
    }

    /// The parked replica-selection failure, if any.
    pub fn create_table_error(&self) -> Option<Error> {
        self.state.lock().create_table_error.clone()
    }

    /// The table's pending background tasks.
    pub fn tasks(&self) -> &TaskSet {
        &self.tasks
    }
}

#[derive(Debug)]
struct TabletSideState {
    replica_locations: ReplicaMap,
    last_update_time: Time,
    reported_schema_version: u32,
}

/// A tablet and its transient replica state.
#[derive(Debug)]
pub struct TabletInfo {
    tablet_id: TabletId,
    /// The owning table; `None` only for orphans found at load time.
    table: Option<Arc<TableInfo>>,
    metadata: CowCell<TabletMetadata>,
    state: Mutex<TabletSideState>,
}

impl TabletInfo {
    /// Wrap a tablet record.
    pub fn new(
        tablet_id: TabletId,
        table: Option<Arc<TableInfo>>,
        metadata: TabletMetadata,
        now: Time,
    ) -> Self {
        Self {
            tablet_id,
            table,
            metadata: CowCell::new(metadata),
            state: Mutex::new(TabletSideState {
                replica_locations: ReplicaMap::default(),
                last_update_time: now,
                reported_schema_version: 0,
            }),
        }
    }

    /// The tablet id.
    pub fn id(&self) -> &TabletId {
        &self.tablet_id
    }

    /// The owning table, unless this tablet is an orphan.
    pub fn table(&self) -> Option<&Arc<TableInfo>> {
        self.table.as_ref()
    }

    /// The copy-on-write record.
    pub fn metadata(&self) -> &CowCell<TabletMetadata> {
        &self.metadata
    }

    /// Snapshot of the replica map.
    pub fn replica_locations(&self) -> ReplicaMap {
        self.state.lock().replica_locations.clone()
    }

    /// Replace the replica map wholesale, refreshing the update time.
    pub fn set_replica_locations(&self, replicas: ReplicaMap, now: Time) {
        let mut state = self.state.lock();
        state.replica_locations = replicas;
        state.last_update_time = now;
    }

    /// Insert a replica unless one with the same server uuid is present.
    /// Returns whether it was inserted.
    pub fn add_replica_if_not_found(&self, replica: TabletReplica) -> bool {
        let mut state = self.state.lock();
        match state
            .replica_locations
            .entry(replica.ts.permanent_uuid().clone())
        {
            hashbrown::hash_map::Entry::Occupied(_) => false,
            hashbrown::hash_map::Entry::Vacant(v) => {
                v.insert(replica);
                true
            }
        }
    }

    /// Drop the replica hosted on `uuid`, if tracked.
    pub fn remove_replica(&self, uuid: &TabletServerId) {
        self.state.lock().replica_locations.remove(uuid);
    }

    /// When this tablet last made assignment progress.
    pub fn last_update_time(&self) -> Time {
        self.state.lock().last_update_time
    }

    /// Reset the assignment clock.
    pub fn set_last_update_time(&self, now: Time) {
        self.state.lock().last_update_time = now;
    }

    /// Highest schema version any replica has reported.
    pub fn reported_schema_version(&self) -> u32 {
        self.state.lock().reported_schema_version
    }

    /// Raise the reported schema version; returns whether it advanced.
    pub fn set_reported_schema_version(&self, version: u32) -> bool {
        let mut state = self.state.lock();
        if version > state.reported_schema_version {
            state.reported_schema_version = version;
            return true;
        }
        false
    }
}

/// A namespace.
#[derive(Debug)]
pub struct NamespaceInfo {
    namespace_id: NamespaceId,
    metadata: CowCell<NamespaceMetadata>,
}

impl NamespaceInfo {
    /// Wrap a namespace record.
    pub fn new(namespace_id: NamespaceId, metadata: NamespaceMetadata) -> Self {
        Self {
            namespace_id,
            metadata: CowCell::new(metadata),
        }
    }

    /// The namespace id.
    pub fn id(&self) -> &NamespaceId {
        &self.namespace_id
    }

    /// The copy-on-write record.
    pub fn metadata(&self) -> &CowCell<NamespaceMetadata> {
        &self.metadata
    }

    /// Current name (committed).
    pub fn name(&self) -> String {
        self.metadata.read().name.clone()
    }
}

/// A user-defined type.
#[derive(Debug)]
pub struct UdtInfo {
    type_id: TypeId,
    metadata: CowCell<UdtMetadata>,
}

impl UdtInfo {
    /// Wrap a type record.
    pub fn new(type_id: TypeId, metadata: UdtMetadata) -> Self {
        Self {
            type_id,
            metadata: CowCell::new(metadata),
        }
    }

    /// The type id.
    pub fn id(&self) -> &TypeId {
        &self.type_id
    }

    /// The copy-on-write record.
    pub fn metadata(&self) -> &CowCell<UdtMetadata> {
        &self.metadata
    }

    /// Current name (committed).
    pub fn name(&self) -> String {
        self.metadata.read().name.clone()
    }

    /// Owning namespace (committed).
    pub fn namespace_id(&self) -> NamespaceId {
        self.metadata.read().namespace_id.clone()
    }
}

/// A role.
#[derive(Debug)]
pub struct RoleInfo {
    role: RoleName,
    metadata: CowCell<RoleMetadata>,
}

impl RoleInfo {
    /// Wrap a role record.
    pub fn new(role: RoleName, metadata: RoleMetadata) -> Self {
        Self {
            role,
            metadata: CowCell::new(metadata),
        }
    }

    /// The role name.
    pub fn role(&self) -> &RoleName {
        &self.role
    }

    /// The copy-on-write record.
    pub fn metadata(&self) -> &CowCell<RoleMetadata> {
        &self.metadata
    }
}

/// The cluster-config singleton.
#[derive(Debug)]
pub struct ClusterConfigInfo {
    metadata: CowCell<ClusterConfigMetadata>,
}

impl ClusterConfigInfo {
    /// Wrap the cluster-config record.
    pub fn new(metadata: ClusterConfigMetadata) -> Self {
        Self {
            metadata: CowCell::new(metadata),
        }
    }

    /// The copy-on-write record.
    pub fn metadata(&self) -> &CowCell<ClusterConfigMetadata> {
        &self.metadata
    }
}
