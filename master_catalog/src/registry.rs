//! The in-memory entity registry: every index the master serves lookups from,
//! guarded by a single reader-writer lock.

use crate::entity::{
    ClusterConfigInfo, NamespaceInfo, RoleInfo, TableInfo, TabletInfo, UdtInfo,
};
use data_types::{NamespaceId, RoleName, TableId, TabletId, TabletServerId, TypeId};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashSet;
use std::sync::Arc;

/// Tracks which (server, tablet) replica deletions of one deleted table are
/// still outstanding.
#[derive(Debug)]
pub struct DeletedTableTracker {
    table_id: TableId,
    remaining: Mutex<HashSet<(TabletServerId, TabletId)>>,
}

impl DeletedTableTracker {
    /// Track the given outstanding replica deletions of `table_id`.
    pub fn new(
        table_id: TableId,
        replicas: impl IntoIterator<Item = (TabletServerId, TabletId)>,
    ) -> Self {
        Self {
            table_id,
            remaining: Mutex::new(replicas.into_iter().collect()),
        }
    }

    /// The deleted table.
    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    /// Outstanding deletions, for indexing.
    pub fn keys(&self) -> Vec<(TabletServerId, TabletId)> {
        self.remaining.lock().iter().cloned().collect()
    }

    /// Record one acknowledged deletion.
    pub fn ack(&self, key: &(TabletServerId, TabletId)) {
        self.remaining.lock().remove(key);
    }

    /// Whether any deletion is still outstanding.
    pub fn has_tablets(&self) -> bool {
        !self.remaining.lock().is_empty()
    }

    /// Number of outstanding deletions.
    pub fn num_tablets(&self) -> usize {
        self.remaining.lock().len()
    }
}

/// The registry maps. Readers take the registry lock shared; any insertion,
/// removal or re-keying takes it exclusively. No catalog I/O may happen while
/// the lock is held unless every entity involved is still invisible to
/// concurrent readers.
#[derive(Debug, Default)]
pub struct RegistryMaps {
    /// Tables by id. Entries stay here until the cleaner drops fully deleted
    /// tables.
    pub tables_by_id: HashMap<TableId, Arc<TableInfo>>,
    /// Tables by (namespace, name); only live (non-deleting) tables.
    pub tables_by_name: HashMap<(NamespaceId, String), Arc<TableInfo>>,
    /// Tablets by id.
    pub tablets_by_id: HashMap<TabletId, Arc<TabletInfo>>,
    /// Namespaces by id.
    pub namespaces_by_id: HashMap<NamespaceId, Arc<NamespaceInfo>>,
    /// Namespaces by name; only named (live) namespaces.
    pub namespaces_by_name: HashMap<String, Arc<NamespaceInfo>>,
    /// User-defined types by id.
    pub udts_by_id: HashMap<TypeId, Arc<UdtInfo>>,
    /// User-defined types by (namespace, name).
    pub udts_by_name: HashMap<(NamespaceId, String), Arc<UdtInfo>>,
    /// Roles by name.
    pub roles_by_name: HashMap<RoleName, Arc<RoleInfo>>,
    /// The cluster-config singleton, once loaded or created.
    pub cluster_config: Option<Arc<ClusterConfigInfo>>,
    /// Outstanding replica deletions by (server, tablet).
    pub deleted_tablet_index: HashMap<(TabletServerId, TabletId), Arc<DeletedTableTracker>>,
}

impl RegistryMaps {
    /// Drop every index. Run by the loader before a rebuild.
    pub fn clear(&mut self) {
        self.tables_by_id.clear();
        self.tables_by_name.clear();
        self.tablets_by_id.clear();
        self.namespaces_by_id.clear();
        self.namespaces_by_name.clear();
        self.udts_by_id.clear();
        self.udts_by_name.clear();
        self.roles_by_name.clear();
        self.cluster_config = None;
        self.deleted_tablet_index.clear();
    }

    /// Table lookup by id.
    pub fn table_by_id(&self, id: &TableId) -> Option<Arc<TableInfo>> {
        self.tables_by_id.get(id).map(Arc::clone)
    }

    /// Table lookup by (namespace, name).
    pub fn table_by_name(&self, namespace_id: &NamespaceId, name: &str) -> Option<Arc<TableInfo>> {
        self.tables_by_name
            .get(&(namespace_id.clone(), name.to_string()))
            .map(Arc::clone)
    }

    /// Tablet lookup by id.
    pub fn tablet_by_id(&self, id: &TabletId) -> Option<Arc<TabletInfo>> {
        self.tablets_by_id.get(id).map(Arc::clone)
    }

    /// Namespace lookup by id.
    pub fn namespace_by_id(&self, id: &NamespaceId) -> Option<Arc<NamespaceInfo>> {
        self.namespaces_by_id.get(id).map(Arc::clone)
    }

    /// Namespace lookup by name.
    pub fn namespace_by_name(&self, name: &str) -> Option<Arc<NamespaceInfo>> {
        self.namespaces_by_name.get(name).map(Arc::clone)
    }

    /// Type lookup by id.
    pub fn udt_by_id(&self, id: &TypeId) -> Option<Arc<UdtInfo>> {
        self.udts_by_id.get(id).map(Arc::clone)
    }

    /// Type lookup by (namespace, name).
    pub fn udt_by_name(&self, namespace_id: &NamespaceId, name: &str) -> Option<Arc<UdtInfo>> {
        self.udts_by_name
            .get(&(namespace_id.clone(), name.to_string()))
            .map(Arc::clone)
    }

    /// The cluster config, which exists whenever the loader has run.
    pub fn cluster_config(&self) -> Option<Arc<ClusterConfigInfo>> {
        self.cluster_config.as_ref().map(Arc::clone)
    }
}

/// The registry and its lock.
#[derive(Debug, Default)]
pub struct CatalogRegistry {
    maps: RwLock<RegistryMaps>,
}

impl CatalogRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access for lookups and listings.
    pub fn read(&self) -> RwLockReadGuard<'_, RegistryMaps> {
        self.maps.read()
    }

    /// Exclusive access for insertions, removals and renames.
    pub fn write(&self) -> RwLockWriteGuard<'_, RegistryMaps> {
        self.maps.write()
    }
}
