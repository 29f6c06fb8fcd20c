//! The persistent metadata store: a single replicated table holding one
//! serialized record per catalog entity, keyed by `(entity kind, entity id)`.
//!
//! Writes go through the external consensus layer and return only once the
//! replica quorum committed them; the visit interface replays every persisted
//! record of one kind and is the only way state moves from here into the
//! in-memory registry.

use crate::error::{Error, Result, ServiceUnavailableSnafu};
use async_trait::async_trait;
use data_types::{
    ClusterConfigMetadata, NamespaceId, NamespaceMetadata, RoleMetadata, RoleName, TableId,
    TableMetadata, TabletId, TabletMetadata, TypeId, UdtMetadata,
};
use observability_deps::tracing::warn;
use parking_lot::Mutex;
use snafu::Snafu;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// The kinds of records the store holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityKind {
    /// Table records.
    Table,
    /// Tablet records.
    Tablet,
    /// Namespace records.
    Namespace,
    /// User-defined type records.
    UdType,
    /// The cluster-config singleton.
    ClusterConfig,
    /// Role records.
    Role,
}

/// Fixed key of the cluster-config singleton row.
const CLUSTER_CONFIG_KEY: &str = "cluster_config";

/// One persisted record, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SysEntry {
    /// A table record.
    Table {
        /// Table id.
        id: TableId,
        /// The record.
        metadata: TableMetadata,
    },
    /// A tablet record.
    Tablet {
        /// Tablet id.
        id: TabletId,
        /// The record.
        metadata: TabletMetadata,
    },
    /// A namespace record.
    Namespace {
        /// Namespace id.
        id: NamespaceId,
        /// The record.
        metadata: NamespaceMetadata,
    },
    /// A user-defined type record.
    UdType {
        /// Type id.
        id: TypeId,
        /// The record.
        metadata: UdtMetadata,
    },
    /// The cluster-config singleton.
    ClusterConfig {
        /// The record.
        metadata: ClusterConfigMetadata,
    },
    /// A role record.
    Role {
        /// Role name.
        name: RoleName,
        /// The record.
        metadata: RoleMetadata,
    },
}

impl SysEntry {
    /// The kind tag.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Table { .. } => EntityKind::Table,
            Self::Tablet { .. } => EntityKind::Tablet,
            Self::Namespace { .. } => EntityKind::Namespace,
            Self::UdType { .. } => EntityKind::UdType,
            Self::ClusterConfig { .. } => EntityKind::ClusterConfig,
            Self::Role { .. } => EntityKind::Role,
        }
    }

    /// The row key within the kind.
    pub fn id(&self) -> String {
        match self {
            Self::Table { id, .. } => id.to_string(),
            Self::Tablet { id, .. } => id.to_string(),
            Self::Namespace { id, .. } => id.to_string(),
            Self::UdType { id, .. } => id.to_string(),
            Self::ClusterConfig { .. } => CLUSTER_CONFIG_KEY.to_string(),
            Self::Role { name, .. } => name.to_string(),
        }
    }
}

/// One mutation of the store.
#[derive(Debug, Clone)]
pub enum SysOp {
    /// Insert a record that must not exist yet.
    Insert(SysEntry),
    /// Replace a record that must exist.
    Update(SysEntry),
    /// Remove a record.
    Delete(EntityKind, String),
}

/// Why a batch could not be replicated.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ReplicationError {
    #[snafu(display("no longer the leader"))]
    NoLongerLeader,

    #[snafu(display("replication failed: {}", msg))]
    ReplicationFailed { msg: String },
}

/// Quorum replication of store mutations; provided by the consensus layer.
#[async_trait]
pub trait LogReplicator: Debug + Send + Sync {
    /// Replicate `ops` to the quorum; returns once committed.
    async fn replicate(&self, ops: &[SysOp]) -> Result<(), ReplicationError>;
}

/// The store itself: replicated mutations over a local committed view.
#[derive(Debug)]
pub struct SysCatalogTable {
    entries: Mutex<BTreeMap<(EntityKind, String), SysEntry>>,
    replicator: std::sync::Arc<dyn LogReplicator>,
}

impl SysCatalogTable {
    /// Create an empty store writing through `replicator`.
    pub fn new(replicator: std::sync::Arc<dyn LogReplicator>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            replicator,
        }
    }

    /// Insert one record.
    pub async fn add_item(&self, entry: SysEntry) -> Result<()> {
        self.write_batch(vec![SysOp::Insert(entry)]).await
    }

    /// Insert several records in one replicated batch.
    pub async fn add_items(&self, entries: Vec<SysEntry>) -> Result<()> {
        self.write_batch(entries.into_iter().map(SysOp::Insert).collect())
            .await
    }

    /// Replace one record.
    pub async fn update_item(&self, entry: SysEntry) -> Result<()> {
        self.write_batch(vec![SysOp::Update(entry)]).await
    }

    /// Replace several records in one replicated batch.
    pub async fn update_items(&self, entries: Vec<SysEntry>) -> Result<()> {
        self.write_batch(entries.into_iter().map(SysOp::Update).collect())
            .await
    }

    /// Remove one record.
    pub async fn delete_item(&self, kind: EntityKind, id: String) -> Result<()> {
        self.write_batch(vec![SysOp::Delete(kind, id)]).await
    }

    /// Apply a mixed batch atomically: replicated as one unit, then applied
    /// to the committed view.
    pub async fn write_batch(&self, ops: Vec<SysOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        self.replicator.replicate(&ops).await.map_err(|e| match e {
            ReplicationError::NoLongerLeader => ServiceUnavailableSnafu {
                msg: "sys catalog write refused: no longer the leader",
            }
            .build(),
            ReplicationError::ReplicationFailed { msg } => ServiceUnavailableSnafu {
                msg: format!("sys catalog write failed: {msg}"),
            }
            .build(),
        })?;

        let mut entries = self.entries.lock();
        for op in ops {
            match op {
                SysOp::Insert(entry) => {
                    let key = (entry.kind(), entry.id());
                    if entries.insert(key.clone(), entry).is_some() {
                        return Err(Error::Corruption {
                            msg: format!("insert of existing sys catalog row {key:?}"),
                        });
                    }
                }
                SysOp::Update(entry) => {
                    let key = (entry.kind(), entry.id());
                    if entries.insert(key.clone(), entry).is_none() {
                        return Err(Error::Corruption {
                            msg: format!("update of missing sys catalog row {key:?}"),
                        });
                    }
                }
                SysOp::Delete(kind, id) => {
                    if entries.remove(&(kind, id.clone())).is_none() {
                        warn!(%id, ?kind, "delete of missing sys catalog row");
                    }
                }
            }
        }
        Ok(())
    }

    /// Replay every persisted record of `kind` through `visitor`, in
    /// unspecified order.
    pub fn visit<F>(&self, kind: EntityKind, mut visitor: F) -> Result<()>
    where
        F: FnMut(&SysEntry) -> Result<()>,
    {
        // Clone out of the lock: visitors rebuild registry state and must not
        // run under the store lock.
        let snapshot: Vec<SysEntry> = self
            .entries
            .lock()
            .range((kind, String::new())..)
            .take_while(|((k, _), _)| *k == kind)
            .map(|(_, v)| v.clone())
            .collect();

        for entry in &snapshot {
            visitor(entry)?;
        }
        Ok(())
    }

    /// Number of persisted records of `kind`.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.entries
            .lock()
            .range((kind, String::new())..)
            .take_while(|((k, _), _)| *k == kind)
            .count()
    }

    /// Replace the whole committed view. Used when a shell-mode master
    /// adopts a catalog tablet fetched from a peer.
    pub fn install_snapshot(&self, entries: Vec<SysEntry>) {
        let mut map = self.entries.lock();
        map.clear();
        for entry in entries {
            map.insert((entry.kind(), entry.id()), entry);
        }
    }

    /// Export the committed view. Donor side of a remote bootstrap.
    pub fn snapshot(&self) -> Vec<SysEntry> {
        self.entries.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeReplicator;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn namespace_entry(id: &str, name: &str) -> SysEntry {
        SysEntry::Namespace {
            id: NamespaceId::from(id),
            metadata: NamespaceMetadata { name: name.into() },
        }
    }

    #[tokio::test]
    async fn add_visit_round_trip() {
        let store = SysCatalogTable::new(Arc::new(FakeReplicator::default()));
        store.add_item(namespace_entry("ns1", "a")).await.unwrap();
        store.add_item(namespace_entry("ns2", "b")).await.unwrap();

        let mut seen = vec![];
        store
            .visit(EntityKind::Namespace, |entry| {
                if let SysEntry::Namespace { metadata, .. } = entry {
                    seen.push(metadata.name.clone());
                }
                Ok(())
            })
            .unwrap();
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(store.count(EntityKind::Table), 0);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let store = SysCatalogTable::new(Arc::new(FakeReplicator::default()));
        store.add_item(namespace_entry("ns1", "a")).await.unwrap();
        store
            .update_item(namespace_entry("ns1", "renamed"))
            .await
            .unwrap();

        let mut seen = vec![];
        store
            .visit(EntityKind::Namespace, |entry| {
                seen.push(entry.id());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["ns1"]);

        store
            .delete_item(EntityKind::Namespace, "ns1".into())
            .await
            .unwrap();
        assert_eq!(store.count(EntityKind::Namespace), 0);
    }

    #[tokio::test]
    async fn lost_leadership_surfaces_as_service_unavailable() {
        let replicator = Arc::new(FakeReplicator::default());
        let store = SysCatalogTable::new(Arc::<FakeReplicator>::clone(&replicator));

        replicator.fail_next_with_lost_leadership();
        let err = store.add_item(namespace_entry("ns1", "a")).await.unwrap_err();
        assert_matches!(err, Error::ServiceUnavailable { .. });

        // Nothing was applied.
        assert_eq!(store.count(EntityKind::Namespace), 0);

        // The next write goes through.
        store.add_item(namespace_entry("ns1", "a")).await.unwrap();
        assert_eq!(store.count(EntityKind::Namespace), 1);
    }

    #[tokio::test]
    async fn double_insert_is_corruption() {
        let store = SysCatalogTable::new(Arc::new(FakeReplicator::default()));
        store.add_item(namespace_entry("ns1", "a")).await.unwrap();
        let err = store.add_item(namespace_entry("ns1", "a")).await.unwrap_err();
        assert_matches!(err, Error::Corruption { .. });
    }
}
