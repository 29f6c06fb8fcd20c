//! Outbound RPC seam to tablet servers. The transport itself is an external
//! collaborator; the catalog only needs the three admin verbs.

use crate::ts_manager::TsDescriptor;
use async_trait::async_trait;
use data_types::{Partition, PartitionSchema, RaftConfig, TableId, TableSchema, TabletId};
use snafu::Snafu;
use std::fmt::Debug;

/// What a deleted replica leaves behind on its server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletDataState {
    /// All data removed.
    Deleted,
    /// Data removed but a marker kept so the replica is not immediately
    /// re-adopted; gated by a CAS on a prior config opid index.
    Tombstoned,
}

/// Ask a server to create one replica of a new tablet.
#[derive(Debug, Clone)]
pub struct CreateReplicaRequest {
    /// The new tablet.
    pub tablet_id: TabletId,
    /// Its owning table.
    pub table_id: TableId,
    /// Table name, for the server's bookkeeping.
    pub table_name: String,
    /// Schema to create the replica with.
    pub schema: TableSchema,
    /// Schema version the replica starts at.
    pub schema_version: u32,
    /// How the table's key space is partitioned.
    pub partition_schema: PartitionSchema,
    /// The key range this tablet covers.
    pub partition: Partition,
    /// Initial consensus configuration.
    pub config: RaftConfig,
}

/// Ask a server to drop one replica.
#[derive(Debug, Clone)]
pub struct DeleteReplicaRequest {
    /// The tablet to drop.
    pub tablet_id: TabletId,
    /// Delete outright or leave a tombstone.
    pub delete_type: TabletDataState,
    /// Only delete if the replica's committed config opid index is at most
    /// this value.
    pub cas_config_opid_index_less_or_equal: Option<i64>,
    /// Human-readable reason, logged on both ends.
    pub reason: String,
}

/// Ask a server to apply a new schema version to one replica.
#[derive(Debug, Clone)]
pub struct AlterReplicaRequest {
    /// The tablet to alter.
    pub tablet_id: TabletId,
    /// The schema to converge to.
    pub schema: TableSchema,
    /// Version of that schema.
    pub schema_version: u32,
}

/// Transport-level RPC failures.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum RpcError {
    #[snafu(display("rpc to {} timed out", server))]
    Timeout { server: String },

    #[snafu(display("server {} unreachable: {}", server, msg))]
    Unreachable { server: String, msg: String },

    #[snafu(display("remote error from {}: {}", server, msg))]
    Remote { server: String, msg: String },
}

/// Fetches a full catalog-tablet snapshot from a peer master. Only used
/// while this master is in shell mode.
#[async_trait]
pub trait RemoteBootstrapSource: Debug + Send + Sync {
    /// Copy the peer's committed catalog entries.
    async fn fetch_catalog_snapshot(
        &self,
        peer_uuid: &data_types::TabletServerId,
        peer_addr: &data_types::HostPort,
    ) -> Result<Vec<crate::sys_store::SysEntry>, RpcError>;
}

/// Proxy for the tablet server admin service. Implementations carry the
/// deadline from [`crate::MasterConfig::ts_rpc_timeout`].
#[async_trait]
pub trait TabletServerRpc: Debug + Send + Sync {
    /// Create a replica on `ts`.
    async fn create_replica(
        &self,
        ts: &TsDescriptor,
        req: CreateReplicaRequest,
    ) -> Result<(), RpcError>;

    /// Delete (or tombstone) a replica on `ts`.
    async fn delete_replica(
        &self,
        ts: &TsDescriptor,
        req: DeleteReplicaRequest,
    ) -> Result<(), RpcError>;

    /// Push a schema change to a replica on `ts`.
    async fn alter_replica(
        &self,
        ts: &TsDescriptor,
        req: AlterReplicaRequest,
    ) -> Result<(), RpcError>;
}
