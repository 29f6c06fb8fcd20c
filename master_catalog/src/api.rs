//! Wire-level request and response types served by the catalog manager. The
//! codec that moves them across the network is an external collaborator;
//! these are the plain payloads.

use data_types::{
    CloudInfo, ClusterConfigMetadata, ColumnId, ConsensusState, DataType, HostPort, NamespaceId,
    Partition, PartitionSchema, PeerRole, ReplicationInfo, TableId, TableSchema, TableType,
    TabletId, TabletServerId, TypeId,
};

/// Identifies a namespace by id or by name.
#[derive(Debug, Clone, Default)]
pub struct NamespaceIdentifier {
    /// By id.
    pub id: Option<NamespaceId>,
    /// By name.
    pub name: Option<String>,
}

impl NamespaceIdentifier {
    /// Identifier by name.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: Some(name.into()),
        }
    }

    /// Identifier by id.
    pub fn by_id(id: NamespaceId) -> Self {
        Self {
            id: Some(id),
            name: None,
        }
    }
}

/// Identifies a table by id or by (namespace, name).
#[derive(Debug, Clone, Default)]
pub struct TableIdentifier {
    /// By id.
    pub table_id: Option<TableId>,
    /// By name, within `namespace` (or the default namespace).
    pub table_name: Option<String>,
    /// Namespace scoping the name lookup.
    pub namespace: Option<NamespaceIdentifier>,
}

impl TableIdentifier {
    /// Identifier by id.
    pub fn by_id(table_id: TableId) -> Self {
        Self {
            table_id: Some(table_id),
            ..Default::default()
        }
    }

    /// Identifier by namespace and name.
    pub fn by_name(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table_id: None,
            table_name: Some(name.into()),
            namespace: Some(NamespaceIdentifier::by_name(namespace)),
        }
    }
}

/// Identifies a user-defined type by id or by (namespace, name).
#[derive(Debug, Clone, Default)]
pub struct UdtIdentifier {
    /// By id.
    pub type_id: Option<TypeId>,
    /// By name, within `namespace`.
    pub type_name: Option<String>,
    /// Namespace scoping the name lookup.
    pub namespace: Option<NamespaceIdentifier>,
}

/// A column as submitted by a client. Column ids are assigned by the master;
/// a request carrying one is rejected.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    /// Must be absent in requests.
    pub id: Option<ColumnId>,
    /// Column name.
    pub name: String,
    /// Value type.
    pub data_type: DataType,
    /// Whether NULL is legal.
    pub is_nullable: bool,
    /// Primary-key membership.
    pub is_key: bool,
    /// Hash-key membership (subset of the primary key).
    pub is_hash_key: bool,
    /// Read default for rows older than the column.
    pub read_default: Option<Vec<u8>>,
}

/// CreateTable request.
#[derive(Debug, Clone)]
pub struct CreateTableRequest {
    /// Table name.
    pub name: String,
    /// Namespace; the default namespace when absent.
    pub namespace: Option<NamespaceIdentifier>,
    /// Table flavor.
    pub table_type: TableType,
    /// Schema, key columns first.
    pub columns: Vec<ColumnDefinition>,
    /// Number of tablets for hash-partitioned tables.
    pub num_tablets: usize,
    /// Split keys for range-partitioned tables.
    pub split_keys: Vec<Vec<u8>>,
    /// Desired placement; cluster default when absent.
    pub replication_info: Option<ReplicationInfo>,
}

/// CreateTable response.
#[derive(Debug, Clone)]
pub struct CreateTableResponse {
    /// Id of the new table.
    pub table_id: TableId,
}

/// IsCreateTableDone response.
#[derive(Debug, Clone)]
pub struct IsCreateTableDoneResponse {
    /// Whether every tablet of the table is running.
    pub done: bool,
}

/// One step of an AlterTable request. Steps apply in order.
#[derive(Debug, Clone)]
pub enum AlterTableStep {
    /// Add a value column.
    AddColumn {
        /// The column to add.
        column: ColumnDefinition,
    },
    /// Drop a value column.
    DropColumn {
        /// Name of the column to drop.
        name: String,
    },
    /// Rename a column, keeping its id.
    RenameColumn {
        /// Current name.
        old_name: String,
        /// New name.
        new_name: String,
    },
}

/// AlterTable request.
#[derive(Debug, Clone, Default)]
pub struct AlterTableRequest {
    /// The table to alter.
    pub table: TableIdentifier,
    /// Rename target, if renaming.
    pub new_table_name: Option<String>,
    /// Move target, if changing namespaces.
    pub new_namespace: Option<NamespaceIdentifier>,
    /// Ordered schema-change steps.
    pub alter_schema_steps: Vec<AlterTableStep>,
    /// Replacement placement properties.
    pub alter_properties: Option<ReplicationInfo>,
}

impl AlterTableRequest {
    /// An empty alter of `table`.
    pub fn new(table: TableIdentifier) -> Self {
        Self {
            table,
            ..Default::default()
        }
    }
}

/// IsAlterTableDone response.
#[derive(Debug, Clone)]
pub struct IsAlterTableDoneResponse {
    /// Current schema version.
    pub schema_version: u32,
    /// Whether the alter has reached every replica.
    pub done: bool,
}

/// DeleteTable response.
#[derive(Debug, Clone)]
pub struct DeleteTableResponse {
    /// Id of the table being deleted.
    pub table_id: TableId,
}

/// IsDeleteTableDone response.
#[derive(Debug, Clone)]
pub struct IsDeleteTableDoneResponse {
    /// Whether every replica acknowledged deletion.
    pub done: bool,
}

/// GetTableSchema response.
#[derive(Debug, Clone)]
pub struct GetTableSchemaResponse {
    /// The fully-applied schema: the live schema, or the previous one while
    /// an alter is still propagating.
    pub schema: TableSchema,
    /// Schema version of the live schema.
    pub version: u32,
    /// Desired placement.
    pub replication_info: ReplicationInfo,
    /// Partitioning of the key space.
    pub partition_schema: PartitionSchema,
    /// Table flavor.
    pub table_type: TableType,
    /// Whether creation completed.
    pub create_table_done: bool,
    /// Table id.
    pub table_id: TableId,
    /// Table name.
    pub table_name: String,
    /// Namespace id.
    pub namespace_id: NamespaceId,
    /// Namespace name.
    pub namespace_name: String,
}

/// ListTables request.
#[derive(Debug, Clone, Default)]
pub struct ListTablesRequest {
    /// Only tables whose name contains this substring.
    pub name_filter: Option<String>,
    /// Only tables in this namespace.
    pub namespace: Option<NamespaceIdentifier>,
}

/// One table of a ListTables response.
#[derive(Debug, Clone)]
pub struct ListedTable {
    /// Table id.
    pub id: TableId,
    /// Table name.
    pub name: String,
    /// Table flavor.
    pub table_type: TableType,
    /// Namespace id.
    pub namespace_id: NamespaceId,
    /// Namespace name.
    pub namespace_name: String,
}

/// GetTableLocations request.
#[derive(Debug, Clone)]
pub struct GetTableLocationsRequest {
    /// The table.
    pub table: TableIdentifier,
    /// Inclusive partition-key lower bound.
    pub partition_key_start: Option<Vec<u8>>,
    /// Exclusive partition-key upper bound.
    pub partition_key_end: Option<Vec<u8>>,
    /// Cap on returned tablets.
    pub max_returned_locations: usize,
}

/// Where one replica of a tablet lives.
#[derive(Debug, Clone)]
pub struct ReplicaLocation {
    /// Consensus role.
    pub role: PeerRole,
    /// Hosting server uuid.
    pub permanent_uuid: TabletServerId,
    /// RPC endpoints of the server.
    pub rpc_addresses: Vec<HostPort>,
    /// Location of the server, when known.
    pub cloud_info: Option<CloudInfo>,
}

/// Locations of one tablet.
#[derive(Debug, Clone)]
pub struct TabletLocations {
    /// The tablet.
    pub tablet_id: TabletId,
    /// Its owning table.
    pub table_id: TableId,
    /// The key range it covers.
    pub partition: Partition,
    /// True when replica locations were derived from the last committed
    /// consensus config instead of fresh heartbeats.
    pub stale: bool,
    /// The replicas.
    pub replicas: Vec<ReplicaLocation>,
}

/// GetTableLocations response.
#[derive(Debug, Clone)]
pub struct GetTableLocationsResponse {
    /// Locations of the tablets intersecting the requested range.
    pub tablet_locations: Vec<TabletLocations>,
    /// Table flavor.
    pub table_type: TableType,
}

/// CreateNamespace response.
#[derive(Debug, Clone)]
pub struct CreateNamespaceResponse {
    /// Id of the new namespace.
    pub id: NamespaceId,
}

/// ListNamespaces request.
#[derive(Debug, Clone, Default)]
pub struct ListNamespacesRequest {
    /// Only namespaces whose name contains this substring.
    pub name_filter: Option<String>,
}

/// One namespace of a ListNamespaces response.
#[derive(Debug, Clone)]
pub struct ListedNamespace {
    /// Namespace id.
    pub id: NamespaceId,
    /// Namespace name.
    pub name: String,
}

/// CreateUDType request.
#[derive(Debug, Clone)]
pub struct CreateUdtRequest {
    /// Type name.
    pub name: String,
    /// Owning namespace.
    pub namespace: NamespaceIdentifier,
    /// Field names; parallel to `field_types`.
    pub field_names: Vec<String>,
    /// Field types; parallel to `field_names`.
    pub field_types: Vec<DataType>,
}

/// CreateUDType response.
#[derive(Debug, Clone)]
pub struct CreateUdtResponse {
    /// Id of the new type.
    pub id: TypeId,
}

/// A user-defined type as returned to clients.
#[derive(Debug, Clone)]
pub struct UdtDescription {
    /// Type id.
    pub id: TypeId,
    /// Type name.
    pub name: String,
    /// Owning namespace.
    pub namespace_id: NamespaceId,
    /// Field names.
    pub field_names: Vec<String>,
    /// Field types.
    pub field_types: Vec<DataType>,
}

/// ChangeClusterConfig request: a compare-and-swap on `version`.
#[derive(Debug, Clone)]
pub struct ChangeClusterConfigRequest {
    /// The desired config, carrying the version the caller read.
    pub cluster_config: ClusterConfigMetadata,
}

/// IsLoadBalanced request.
#[derive(Debug, Clone, Default)]
pub struct IsLoadBalancedRequest {
    /// Fail fast if fewer servers than this are live.
    pub expected_num_servers: Option<usize>,
}

/// GetLoadMovePercent response.
#[derive(Debug, Clone)]
pub struct GetLoadMovePercentResponse {
    /// Percentage of the blacklisted servers' initial load already moved off.
    pub percent: f64,
}

/// State a tablet replica reports itself in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedState {
    /// Replica known but not yet started.
    NotStarted,
    /// Replica replaying its log.
    Bootstrapping,
    /// Replica serving.
    Running,
    /// Replica failed; `error` carries the cause.
    Failed,
}

/// One tablet entry of a tablet report.
#[derive(Debug, Clone)]
pub struct ReportedTablet {
    /// The tablet being reported.
    pub tablet_id: TabletId,
    /// State of the reporting replica.
    pub state: ReportedState,
    /// Schema version the replica runs, when known.
    pub schema_version: Option<u32>,
    /// Committed consensus state, absent while the replica bootstraps.
    pub committed_consensus_state: Option<ConsensusState>,
    /// Failure cause when `state == Failed`.
    pub error: Option<String>,
}

/// A heartbeat-borne tablet report from one server.
#[derive(Debug, Clone)]
pub struct TabletReport {
    /// Whether only changed tablets are included.
    pub is_incremental: bool,
    /// The reported tablets.
    pub updated_tablets: Vec<ReportedTablet>,
}

/// Master feedback for one reported tablet.
#[derive(Debug, Clone)]
pub struct ReportedTabletUpdate {
    /// The tablet.
    pub tablet_id: TabletId,
    /// State annotation from the master's record.
    pub state_msg: String,
}

/// ProcessTabletReport response.
#[derive(Debug, Clone, Default)]
pub struct TabletReportUpdates {
    /// Feedback per reported tablet.
    pub tablets: Vec<ReportedTabletUpdate>,
    /// Set when the master needs a full (non-incremental) report first.
    pub needs_full_tablet_report: bool,
}

/// StartRemoteBootstrap request.
#[derive(Debug, Clone)]
pub struct StartRemoteBootstrapRequest {
    /// Peer to copy the catalog tablet from.
    pub bootstrap_peer_uuid: TabletServerId,
    /// Address of that peer.
    pub bootstrap_peer_addr: HostPort,
    /// Term of the leader requesting the bootstrap.
    pub caller_term: i64,
}
