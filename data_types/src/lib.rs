//! Shared data types for the cluster catalog: entity identifiers, persisted
//! metadata records, replica placement and consensus descriptions.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::{OptionExt, Snafu};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

mod partition;
mod schema;

pub use partition::*;
pub use schema::*;

/// Sentinel for a consensus config that has never been committed.
pub const INVALID_OPID_INDEX: i64 = -1;

/// The term assigned to a tablet's consensus state before any election.
pub const MINIMUM_TERM: i64 = 0;

macro_rules! string_id {
    ($(#[doc = $doc:expr])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(String);

        impl $name {
            /// Wrap an existing identifier.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().simple().to_string())
            }

            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True for the default-constructed, unset identifier.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of a table.
    TableId
);
string_id!(
    /// Identifier of a tablet (one shard of a table).
    TabletId
);
string_id!(
    /// Identifier of a namespace.
    NamespaceId
);
string_id!(
    /// Identifier of a user-defined type.
    TypeId
);
string_id!(
    /// Permanent uuid of a tablet server.
    TabletServerId
);
string_id!(
    /// Name of a role. Roles are keyed by name, not by a generated id.
    RoleName
);

/// Identifier of a column within a table schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnId(i32);

impl ColumnId {
    /// Construct from the raw value.
    pub const fn new(v: i32) -> Self {
        Self(v)
    }

    /// The raw value.
    pub fn get(&self) -> i32 {
        self.0
    }

    /// The next column id in allocation order.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors parsing wire-level address strings.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum AddressError {
    #[snafu(display("invalid host:port address: {}", addr))]
    Invalid { addr: String },
}

/// A resolvable `host:port` pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPort {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl HostPort {
    /// Construct from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for HostPort {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').context(InvalidSnafu { addr: s })?;
        let port = port.parse().ok().context(InvalidSnafu { addr: s })?;
        Ok(Self::new(host, port))
    }
}

/// The flavor of a table, which determines how its partition schema is
/// computed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    /// Multi-column hash partitioning over the hash-key columns.
    HashTable,
    /// Range partitioning on the primary key.
    RangeTable,
    /// Fixed-slot hash partitioning (key/value workloads).
    KeyValueTable,
}

/// Lifecycle state of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// Created, tablets not all assigned yet.
    Preparing,
    /// All tablets running.
    Running,
    /// A schema change is propagating to the tablets.
    Altering,
    /// Deletion requested, replicas still being torn down.
    Deleting,
    /// All replicas confirmed deleted.
    Deleted,
}

/// Lifecycle state of a tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletState {
    /// Created in memory and persisted, no replicas requested yet.
    Preparing,
    /// Create-replica requests sent, waiting for a leader.
    Creating,
    /// A replica quorum is serving.
    Running,
    /// Timed out in `Creating` and superseded by a sibling with the same
    /// partition range.
    Replaced,
    /// Deletion requested.
    Deleted,
}

/// Role of a peer within a tablet's consensus config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The elected leader.
    Leader,
    /// A voting follower.
    Follower,
    /// A non-voting learner.
    Learner,
    /// Not a member of the config.
    NonParticipant,
}

/// One peer of a tablet's replica group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftPeer {
    /// Permanent uuid of the hosting tablet server.
    pub permanent_uuid: TabletServerId,
    /// Last address the peer registered with, if known.
    pub last_known_addr: Option<HostPort>,
}

/// The replicated configuration of a tablet's replica group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftConfig {
    /// Log index at which this config was committed.
    pub opid_index: i64,
    /// Member peers.
    pub peers: Vec<RaftPeer>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            opid_index: INVALID_OPID_INDEX,
            peers: vec![],
        }
    }
}

impl RaftConfig {
    /// Whether `uuid` is a member of this config.
    pub fn contains(&self, uuid: &TabletServerId) -> bool {
        self.peers.iter().any(|p| &p.permanent_uuid == uuid)
    }
}

/// Committed consensus state of a tablet, as last reported to the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusState {
    /// Current consensus term.
    pub current_term: i64,
    /// Leader for `current_term`, if one is known.
    pub leader_uuid: Option<TabletServerId>,
    /// Committed replica configuration.
    pub config: RaftConfig,
}

impl Default for ConsensusState {
    fn default() -> Self {
        Self {
            current_term: MINIMUM_TERM,
            leader_uuid: None,
            config: RaftConfig::default(),
        }
    }
}

impl ConsensusState {
    /// The consensus role `uuid` plays in this state.
    pub fn role_of(&self, uuid: &TabletServerId) -> PeerRole {
        if self.leader_uuid.as_ref() == Some(uuid) {
            return PeerRole::Leader;
        }
        if self.config.contains(uuid) {
            PeerRole::Follower
        } else {
            PeerRole::NonParticipant
        }
    }
}

/// A cloud/region/zone location triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloudInfo {
    /// Cloud provider name.
    pub cloud: String,
    /// Region within the cloud.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
}

impl CloudInfo {
    /// Construct from parts.
    pub fn new(
        cloud: impl Into<String>,
        region: impl Into<String>,
        zone: impl Into<String>,
    ) -> Self {
        Self {
            cloud: cloud.into(),
            region: region.into(),
            zone: zone.into(),
        }
    }

    /// Stable identifier used to key placement blocks.
    pub fn placement_id(&self) -> String {
        format!("{}.{}.{}", self.cloud, self.region, self.zone)
    }
}

impl fmt::Display for CloudInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.placement_id())
    }
}

/// A hard floor on how many replicas must live in one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementBlock {
    /// The location this block constrains.
    pub cloud_info: CloudInfo,
    /// Minimum replicas that must be placed inside the block.
    pub min_num_replicas: usize,
}

/// Placement requirements for the live replicas of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementInfo {
    /// Total number of replicas. Zero means "use the configured default".
    pub num_replicas: usize,
    /// Per-location minimums; may be empty.
    pub placement_blocks: Vec<PlacementBlock>,
}

/// Desired replication of a table or of the whole cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationInfo {
    /// Live (synchronous) replicas.
    pub live_replicas: PlacementInfo,
}

/// Servers being drained; used for move-progress reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    /// Addresses of the blacklisted servers.
    pub hosts: Vec<HostPort>,
    /// Number of tablet replicas hosted on blacklisted servers when the
    /// blacklist was installed.
    pub initial_replica_load: i64,
}

/// Persisted record of a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceMetadata {
    /// Unique name; empty once the namespace is deleted.
    pub name: String,
}

/// Persisted record of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableMetadata {
    /// Name, unique within the namespace while the table lives.
    pub name: String,
    /// Owning namespace.
    pub namespace_id: NamespaceId,
    /// Flavor; fixes the partition schema family.
    pub table_type: TableType,
    /// Lifecycle state.
    pub state: TableState,
    /// Human-readable annotation for the last state change.
    pub state_msg: String,
    /// Current schema.
    pub schema: TableSchema,
    /// Monotonic schema version.
    pub version: u32,
    /// Next column id to hand out in an ALTER.
    pub next_column_id: ColumnId,
    /// How the key space maps onto tablets.
    pub partition_schema: PartitionSchema,
    /// Desired placement.
    pub replication_info: ReplicationInfo,
    /// While `state == Altering`: the previous schema, still live on some
    /// replicas.
    pub fully_applied_schema: Option<TableSchema>,
}

impl TableMetadata {
    /// Set the lifecycle state together with its annotation.
    pub fn set_state(&mut self, state: TableState, msg: impl Into<String>) {
        self.state = state;
        self.state_msg = msg.into();
    }

    /// Whether deletion has been requested (terminal or in progress).
    pub fn started_deleting(&self) -> bool {
        matches!(self.state, TableState::Deleting | TableState::Deleted)
    }

    /// Whether all replicas have confirmed deletion.
    pub fn is_deleted(&self) -> bool {
        self.state == TableState::Deleted
    }

    /// Whether the table serves traffic (possibly mid-alter).
    pub fn is_running(&self) -> bool {
        matches!(self.state, TableState::Running | TableState::Altering)
    }
}

/// Persisted record of a tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletMetadata {
    /// Owning table.
    pub table_id: TableId,
    /// Key range this tablet covers.
    pub partition: Partition,
    /// Lifecycle state.
    pub state: TabletState,
    /// Human-readable annotation for the last state change.
    pub state_msg: String,
    /// Last committed consensus state reported for this tablet.
    pub committed_consensus_state: ConsensusState,
}

impl TabletMetadata {
    /// Set the lifecycle state together with its annotation.
    pub fn set_state(&mut self, state: TabletState, msg: impl Into<String>) {
        self.state = state;
        self.state_msg = msg.into();
    }

    /// Whether this tablet is no longer (or never became) part of the live
    /// key space.
    pub fn is_deleted(&self) -> bool {
        matches!(self.state, TabletState::Replaced | TabletState::Deleted)
    }

    /// Whether a replica quorum serves this tablet.
    pub fn is_running(&self) -> bool {
        self.state == TabletState::Running
    }
}

/// Persisted record of a user-defined type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UdtMetadata {
    /// Name, unique within the namespace.
    pub name: String,
    /// Owning namespace.
    pub namespace_id: NamespaceId,
    /// Field names; same length as `field_types`.
    pub field_names: Vec<String>,
    /// Field types; same length as `field_names`.
    pub field_types: Vec<DataType>,
}

/// Persisted record of a role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleMetadata {
    /// The role name.
    pub role: RoleName,
    /// Whether the role may authenticate.
    pub can_login: bool,
    /// Whether the role bypasses permission checks.
    pub is_superuser: bool,
    /// Salted password hash (bcrypt).
    pub salted_hash: String,
    /// Roles this role is a member of.
    pub member_of: BTreeSet<RoleName>,
}

/// Persisted record of the cluster-wide configuration singleton.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfigMetadata {
    /// Monotonic version; every successful mutation increments it.
    pub version: u64,
    /// Immutable after the first write.
    pub cluster_uuid: String,
    /// Cluster-wide default placement.
    pub replication_info: ReplicationInfo,
    /// Servers being drained, if any.
    pub server_blacklist: Option<Blacklist>,
}
