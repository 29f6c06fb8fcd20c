//! Shared fixtures for catalog manager tests: mock seams for the external
//! subsystems and a [`TestMaster`] that wires a loaded leader together.

use crate::api::{
    ColumnDefinition, CreateTableRequest, ReportedState, ReportedTablet, TabletReport,
    TabletReportUpdates,
};
use crate::catalog::{CatalogManager, CatalogManagerDeps};
use crate::config::MasterConfig;
use crate::entity::{TableInfo, TabletInfo};
use crate::error::{LeaderNotReadyToServeSnafu, Result};
use crate::leader::{CatalogState, ConsensusHandle};
use crate::rpc::{
    AlterReplicaRequest, CreateReplicaRequest, DeleteReplicaRequest, RemoteBootstrapSource,
    RpcError, TabletDataState, TabletServerRpc,
};
use crate::sys_store::{LogReplicator, ReplicationError, SysEntry, SysOp};
use crate::balancer::NoopLoadBalancer;
use crate::ts_manager::{TsDescriptor, TsManager, TsRegistration};
use async_trait::async_trait;
use data_types::{
    CloudInfo, ConsensusState, DataType, HostPort, PeerRole, RaftConfig, RaftPeer, TableId,
    TableType, TabletId, TabletServerId,
};
use master_time::{MockProvider, Time};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Consensus handle whose leadership and lease are test-controlled.
#[derive(Debug)]
pub struct MockConsensus {
    node: TabletServerId,
    state: Mutex<ConsensusState>,
    lease_valid: AtomicBool,
}

impl MockConsensus {
    /// A consensus view in which this node is the committed leader of `term`.
    pub fn leader_for_term(term: i64) -> Self {
        let node = TabletServerId::from("master-1");
        Self {
            node: node.clone(),
            state: Mutex::new(ConsensusState {
                current_term: term,
                leader_uuid: Some(node),
                config: RaftConfig::default(),
            }),
            lease_valid: AtomicBool::new(true),
        }
    }

    /// Replace the committed leader.
    pub fn set_leader(&self, leader: Option<TabletServerId>) {
        self.state.lock().leader_uuid = leader;
    }

    /// Move to a new term, keeping this node the leader.
    pub fn set_term(&self, term: i64) {
        let mut state = self.state.lock();
        state.current_term = term;
        state.leader_uuid = Some(self.node.clone());
    }

    /// Control the leader-lease check.
    pub fn set_lease_valid(&self, valid: bool) {
        self.lease_valid.store(valid, Ordering::Release);
    }
}

#[async_trait]
impl ConsensusHandle for MockConsensus {
    fn node_uuid(&self) -> TabletServerId {
        self.node.clone()
    }

    fn committed_consensus_state(&self) -> ConsensusState {
        self.state.lock().clone()
    }

    fn active_consensus_state(&self) -> ConsensusState {
        self.state.lock().clone()
    }

    fn check_active_leader_and_lease(&self) -> Result<()> {
        if self.lease_valid.load(Ordering::Acquire) {
            Ok(())
        } else {
            LeaderNotReadyToServeSnafu {
                msg: "leader lease is not active",
            }
            .fail()
        }
    }

    async fn wait_until_caught_up(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn role(&self) -> PeerRole {
        if self.state.lock().leader_uuid.as_ref() == Some(&self.node) {
            PeerRole::Leader
        } else {
            PeerRole::Follower
        }
    }
}

/// Replicator that always commits, unless told to fail the next batch.
#[derive(Debug, Default)]
pub struct FakeReplicator {
    fail_next: Mutex<Option<ReplicationError>>,
}

impl FakeReplicator {
    /// Fail the next batch as if leadership was lost.
    pub fn fail_next_with_lost_leadership(&self) {
        *self.fail_next.lock() = Some(ReplicationError::NoLongerLeader);
    }

    /// Fail the next batch with a generic replication error.
    pub fn fail_next_with_error(&self, msg: impl Into<String>) {
        *self.fail_next.lock() = Some(ReplicationError::ReplicationFailed { msg: msg.into() });
    }
}

#[async_trait]
impl LogReplicator for FakeReplicator {
    async fn replicate(&self, _ops: &[SysOp]) -> Result<(), ReplicationError> {
        match self.fail_next.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A fleet of test tablet servers, all permanently live.
#[derive(Debug, Default)]
pub struct TestTsManager {
    servers: Mutex<Vec<Arc<TsDescriptor>>>,
}

impl TestTsManager {
    /// Register a server in the given location.
    pub fn add_ts(&self, uuid: &str, cloud_info: CloudInfo) -> Arc<TsDescriptor> {
        let desc = Arc::new(TsDescriptor::new(
            TabletServerId::from(uuid),
            TsRegistration {
                rpc_addresses: vec![HostPort::new(uuid, 9100)],
                cloud_info,
            },
        ));
        self.servers.lock().push(Arc::clone(&desc));
        desc
    }
}

impl TsManager for TestTsManager {
    fn all_descriptors(&self) -> Vec<Arc<TsDescriptor>> {
        self.servers.lock().clone()
    }

    fn live_descriptors(&self) -> Vec<Arc<TsDescriptor>> {
        self.servers.lock().clone()
    }

    fn lookup(&self, uuid: &TabletServerId) -> Option<Arc<TsDescriptor>> {
        self.servers
            .lock()
            .iter()
            .find(|ts| ts.permanent_uuid() == uuid)
            .map(Arc::clone)
    }
}

/// One outbound admin RPC observed by [`RecordingRpc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcCall {
    /// A create-replica request.
    CreateReplica {
        /// Target server.
        server: TabletServerId,
        /// Tablet being created.
        tablet_id: TabletId,
    },
    /// A delete-replica request.
    DeleteReplica {
        /// Target server.
        server: TabletServerId,
        /// Tablet being deleted.
        tablet_id: TabletId,
        /// Delete or tombstone.
        delete_type: TabletDataState,
        /// CAS bound carried with a tombstone.
        cas_config_opid_index_less_or_equal: Option<i64>,
    },
    /// An alter-replica request.
    AlterReplica {
        /// Target server.
        server: TabletServerId,
        /// Tablet being altered.
        tablet_id: TabletId,
        /// Version being pushed.
        schema_version: u32,
    },
}

/// RPC proxy that records every call and always succeeds.
#[derive(Debug, Default)]
pub struct RecordingRpc {
    calls: Mutex<Vec<RpcCall>>,
}

impl RecordingRpc {
    /// Everything sent so far.
    pub fn calls(&self) -> Vec<RpcCall> {
        self.calls.lock().clone()
    }

    /// Drain the recorded calls.
    pub fn take_calls(&self) -> Vec<RpcCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Servers that received a create-replica for `tablet_id`.
    pub fn create_targets(&self, tablet_id: &TabletId) -> Vec<TabletServerId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                RpcCall::CreateReplica { server, tablet_id: t } if t == tablet_id => {
                    Some(server.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// All recorded delete-replica calls.
    pub fn delete_calls(&self) -> Vec<RpcCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, RpcCall::DeleteReplica { .. }))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TabletServerRpc for RecordingRpc {
    async fn create_replica(
        &self,
        ts: &TsDescriptor,
        req: CreateReplicaRequest,
    ) -> Result<(), RpcError> {
        self.calls.lock().push(RpcCall::CreateReplica {
            server: ts.permanent_uuid().clone(),
            tablet_id: req.tablet_id,
        });
        Ok(())
    }

    async fn delete_replica(
        &self,
        ts: &TsDescriptor,
        req: DeleteReplicaRequest,
    ) -> Result<(), RpcError> {
        self.calls.lock().push(RpcCall::DeleteReplica {
            server: ts.permanent_uuid().clone(),
            tablet_id: req.tablet_id,
            delete_type: req.delete_type,
            cas_config_opid_index_less_or_equal: req.cas_config_opid_index_less_or_equal,
        });
        Ok(())
    }

    async fn alter_replica(
        &self,
        ts: &TsDescriptor,
        req: AlterReplicaRequest,
    ) -> Result<(), RpcError> {
        self.calls.lock().push(RpcCall::AlterReplica {
            server: ts.permanent_uuid().clone(),
            tablet_id: req.tablet_id,
            schema_version: req.schema_version,
        });
        Ok(())
    }
}

/// Bootstrap source serving a fixed catalog snapshot.
#[derive(Debug, Default)]
pub struct SnapshotBootstrapSource {
    entries: Mutex<Vec<SysEntry>>,
}

impl SnapshotBootstrapSource {
    /// Serve `entries` to the bootstrapping master.
    pub fn new(entries: Vec<SysEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

#[async_trait]
impl RemoteBootstrapSource for SnapshotBootstrapSource {
    async fn fetch_catalog_snapshot(
        &self,
        _peer_uuid: &TabletServerId,
        _peer_addr: &HostPort,
    ) -> Result<Vec<SysEntry>, RpcError> {
        Ok(self.entries.lock().clone())
    }
}

/// A fully loaded single-node leader over mock seams. The background loop is
/// not started; tests drive passes with [`TestMaster::tick`].
#[derive(Debug)]
pub struct TestMaster {
    /// The manager under test.
    pub catalog: Arc<CatalogManager>,
    /// Controls time-based behavior (creation timeouts).
    pub time: Arc<MockProvider>,
    /// Controls leadership.
    pub consensus: Arc<MockConsensus>,
    /// Controls sys catalog write outcomes.
    pub replicator: Arc<FakeReplicator>,
    /// The test fleet.
    pub ts_manager: Arc<TestTsManager>,
    /// Records outbound RPCs.
    pub rpc: Arc<RecordingRpc>,
}

impl TestMaster {
    /// Start with default configuration.
    pub async fn start() -> Self {
        Self::start_with_config(MasterConfig::default()).await
    }

    /// Start with the given configuration and run the loader for term 1.
    pub async fn start_with_config(config: MasterConfig) -> Self {
        Self::start_with(config, None).await
    }

    /// Start with an optional remote-bootstrap source wired in.
    pub async fn start_with(
        config: MasterConfig,
        bootstrap_source: Option<Arc<dyn RemoteBootstrapSource>>,
    ) -> Self {
        let time = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let consensus = Arc::new(MockConsensus::leader_for_term(1));
        let replicator = Arc::new(FakeReplicator::default());
        let ts_manager = Arc::new(TestTsManager::default());
        let rpc = Arc::new(RecordingRpc::default());

        let catalog = CatalogManager::new(CatalogManagerDeps {
            config,
            consensus: Arc::clone(&consensus) as _,
            replicator: Arc::clone(&replicator) as _,
            ts_manager: Arc::clone(&ts_manager) as _,
            rpc: Arc::clone(&rpc) as _,
            balancer: Arc::new(NoopLoadBalancer),
            time_provider: Arc::clone(&time) as _,
            bootstrap_source,
            shell_mode: false,
        });

        // Bring the lifecycle up by hand instead of init() so the background
        // loop stays off and tests stay deterministic.
        catalog.leader.set_state(CatalogState::Starting);
        catalog.leader.set_state(CatalogState::Running);
        catalog.load_sys_catalog_data().await;
        assert_eq!(catalog.leader.leader_ready_term(), 1);

        Self {
            catalog,
            time,
            consensus,
            replicator,
            ts_manager,
            rpc,
        }
    }

    /// Register a live tablet server in the default location.
    pub fn add_ts(&self, uuid: &str) -> Arc<TsDescriptor> {
        self.ts_manager
            .add_ts(uuid, CloudInfo::new("cloud1", "datacenter1", "rack1"))
    }

    /// Run one background pass.
    pub async fn tick(&self) {
        self.catalog.run_background_pass().await;
    }

    /// Re-run the loader, as a new leader term would.
    pub async fn reload_for_term(&self, term: i64) {
        self.consensus.set_term(term);
        self.catalog.load_sys_catalog_data().await;
    }

    /// A one-key-column schema for simple tables.
    pub fn simple_columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition {
                id: None,
                name: "k".into(),
                data_type: DataType::String,
                is_nullable: false,
                is_key: true,
                is_hash_key: true,
                read_default: None,
            },
            ColumnDefinition {
                id: None,
                name: "v".into(),
                data_type: DataType::Int64,
                is_nullable: true,
                is_key: false,
                is_hash_key: false,
                read_default: None,
            },
        ]
    }

    /// A hash-table CreateTable request in the default namespace.
    pub fn simple_create_request(name: &str, num_tablets: usize) -> CreateTableRequest {
        CreateTableRequest {
            name: name.into(),
            namespace: None,
            table_type: TableType::HashTable,
            columns: Self::simple_columns(),
            num_tablets,
            split_keys: vec![],
            replication_info: None,
        }
    }

    /// Create a simple hash table and return its id.
    pub async fn create_simple_table(&self, name: &str, num_tablets: usize) -> Result<TableId> {
        let resp = self
            .catalog
            .create_table(Self::simple_create_request(name, num_tablets))
            .await?;
        Ok(resp.table_id)
    }

    /// The table registered under `table_id`, if any.
    pub fn table(&self, table_id: &TableId) -> Option<Arc<TableInfo>> {
        self.catalog.registry.read().table_by_id(table_id)
    }

    /// The tablets of a table, in partition order.
    pub fn tablets_of(&self, table_id: &TableId) -> Vec<Arc<TabletInfo>> {
        self.table(table_id)
            .map(|table| table.all_tablets())
            .unwrap_or_default()
    }

    /// The tablet registered under `tablet_id`, if any.
    pub fn tablet(&self, tablet_id: &TabletId) -> Option<Arc<TabletInfo>> {
        self.catalog.registry.read().tablet_by_id(tablet_id)
    }

    /// Deliver a full tablet report from `ts` carrying `tablets`.
    pub async fn report(
        &self,
        ts: &Arc<TsDescriptor>,
        tablets: Vec<ReportedTablet>,
    ) -> Result<TabletReportUpdates> {
        self.catalog
            .process_tablet_report(
                ts,
                &TabletReport {
                    is_incremental: false,
                    updated_tablets: tablets,
                },
            )
            .await
    }
}

/// Consensus state with `peers`, `leader`, `term` and `opid_index`.
pub fn consensus_state(
    peers: &[&Arc<TsDescriptor>],
    leader: Option<&Arc<TsDescriptor>>,
    term: i64,
    opid_index: i64,
) -> ConsensusState {
    ConsensusState {
        current_term: term,
        leader_uuid: leader.map(|ts| ts.permanent_uuid().clone()),
        config: RaftConfig {
            opid_index,
            peers: peers
                .iter()
                .map(|ts| RaftPeer {
                    permanent_uuid: ts.permanent_uuid().clone(),
                    last_known_addr: ts.registration().rpc_addresses.first().cloned(),
                })
                .collect(),
        },
    }
}

/// A RUNNING replica report for `tablet_id` with the given consensus state.
pub fn running_report(tablet_id: &TabletId, cstate: ConsensusState) -> ReportedTablet {
    ReportedTablet {
        tablet_id: tablet_id.clone(),
        state: ReportedState::Running,
        schema_version: Some(0),
        committed_consensus_state: Some(cstate),
        error: None,
    }
}
