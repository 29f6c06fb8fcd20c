//! The catalog manager itself: ties the registry, the persistent store, the
//! leader gate and the background machinery together, and serves the
//! cluster-level operations. Table/namespace/type handlers live in
//! [`crate::control`].

use crate::api::{
    ChangeClusterConfigRequest, GetLoadMovePercentResponse, IsLoadBalancedRequest,
    StartRemoteBootstrapRequest,
};
use crate::background::BackgroundTasks;
use crate::balancer::LoadBalancer;
use crate::config::MasterConfig;
use crate::entity::{TableInfo, TabletInfo};
use crate::error::{
    ConfigVersionMismatchSnafu, Error, IllegalStateSnafu, InvalidClusterConfigSnafu, Result,
    TryAgainSnafu,
};
use crate::leader::{check_if_no_longer_leader, CatalogState, ConsensusHandle, LeaderGuard, LeaderLock};
use crate::registry::CatalogRegistry;
use crate::rpc::{
    AlterReplicaRequest, CreateReplicaRequest, DeleteReplicaRequest, RemoteBootstrapSource,
    TabletDataState, TabletServerRpc,
};
use crate::sys_store::{LogReplicator, SysCatalogTable, SysEntry};
use crate::tasks::RetryDelay;
use crate::ts_manager::{TsDescriptor, TsManager};
use data_types::{
    Blacklist, ClusterConfigMetadata, HostPort, NamespaceId, NamespaceMetadata, RoleMetadata,
    RoleName, TableId, TableMetadata, TabletId, TabletMetadata, TypeId, UdtMetadata,
};
use master_time::TimeProvider;
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

/// Everything the catalog manager is wired to.
#[derive(Debug)]
pub struct CatalogManagerDeps {
    /// Configuration options.
    pub config: MasterConfig,
    /// Consensus layer replicating the catalog tablet.
    pub consensus: Arc<dyn ConsensusHandle>,
    /// Quorum replication for catalog writes.
    pub replicator: Arc<dyn LogReplicator>,
    /// The tablet server fleet.
    pub ts_manager: Arc<dyn TsManager>,
    /// Outbound proxy to tablet servers.
    pub rpc: Arc<dyn TabletServerRpc>,
    /// Placement rebalancer.
    pub balancer: Arc<dyn LoadBalancer>,
    /// Clock.
    pub time_provider: Arc<dyn TimeProvider>,
    /// Source for catalog snapshots while bootstrapping a shell-mode master.
    pub bootstrap_source: Option<Arc<dyn RemoteBootstrapSource>>,
    /// Whether this master starts without a catalog tablet of its own.
    pub shell_mode: bool,
}

/// The master-side catalog manager.
#[derive(Debug)]
pub struct CatalogManager {
    pub(crate) config: MasterConfig,
    pub(crate) time_provider: Arc<dyn TimeProvider>,
    pub(crate) registry: CatalogRegistry,
    pub(crate) sys_store: SysCatalogTable,
    pub(crate) leader: LeaderLock,
    pub(crate) consensus: Arc<dyn ConsensusHandle>,
    pub(crate) ts_manager: Arc<dyn TsManager>,
    pub(crate) rpc: Arc<dyn TabletServerRpc>,
    pub(crate) balancer: Arc<dyn LoadBalancer>,
    bootstrap_source: Option<Arc<dyn RemoteBootstrapSource>>,
    background: Mutex<Option<Arc<BackgroundTasks>>>,
    shell_mode: AtomicBool,
    remote_bootstrap_lock: tokio::sync::Mutex<()>,
}

impl CatalogManager {
    /// Build an unstarted manager.
    pub fn new(deps: CatalogManagerDeps) -> Arc<Self> {
        Arc::new(Self {
            config: deps.config,
            time_provider: deps.time_provider,
            registry: CatalogRegistry::new(),
            sys_store: SysCatalogTable::new(deps.replicator),
            leader: LeaderLock::new(),
            consensus: deps.consensus,
            ts_manager: deps.ts_manager,
            rpc: deps.rpc,
            balancer: deps.balancer,
            bootstrap_source: deps.bootstrap_source,
            background: Mutex::new(None),
            shell_mode: AtomicBool::new(deps.shell_mode),
            remote_bootstrap_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Initialize: start the background loop (unless in shell mode) and begin
    /// serving, subject to leadership.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        let prev = self.leader.set_state(CatalogState::Starting);
        if prev != CatalogState::Constructed {
            return IllegalStateSnafu {
                msg: format!("init from unexpected state {prev:?}"),
            }
            .fail();
        }

        if !self.is_shell_mode() {
            self.enable_bg_tasks();
        }

        self.leader.set_state(CatalogState::Running);
        Ok(())
    }

    /// Stop the background loop and abort every pending entity task.
    pub async fn shutdown(&self) {
        let prev = self.leader.set_state(CatalogState::Closing);
        if prev == CatalogState::Closing {
            return;
        }

        let background = self.background.lock().take();
        if let Some(background) = background {
            background.shutdown().await;
        }

        // There may be an outstanding loader rebuilding the maps; a snapshot
        // of the current tables is enough, tasks created after it will find
        // the manager closing.
        let tables: Vec<_> = self.registry.read().tables_by_id.values().cloned().collect();
        self.abort_and_wait_for_all_tasks(&tables).await;
    }

    /// Whether `init` completed and `shutdown` has not begun.
    pub fn is_initialized(&self) -> bool {
        self.leader.state() == CatalogState::Running
    }

    /// Whether this master runs without a catalog tablet.
    pub fn is_shell_mode(&self) -> bool {
        self.shell_mode.load(Ordering::Acquire)
    }

    /// Admission gate for one catalog operation.
    pub fn leader_shared_lock(&self) -> Result<LeaderGuard> {
        self.leader
            .try_shared(self.is_shell_mode(), self.consensus.as_ref())
    }

    pub(crate) fn enable_bg_tasks(self: &Arc<Self>) {
        let mut slot = self.background.lock();
        if slot.is_none() {
            *slot = Some(BackgroundTasks::start(
                Arc::downgrade(self) as Weak<Self>,
                self.config.bg_task_wait(),
            ));
        }
    }

    /// Wake the background loop; called after mutations that queued work.
    pub(crate) fn wake_bg_tasks(&self) {
        if let Some(background) = self.background.lock().as_ref() {
            background.wake();
        }
    }

    /// Wake the background loop only if there are pending updates.
    pub(crate) fn wake_bg_tasks_if_pending(&self) {
        if let Some(background) = self.background.lock().as_ref() {
            background.wake_if_has_pending_updates();
        }
    }

    pub(crate) async fn abort_and_wait_for_all_tasks(&self, tables: &[Arc<TableInfo>]) {
        for table in tables {
            table.tasks().abort_all();
        }
        futures::future::join_all(tables.iter().map(|table| table.tasks().wait_completion())).await;
    }

    /// Downgrade `error` to ServiceUnavailable when it coincides with losing
    /// leadership.
    pub(crate) fn check_if_no_longer_leader(&self, error: Error) -> Error {
        check_if_no_longer_leader(error, self.consensus.as_ref())
    }

    /// Generate an id no entity of this kind uses yet.
    pub(crate) fn generate_unique_id<T, F>(mut exists: F) -> T
    where
        T: UniqueId,
        F: FnMut(&T) -> bool,
    {
        loop {
            let id = T::generate_id();
            if !exists(&id) {
                return id;
            }
        }
    }

    /// The cluster-config singleton; present whenever a leader finished
    /// loading.
    pub(crate) fn cluster_config_info(
        &self,
    ) -> Result<Arc<crate::entity::ClusterConfigInfo>> {
        self.registry.read().cluster_config().ok_or_else(|| {
            IllegalStateSnafu {
                msg: "cluster config has not been loaded",
            }
            .build()
        })
    }

    /// The effective default replication factor.
    pub fn replication_factor(&self) -> Result<usize> {
        let config = self.cluster_config_info()?;
        let n = config.metadata().read().replication_info.live_replicas.num_replicas;
        Ok(if n > 0 { n } else { self.config.replication_factor })
    }

    /// Name of a namespace, or empty when unknown.
    pub fn namespace_name(&self, id: &NamespaceId) -> String {
        self.registry
            .read()
            .namespace_by_id(id)
            .map(|ns| ns.name())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Cluster config
    // ------------------------------------------------------------------

    /// Read the cluster config.
    pub fn get_cluster_config(&self) -> Result<ClusterConfigMetadata> {
        let _l = self.leader_shared_lock()?;
        let config = self.cluster_config_info()?;
        Ok(ClusterConfigMetadata::clone(&config.metadata().read()))
    }

    /// Compare-and-swap the cluster config on its version.
    pub async fn set_cluster_config(&self, req: ChangeClusterConfigRequest) -> Result<()> {
        let _l = self.leader_shared_lock()?;
        let mut new_config = req.cluster_config;

        // Snapshot the load currently hosted on the new blacklist so that
        // move progress can be reported against it.
        if let Some(blacklist) = new_config.server_blacklist.as_mut() {
            blacklist.initial_replica_load = self.count_blacklist_replicas(&blacklist.hosts);
            info!(
                hosts = blacklist.hosts.len(),
                initial_replica_load = blacklist.initial_replica_load,
                "installing server blacklist"
            );
        }

        let config = self.cluster_config_info()?;
        let mut guard = config.metadata().write().await;

        if guard.committed().version != new_config.version {
            return ConfigVersionMismatchSnafu {
                msg: format!(
                    "Config version does not match, got {}, but most recent one is {}. Should call Get again",
                    new_config.version,
                    guard.committed().version
                ),
            }
            .fail();
        }

        if new_config.cluster_uuid != guard.committed().cluster_uuid {
            return InvalidClusterConfigSnafu {
                msg: "Config cluster UUID cannot be updated",
            }
            .fail();
        }

        let new_version = new_config.version + 1;
        new_config.version = new_version;
        *guard = new_config;

        info!(version = new_version, "updating cluster config");
        if let Err(e) = self
            .sys_store
            .update_item(SysEntry::ClusterConfig {
                metadata: ClusterConfigMetadata::clone(&guard),
            })
            .await
        {
            return Err(self.check_if_no_longer_leader(e));
        }
        guard.commit();
        Ok(())
    }

    /// Number of tablet replicas currently hosted on any of `hosts`.
    fn count_blacklist_replicas(&self, hosts: &[HostPort]) -> i64 {
        let blacklisted: HashSet<&HostPort> = hosts.iter().collect();
        let tablets: Vec<Arc<TabletInfo>> = self
            .registry
            .read()
            .tablets_by_id
            .values()
            .cloned()
            .collect();

        let mut count = 0;
        for tablet in tablets {
            // Creating tablets count on purpose so the initial load is not
            // under-accounted.
            if tablet.table().is_none() || tablet.metadata().read().is_deleted() {
                continue;
            }
            for replica in tablet.replica_locations().values() {
                let on_blacklist = replica
                    .ts
                    .registration()
                    .rpc_addresses
                    .iter()
                    .any(|addr| blacklisted.contains(addr));
                if on_blacklist {
                    count += 1;
                }
            }
        }
        count
    }

    /// Whether replica counts across live servers are balanced.
    pub fn is_load_balanced(&self, req: IsLoadBalancedRequest) -> Result<()> {
        let _l = self.leader_shared_lock()?;
        let ts_descs = self.ts_manager.live_descriptors();

        if let Some(expected) = req.expected_num_servers {
            if expected > ts_descs.len() {
                return TryAgainSnafu {
                    msg: format!(
                        "Found {}, which is below the expected number of servers {expected}",
                        ts_descs.len()
                    ),
                }
                .fail();
            }
        }

        let load: Vec<f64> = ts_descs
            .iter()
            .map(|ts| ts.num_live_replicas() as f64)
            .collect();
        let std_dev = standard_deviation(&load);
        info!(std_dev, num_servers = ts_descs.len(), "load check");
        if std_dev >= 2.0 {
            return TryAgainSnafu {
                msg: format!("Load not balanced: deviation={std_dev}"),
            }
            .fail();
        }
        Ok(())
    }

    /// Progress of load moving off the blacklisted servers.
    pub fn get_load_move_completion_percent(&self) -> Result<GetLoadMovePercentResponse> {
        let _l = self.leader_shared_lock()?;
        let config = self.cluster_config_info()?;
        let blacklist = config.metadata().read().server_blacklist.clone();
        let Some(Blacklist {
            hosts,
            initial_replica_load,
        }) = blacklist
        else {
            return Ok(GetLoadMovePercentResponse { percent: 100.0 });
        };

        // A blacklist whose servers never held load is already done.
        if initial_replica_load == 0 {
            return Ok(GetLoadMovePercentResponse { percent: 100.0 });
        }

        let current = self.count_blacklist_replicas(&hosts);
        Ok(GetLoadMovePercentResponse {
            percent: 100.0 - (current as f64 * 100.0 / initial_replica_load as f64),
        })
    }

    // ------------------------------------------------------------------
    // Shell mode / remote bootstrap
    // ------------------------------------------------------------------

    /// Detach from the catalog tablet and refuse catalog operations until a
    /// remote bootstrap re-arms this master.
    pub async fn go_into_shell_mode(&self) -> Result<()> {
        if self.is_shell_mode() {
            return IllegalStateSnafu {
                msg: "Master is already in shell mode",
            }
            .fail();
        }

        info!("going into shell mode");
        self.shell_mode.store(true, Ordering::Release);

        let background = self.background.lock().take();
        if let Some(background) = background {
            background.shutdown().await;
        }
        self.registry.write().clear();
        self.leader.set_leader_ready_term(-1);
        info!("done going into shell mode");
        Ok(())
    }

    /// Adopt a catalog tablet copied from a peer. Only legal in shell mode.
    pub async fn start_remote_bootstrap(
        self: &Arc<Self>,
        req: StartRemoteBootstrapRequest,
    ) -> Result<()> {
        let Ok(_bootstrap_guard) = self.remote_bootstrap_lock.try_lock() else {
            return IllegalStateSnafu {
                msg: "Remote bootstrap of the catalog tablet already in progress",
            }
            .fail();
        };

        if !self.is_shell_mode() {
            return IllegalStateSnafu {
                msg: "Cannot bootstrap a master which is not in shell mode",
            }
            .fail();
        }

        let source = self.bootstrap_source.as_ref().ok_or_else(|| {
            IllegalStateSnafu {
                msg: "no remote bootstrap source configured",
            }
            .build()
        })?;

        info!(
            peer = %req.bootstrap_peer_uuid,
            addr = %req.bootstrap_peer_addr,
            caller_term = req.caller_term,
            "starting remote bootstrap of the catalog tablet"
        );

        let entries = source
            .fetch_catalog_snapshot(&req.bootstrap_peer_uuid, &req.bootstrap_peer_addr)
            .await
            .map_err(|e| Error::RemoteError { msg: e.to_string() })?;
        self.sys_store.install_snapshot(entries);

        self.shell_mode.store(false, Ordering::Release);
        self.enable_bg_tasks();
        info!("master completed remote bootstrap and is out of shell mode");
        Ok(())
    }

    /// Export the committed catalog entries. Donor side of a remote
    /// bootstrap.
    pub fn catalog_snapshot(&self) -> Vec<SysEntry> {
        self.sys_store.snapshot()
    }

    // ------------------------------------------------------------------
    // Outbound tasks
    // ------------------------------------------------------------------

    /// Fan create-replica requests out to every peer of every new tablet.
    pub(crate) fn send_create_tablet_requests(&self, tablets: &[Arc<TabletInfo>]) {
        for tablet in tablets {
            let meta = tablet.metadata().read();
            let Some(table) = tablet.table() else { continue };
            let table_meta = table.metadata().read();

            tablet.set_last_update_time(self.time_provider.now());
            for peer in &meta.committed_consensus_state.config.peers {
                let Some(ts) = self.ts_manager.lookup(&peer.permanent_uuid) else {
                    warn!(peer = %peer.permanent_uuid, tablet = %tablet.id(), "chosen server vanished before create");
                    continue;
                };
                let req = CreateReplicaRequest {
                    tablet_id: tablet.id().clone(),
                    table_id: table.id().clone(),
                    table_name: table_meta.name.clone(),
                    schema: table_meta.schema.clone(),
                    schema_version: table_meta.version,
                    partition_schema: table_meta.partition_schema,
                    partition: meta.partition.clone(),
                    config: meta.committed_consensus_state.config.clone(),
                };
                self.spawn_create_replica_task(table, ts, req);
            }
        }
    }

    fn spawn_create_replica_task(
        &self,
        table: &Arc<TableInfo>,
        ts: Arc<TsDescriptor>,
        req: CreateReplicaRequest,
    ) {
        let rpc = Arc::clone(&self.rpc);
        let rpc_timeout = self.config.ts_rpc_timeout();
        let description = format!("create replica of {} on {}", req.tablet_id, ts.permanent_uuid());
        table.tasks().spawn(description.clone(), |cancel| async move {
            let mut delay = RetryDelay::new();
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let attempt =
                    tokio::time::timeout(rpc_timeout, rpc.create_replica(&ts, req.clone())).await;
                match attempt {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => warn!(task = %description, error = %e, "create replica failed, retrying"),
                    Err(_) => warn!(task = %description, "create replica timed out, retrying"),
                }
                tokio::time::sleep(delay.next()).await;
            }
        });
    }

    /// Ask one server to drop (or tombstone) one replica.
    pub(crate) fn send_delete_replica_request(
        &self,
        tablet_id: &TabletId,
        delete_type: TabletDataState,
        cas_config_opid_index_less_or_equal: Option<i64>,
        table: Option<&Arc<TableInfo>>,
        ts: Arc<TsDescriptor>,
        reason: impl Into<String>,
    ) {
        let reason = reason.into();
        info!(
            tablet = %tablet_id,
            peer = %ts.permanent_uuid(),
            ?delete_type,
            %reason,
            "deleting tablet replica"
        );

        let rpc = Arc::clone(&self.rpc);
        let rpc_timeout = self.config.ts_rpc_timeout();
        let req = DeleteReplicaRequest {
            tablet_id: tablet_id.clone(),
            delete_type,
            cas_config_opid_index_less_or_equal,
            reason,
        };
        ts.add_pending_tablet_delete(tablet_id.clone());

        let description = format!("delete replica of {} on {}", tablet_id, ts.permanent_uuid());
        let run = |cancel: tokio_util::sync::CancellationToken| async move {
            let mut delay = RetryDelay::new();
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let attempt =
                    tokio::time::timeout(rpc_timeout, rpc.delete_replica(&ts, req.clone())).await;
                match attempt {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => warn!(task = %description, error = %e, "delete replica failed, retrying"),
                    Err(_) => warn!(task = %description, "delete replica timed out, retrying"),
                }
                tokio::time::sleep(delay.next()).await;
            }
        };

        match table {
            Some(table) => table.tasks().spawn("delete replica", run),
            None => {
                // Orphan tablets have no owning table to track the task; it
                // is still cancel-safe via its own token.
                tokio::spawn(run(tokio_util::sync::CancellationToken::new()));
            }
        }
    }

    /// Drop every currently known replica of `tablet`.
    pub(crate) fn delete_tablet_replicas(&self, tablet: &TabletInfo, reason: &str) {
        let locations = tablet.replica_locations();
        info!(
            tablet = %tablet.id(),
            replicas = locations.len(),
            "sending DeleteTablet to all replicas"
        );
        let table = self
            .registry
            .read()
            .table_by_id(&tablet.metadata().read().table_id);
        for replica in locations.values() {
            self.send_delete_replica_request(
                tablet.id(),
                TabletDataState::Deleted,
                None,
                table.as_ref(),
                Arc::clone(&replica.ts),
                reason,
            );
        }
    }

    /// Push the table's current schema to every tablet.
    pub(crate) fn send_alter_table_request(&self, table: &Arc<TableInfo>) {
        for tablet in table.all_tablets() {
            self.send_alter_tablet_request(table, &tablet);
        }
    }

    /// Push the table's current schema to the leader replica of one tablet.
    pub(crate) fn send_alter_tablet_request(&self, table: &Arc<TableInfo>, tablet: &Arc<TabletInfo>) {
        let table_meta = table.metadata().read();
        let req = AlterReplicaRequest {
            tablet_id: tablet.id().clone(),
            schema: table_meta.schema.clone(),
            schema_version: table_meta.version,
        };

        let rpc = Arc::clone(&self.rpc);
        let rpc_timeout = self.config.ts_rpc_timeout();
        let tablet = Arc::clone(tablet);
        let description = format!("alter tablet {} to v{}", req.tablet_id, req.schema_version);
        table.tasks().spawn(description.clone(), |cancel| async move {
            let mut delay = RetryDelay::new();
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                // The leader may change between retries; re-pick every time.
                let leader = tablet
                    .replica_locations()
                    .values()
                    .find(|r| r.role == data_types::PeerRole::Leader)
                    .map(|r| Arc::clone(&r.ts));
                if let Some(ts) = leader {
                    let attempt =
                        tokio::time::timeout(rpc_timeout, rpc.alter_replica(&ts, req.clone()))
                            .await;
                    match attempt {
                        Ok(Ok(())) => return,
                        Ok(Err(e)) => {
                            warn!(task = %description, error = %e, "alter tablet failed, retrying")
                        }
                        Err(_) => warn!(task = %description, "alter tablet timed out, retrying"),
                    }
                } else {
                    warn!(task = %description, "no leader known yet, retrying");
                }
                tokio::time::sleep(delay.next()).await;
            }
        });
    }

    /// Log fleet-level gauges; the background loop calls this every pass.
    pub(crate) fn report_metrics(&self) {
        let live = self.ts_manager.live_descriptors();
        info!(num_tablet_servers_live = live.len(), "cluster state");
        for ts in &live {
            ts.decay_recent_replica_creations();
        }
    }
}

/// Ids that can be generated by rejection sampling.
pub(crate) trait UniqueId {
    /// A fresh random id.
    fn generate_id() -> Self;
}

macro_rules! unique_id {
    ($t:ty) => {
        impl UniqueId for $t {
            fn generate_id() -> Self {
                Self::generate()
            }
        }
    };
}
unique_id!(TableId);
unique_id!(TabletId);
unique_id!(NamespaceId);
unique_id!(TypeId);

/// Population standard deviation.
fn standard_deviation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Generate the uuid for a cluster config created from scratch, honoring the
/// configured override.
pub(crate) fn new_cluster_uuid(config: &MasterConfig) -> String {
    if config.cluster_uuid.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        config.cluster_uuid.clone()
    }
}

pub(crate) fn table_entry(id: &TableId, metadata: &TableMetadata) -> SysEntry {
    SysEntry::Table {
        id: id.clone(),
        metadata: metadata.clone(),
    }
}

pub(crate) fn tablet_entry(id: &TabletId, metadata: &TabletMetadata) -> SysEntry {
    SysEntry::Tablet {
        id: id.clone(),
        metadata: metadata.clone(),
    }
}

pub(crate) fn namespace_entry(id: &NamespaceId, metadata: &NamespaceMetadata) -> SysEntry {
    SysEntry::Namespace {
        id: id.clone(),
        metadata: metadata.clone(),
    }
}

pub(crate) fn udt_entry(id: &TypeId, metadata: &UdtMetadata) -> SysEntry {
    SysEntry::UdType {
        id: id.clone(),
        metadata: metadata.clone(),
    }
}

pub(crate) fn role_entry(name: &RoleName, metadata: &RoleMetadata) -> SysEntry {
    SysEntry::Role {
        name: name.clone(),
        metadata: metadata.clone(),
    }
}
