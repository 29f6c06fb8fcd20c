//! Rebuilds the in-memory registry from the sys catalog on every leader
//! election, and seeds the defaults a fresh cluster needs: the bootstrap
//! namespaces, the virtual system tables, the default role and an empty
//! cluster config.

use crate::catalog::{
    namespace_entry, new_cluster_uuid, role_entry, table_entry, tablet_entry, CatalogManager,
};
use crate::entity::{ClusterConfigInfo, NamespaceInfo, RoleInfo, TableInfo, TabletInfo, UdtInfo};
use crate::error::{CorruptionSnafu, Error, IllegalStateSnafu, Result};
use crate::sys_store::{EntityKind, SysEntry};
use data_types::{
    ClusterConfigMetadata, ColumnId, ColumnSchema, ConsensusState, DataType, NamespaceId,
    NamespaceMetadata, PartitionSchema, PeerRole, ReplicationInfo, RoleMetadata, RoleName,
    TableMetadata, TableSchema, TableState, TableType, TabletMetadata, TabletState,
};
use observability_deps::tracing::{error, info, warn};
use std::sync::Arc;

pub(crate) const DEFAULT_NAMESPACE_NAME: &str = "default";
pub(crate) const DEFAULT_NAMESPACE_ID: &str = "00000000000000000000000000000001";
pub(crate) const SYSTEM_NAMESPACE_NAME: &str = "system";
pub(crate) const SYSTEM_NAMESPACE_ID: &str = "00000000000000000000000000000002";
pub(crate) const SYSTEM_SCHEMA_NAMESPACE_NAME: &str = "system_schema";
pub(crate) const SYSTEM_SCHEMA_NAMESPACE_ID: &str = "00000000000000000000000000000003";
pub(crate) const SYSTEM_AUTH_NAMESPACE_NAME: &str = "system_auth";
pub(crate) const SYSTEM_AUTH_NAMESPACE_ID: &str = "00000000000000000000000000000004";

/// Namespaces whose tables are virtual and served by the masters.
pub(crate) const SYSTEM_NAMESPACE_IDS: [&str; 3] = [
    SYSTEM_NAMESPACE_ID,
    SYSTEM_SCHEMA_NAMESPACE_ID,
    SYSTEM_AUTH_NAMESPACE_ID,
];

pub(crate) const DEFAULT_ROLE_NAME: &str = "cassandra";
const DEFAULT_ROLE_PASSWORD: &str = "cassandra";

impl CatalogManager {
    /// Leader-elected callback: reload the catalog on a background task.
    pub fn elected_as_leader(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.load_sys_catalog_data().await;
        });
    }

    /// Wait until this node caught up as leader, then rebuild the registry
    /// from the sys catalog and publish the leader-ready term.
    pub async fn load_sys_catalog_data(&self) {
        let term = self.consensus.active_consensus_state().current_term;
        let catchup = self.config.failover_catchup_timeout();

        if let Err(e) = self.consensus.wait_until_caught_up(catchup).await {
            let term_after_wait = self.consensus.active_consensus_state().current_term;
            if term_after_wait != term {
                // Elected again while catching up; the next callback reloads.
                info!(
                    term,
                    term_after_wait,
                    "term changed while waiting for leader catchup; not loading sys catalog"
                );
                return;
            }
            warn!(error = %e, "failed waiting for node to catch up after master election");
            if matches!(e, Error::TimedOut { .. }) {
                panic!("shutting down due to unavailability of other masters after election");
            }
            return;
        }

        let term_after_wait = self.consensus.active_consensus_state().current_term;
        if term_after_wait != term {
            info!(
                term,
                term_after_wait,
                "term changed while waiting for leader catchup; not loading sys catalog"
            );
            return;
        }

        info!(term, "loading table and tablet metadata into memory");
        if let Err(e) = self.visit_sys_catalog().await {
            if self.consensus.role() != PeerRole::Leader {
                info!(
                    error = %e,
                    "error loading sys catalog; that's OK as we are not the leader anymore"
                );
                return;
            }
            panic!("failed to load the sys catalog while still leader: {e}");
        }

        self.leader.set_leader_ready_term(term);
        info!(term, "completed load of sys catalog");
    }

    /// Block new catalog operations, wait for existing ones, then clear and
    /// rebuild every registry index.
    pub(crate) async fn visit_sys_catalog(&self) -> Result<()> {
        info!("waiting on the leader lock for any existing operations to finish");
        let _exclusive = self.leader.exclusive().await;

        // All table infos are orphaned below, so their tasks must end first.
        let tables: Vec<_> = self.registry.read().tables_by_id.values().cloned().collect();
        self.abort_and_wait_for_all_tasks(&tables).await;

        self.run_loaders()?;

        self.prepare_default_namespaces().await?;
        self.prepare_system_tables().await?;
        self.prepare_default_roles().await?;
        self.prepare_default_cluster_config().await?;

        Ok(())
    }

    /// Clear the maps and replay every persisted record into them. The
    /// exclusive leader lock is held by the caller, so the registry lock can
    /// be kept across the whole synchronous rebuild.
    fn run_loaders(&self) -> Result<()> {
        let mut maps = self.registry.write();
        maps.clear();

        // Heartbeats processed before the rebuild carried state for the old
        // term; require full reports again.
        for ts in self.ts_manager.all_descriptors() {
            ts.set_has_tablet_report(false);
        }

        let now = self.time_provider.now();

        info!("loading tables into memory");
        self.sys_store.visit(EntityKind::Table, |entry| {
            let SysEntry::Table { id, metadata } = entry else {
                return CorruptionSnafu { msg: "table visitor got a non-table entry" }.fail();
            };
            if maps.tables_by_id.contains_key(id) {
                return CorruptionSnafu {
                    msg: format!("table already exists: {id}"),
                }
                .fail();
            }
            let table = Arc::new(TableInfo::new(id.clone(), metadata.clone()));
            maps.tables_by_id.insert(id.clone(), Arc::clone(&table));
            // DELETING tables keep their name reserved; it frees at DELETED.
            if !metadata.is_deleted() && !metadata.name.is_empty() {
                maps.tables_by_name.insert(
                    (metadata.namespace_id.clone(), metadata.name.clone()),
                    table,
                );
            }
            info!(table = %id, name = %metadata.name, "loaded metadata for table");
            Ok(())
        })?;

        info!("loading tablets into memory");
        self.sys_store.visit(EntityKind::Tablet, |entry| {
            let SysEntry::Tablet { id, metadata } = entry else {
                return CorruptionSnafu { msg: "tablet visitor got a non-tablet entry" }.fail();
            };
            if maps.tablets_by_id.contains_key(id) {
                return IllegalStateSnafu {
                    msg: format!("loaded tablet that is already in the map: {id}"),
                }
                .fail();
            }

            let table = maps.table_by_id(&metadata.table_id);
            let Some(table) = table else {
                if metadata.state == TabletState::Preparing {
                    // Probably a failed table creation whose table row never
                    // made it; the replicas (if any) will be told to delete.
                    warn!(
                        tablet = %id,
                        table = %metadata.table_id,
                        "missing table required by tablet (probably a failed table creation)"
                    );
                    let tablet = Arc::new(TabletInfo::new(id.clone(), None, metadata.clone(), now));
                    maps.tablets_by_id.insert(id.clone(), tablet);
                    return Ok(());
                }
                error!(tablet = %id, table = %metadata.table_id, "missing table required by tablet");
                return CorruptionSnafu {
                    msg: format!("missing table for tablet: {id}"),
                }
                .fail();
            };

            let tablet = Arc::new(TabletInfo::new(
                id.clone(),
                Some(Arc::clone(&table)),
                metadata.clone(),
                now,
            ));
            maps.tablets_by_id.insert(id.clone(), Arc::clone(&tablet));
            if !metadata.is_deleted() {
                table.add_tablet(tablet);
            }
            info!(tablet = %id, table = %metadata.table_id, "loaded metadata for tablet");
            Ok(())
        })?;

        info!("loading namespaces into memory");
        self.sys_store.visit(EntityKind::Namespace, |entry| {
            let SysEntry::Namespace { id, metadata } = entry else {
                return CorruptionSnafu { msg: "namespace visitor got a non-namespace entry" }.fail();
            };
            if maps.namespaces_by_id.contains_key(id) {
                return CorruptionSnafu {
                    msg: format!("namespace already exists: {id}"),
                }
                .fail();
            }
            let ns = Arc::new(NamespaceInfo::new(id.clone(), metadata.clone()));
            maps.namespaces_by_id.insert(id.clone(), Arc::clone(&ns));
            if !metadata.name.is_empty() {
                maps.namespaces_by_name.insert(metadata.name.clone(), ns);
            }
            info!(namespace = %id, name = %metadata.name, "loaded metadata for namespace");
            Ok(())
        })?;

        info!("loading user-defined types into memory");
        self.sys_store.visit(EntityKind::UdType, |entry| {
            let SysEntry::UdType { id, metadata } = entry else {
                return CorruptionSnafu { msg: "type visitor got a non-type entry" }.fail();
            };
            if maps.udts_by_id.contains_key(id) {
                return CorruptionSnafu {
                    msg: format!("type already exists: {id}"),
                }
                .fail();
            }
            let udt = Arc::new(UdtInfo::new(id.clone(), metadata.clone()));
            maps.udts_by_id.insert(id.clone(), Arc::clone(&udt));
            if !metadata.name.is_empty() {
                maps.udts_by_name.insert(
                    (metadata.namespace_id.clone(), metadata.name.clone()),
                    udt,
                );
            }
            info!(udt = %id, name = %metadata.name, "loaded metadata for type");
            Ok(())
        })?;

        info!("loading cluster configuration into memory");
        self.sys_store.visit(EntityKind::ClusterConfig, |entry| {
            let SysEntry::ClusterConfig { metadata } = entry else {
                return CorruptionSnafu { msg: "config visitor got a non-config entry" }.fail();
            };
            if maps.cluster_config.is_some() {
                return CorruptionSnafu {
                    msg: "already have cluster config data",
                }
                .fail();
            }
            maps.cluster_config = Some(Arc::new(ClusterConfigInfo::new(metadata.clone())));
            Ok(())
        })?;

        info!("loading roles into memory");
        self.sys_store.visit(EntityKind::Role, |entry| {
            let SysEntry::Role { name, metadata } = entry else {
                return CorruptionSnafu { msg: "role visitor got a non-role entry" }.fail();
            };
            if maps.roles_by_name.contains_key(name) {
                return CorruptionSnafu {
                    msg: format!("role already exists: {name}"),
                }
                .fail();
            }
            maps.roles_by_name
                .insert(name.clone(), Arc::new(RoleInfo::new(name.clone(), metadata.clone())));
            info!(role = %name, "loaded metadata for role");
            Ok(())
        })?;

        Ok(())
    }

    async fn prepare_default_namespaces(&self) -> Result<()> {
        for (name, id) in [
            (DEFAULT_NAMESPACE_NAME, DEFAULT_NAMESPACE_ID),
            (SYSTEM_NAMESPACE_NAME, SYSTEM_NAMESPACE_ID),
            (SYSTEM_SCHEMA_NAMESPACE_NAME, SYSTEM_SCHEMA_NAMESPACE_ID),
            (SYSTEM_AUTH_NAMESPACE_NAME, SYSTEM_AUTH_NAMESPACE_ID),
        ] {
            self.prepare_namespace(name, NamespaceId::from(id)).await?;
        }
        Ok(())
    }

    async fn prepare_namespace(&self, name: &str, id: NamespaceId) -> Result<()> {
        if self.registry.read().namespace_by_name(name).is_some() {
            info!(name, "namespace already created, skipping initialization");
            return Ok(());
        }

        let metadata = NamespaceMetadata { name: name.into() };
        self.sys_store.add_item(namespace_entry(&id, &metadata)).await?;

        let ns = Arc::new(NamespaceInfo::new(id.clone(), metadata));
        let mut maps = self.registry.write();
        maps.namespaces_by_id.insert(id, Arc::clone(&ns));
        maps.namespaces_by_name.insert(name.into(), ns);
        info!(name, "created default namespace");
        Ok(())
    }

    async fn prepare_system_tables(&self) -> Result<()> {
        for def in system_table_definitions() {
            self.prepare_system_table(def).await?;
        }
        Ok(())
    }

    async fn prepare_system_table(&self, def: SystemTableDef) -> Result<()> {
        let namespace_id = NamespaceId::from(def.namespace_id);
        if self
            .registry
            .read()
            .table_by_name(&namespace_id, def.name)
            .is_some()
        {
            info!(
                namespace = def.namespace_name,
                table = def.name,
                "system table already created, skipping initialization"
            );
            return Ok(());
        }

        // Virtual tables are written RUNNING with a single RUNNING tablet so
        // the assignment engine never touches them.
        let table: Arc<TableInfo>;
        let tablet: Arc<TabletInfo>;
        {
            let mut maps = self.registry.write();
            let table_id = Self::generate_unique_id(|id| maps.tables_by_id.contains_key(id));
            let next_column_id = ColumnId::new(def.schema.columns().len() as i32);
            table = Arc::new(TableInfo::new(
                table_id,
                TableMetadata {
                    name: def.name.into(),
                    namespace_id: namespace_id.clone(),
                    table_type: TableType::HashTable,
                    state: TableState::Running,
                    state_msg: "system table".into(),
                    schema: def.schema,
                    version: 0,
                    next_column_id,
                    partition_schema: PartitionSchema::MultiColumnHash,
                    replication_info: ReplicationInfo::default(),
                    fully_applied_schema: None,
                },
            ));
            maps.tables_by_id
                .insert(table.id().clone(), Arc::clone(&table));
            maps.tables_by_name
                .insert((namespace_id, def.name.into()), Arc::clone(&table));

            let tablet_id = Self::generate_unique_id(|id| maps.tablets_by_id.contains_key(id));
            let partition = PartitionSchema::MultiColumnHash
                .create_partitions(1, &[])
                .expect("single partition")
                .remove(0);
            tablet = Arc::new(TabletInfo::new(
                tablet_id,
                Some(Arc::clone(&table)),
                TabletMetadata {
                    table_id: table.id().clone(),
                    partition,
                    state: TabletState::Running,
                    state_msg: "system tablet".into(),
                    committed_consensus_state: ConsensusState::default(),
                },
                self.time_provider.now(),
            ));
            maps.tablets_by_id
                .insert(tablet.id().clone(), Arc::clone(&tablet));
            table.add_tablet(Arc::clone(&tablet));
        }

        let entries = vec![
            tablet_entry(tablet.id(), &tablet.metadata().read()),
            table_entry(table.id(), &table.metadata().read()),
        ];
        if let Err(e) = self.sys_store.add_items(entries).await {
            let meta = table.metadata().read();
            let mut maps = self.registry.write();
            maps.tablets_by_id.remove(tablet.id());
            maps.tables_by_name
                .remove(&(meta.namespace_id.clone(), meta.name.clone()));
            maps.tables_by_id.remove(table.id());
            return Err(e);
        }

        info!(
            namespace = def.namespace_name,
            table = def.name,
            "created system table"
        );
        Ok(())
    }

    async fn prepare_default_roles(&self) -> Result<()> {
        let role = RoleName::from(DEFAULT_ROLE_NAME);
        if self.registry.read().roles_by_name.contains_key(&role) {
            info!(role = DEFAULT_ROLE_NAME, "role already created, skipping initialization");
            return Ok(());
        }

        let salted_hash =
            bcrypt::hash(DEFAULT_ROLE_PASSWORD, bcrypt::DEFAULT_COST).map_err(|e| {
                IllegalStateSnafu {
                    msg: format!("could not hash password: {e}"),
                }
                .build()
            })?;
        let metadata = RoleMetadata {
            role: role.clone(),
            can_login: true,
            is_superuser: true,
            salted_hash,
            member_of: Default::default(),
        };

        self.sys_store.add_item(role_entry(&role, &metadata)).await?;
        self.registry
            .write()
            .roles_by_name
            .insert(role.clone(), Arc::new(RoleInfo::new(role, metadata)));
        info!(role = DEFAULT_ROLE_NAME, "created default role");
        Ok(())
    }

    async fn prepare_default_cluster_config(&self) -> Result<()> {
        if self.registry.read().cluster_config.is_some() {
            info!("cluster configuration already setup, skipping re-initialization");
            return Ok(());
        }

        // First start of this cluster: write an empty version 0.
        let metadata = ClusterConfigMetadata {
            version: 0,
            cluster_uuid: new_cluster_uuid(&self.config),
            replication_info: ReplicationInfo::default(),
            server_blacklist: None,
        };
        self.sys_store
            .add_item(SysEntry::ClusterConfig {
                metadata: metadata.clone(),
            })
            .await?;
        self.registry.write().cluster_config = Some(Arc::new(ClusterConfigInfo::new(metadata)));
        Ok(())
    }
}

#[derive(Debug)]
struct SystemTableDef {
    namespace_id: &'static str,
    namespace_name: &'static str,
    name: &'static str,
    schema: TableSchema,
}

fn system_column(id: i32, name: &str, data_type: DataType, is_key: bool) -> ColumnSchema {
    ColumnSchema {
        id: ColumnId::new(id),
        name: name.into(),
        data_type,
        is_nullable: !is_key,
        is_key,
        is_hash_key: is_key && id == 0,
        read_default: None,
    }
}

fn system_table_definitions() -> Vec<SystemTableDef> {
    let schema = |columns: Vec<ColumnSchema>| TableSchema::new(columns).expect("system schema");
    vec![
        SystemTableDef {
            namespace_id: SYSTEM_NAMESPACE_ID,
            namespace_name: SYSTEM_NAMESPACE_NAME,
            name: "peers",
            schema: schema(vec![
                system_column(0, "peer", DataType::String, true),
                system_column(1, "rpc_address", DataType::String, false),
            ]),
        },
        SystemTableDef {
            namespace_id: SYSTEM_NAMESPACE_ID,
            namespace_name: SYSTEM_NAMESPACE_NAME,
            name: "local",
            schema: schema(vec![
                system_column(0, "key", DataType::String, true),
                system_column(1, "bootstrapped", DataType::String, false),
            ]),
        },
        SystemTableDef {
            namespace_id: SYSTEM_SCHEMA_NAMESPACE_ID,
            namespace_name: SYSTEM_SCHEMA_NAMESPACE_NAME,
            name: "keyspaces",
            schema: schema(vec![
                system_column(0, "keyspace_name", DataType::String, true),
                system_column(1, "durable_writes", DataType::Bool, false),
            ]),
        },
        SystemTableDef {
            namespace_id: SYSTEM_SCHEMA_NAMESPACE_ID,
            namespace_name: SYSTEM_SCHEMA_NAMESPACE_NAME,
            name: "tables",
            schema: schema(vec![
                system_column(0, "keyspace_name", DataType::String, true),
                system_column(1, "table_name", DataType::String, true),
                system_column(2, "flags", DataType::String, false),
            ]),
        },
        SystemTableDef {
            namespace_id: SYSTEM_SCHEMA_NAMESPACE_ID,
            namespace_name: SYSTEM_SCHEMA_NAMESPACE_NAME,
            name: "columns",
            schema: schema(vec![
                system_column(0, "keyspace_name", DataType::String, true),
                system_column(1, "table_name", DataType::String, true),
                system_column(2, "column_name", DataType::String, true),
                system_column(3, "type", DataType::String, false),
            ]),
        },
        SystemTableDef {
            namespace_id: SYSTEM_AUTH_NAMESPACE_ID,
            namespace_name: SYSTEM_AUTH_NAMESPACE_NAME,
            name: "roles",
            schema: schema(vec![
                system_column(0, "role", DataType::String, true),
                system_column(1, "can_login", DataType::Bool, false),
                system_column(2, "is_superuser", DataType::Bool, false),
                system_column(3, "salted_hash", DataType::String, false),
            ]),
        },
    ]
}
