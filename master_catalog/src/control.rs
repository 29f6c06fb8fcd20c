//! Control operations: create/alter/delete/list for tables, namespaces and
//! user-defined types. Every handler runs the same envelope: leader
//! admission, argument validation, draft mutation, persist, commit-or-abort,
//! wake the background loop.

use crate::api::{
    AlterTableStep, AlterTableRequest, ColumnDefinition, CreateNamespaceResponse,
    CreateTableRequest, CreateTableResponse, CreateUdtRequest, CreateUdtResponse,
    DeleteTableResponse, GetTableLocationsRequest, GetTableLocationsResponse,
    GetTableSchemaResponse, IsAlterTableDoneResponse, IsCreateTableDoneResponse,
    IsDeleteTableDoneResponse, ListNamespacesRequest, ListTablesRequest, ListedNamespace,
    ListedTable, NamespaceIdentifier, ReplicaLocation, TableIdentifier, TabletLocations,
    UdtDescription, UdtIdentifier,
};
use crate::catalog::{namespace_entry, table_entry, tablet_entry, udt_entry, CatalogManager};
use crate::entity::{NamespaceInfo, TableInfo, TabletInfo, UdtInfo};
use crate::error::{
    AlreadyPresentSnafu, CannotDeleteDefaultNamespaceSnafu, IllegalStateSnafu,
    InvalidArgumentSnafu, InvalidSchemaSnafu, NamespaceIsNotEmptySnafu, NamespaceNotFoundSnafu,
    NotFoundSnafu, ReplicationFactorTooHighSnafu, Result, ServiceUnavailableSnafu,
    TooManyTabletsSnafu, TypeAlreadyPresentSnafu, TypeNotFoundSnafu,
};
use crate::loader::DEFAULT_NAMESPACE_ID;
use crate::registry::DeletedTableTracker;
use crate::sys_store::EntityKind;
use data_types::{
    ColumnId, ColumnSchema, ConsensusState, NamespaceId, NamespaceMetadata, PartitionSchema,
    ReplicationInfo, SchemaBuilder, TableId, TableMetadata, TableSchema, TableState, TableType,
    TabletId, TabletMetadata, TabletServerId, TabletState, UdtMetadata,
};
use observability_deps::tracing::{info, warn};
use std::sync::Arc;

impl CatalogManager {
    // ------------------------------------------------------------------
    // Lookup helpers
    // ------------------------------------------------------------------

    /// Resolve a namespace identifier; `None` means the default namespace.
    pub(crate) fn resolve_namespace(
        &self,
        identifier: Option<&NamespaceIdentifier>,
    ) -> Result<Arc<NamespaceInfo>> {
        let maps = self.registry.read();
        let ns = match identifier {
            None => maps.namespace_by_id(&NamespaceId::from(DEFAULT_NAMESPACE_ID)),
            Some(NamespaceIdentifier { id: Some(id), .. }) => maps.namespace_by_id(id),
            Some(NamespaceIdentifier {
                name: Some(name), ..
            }) => maps.namespace_by_name(name),
            Some(_) => {
                return NamespaceNotFoundSnafu {
                    msg: "neither namespace id nor namespace name are specified",
                }
                .fail()
            }
        };
        ns.ok_or_else(|| {
            NamespaceNotFoundSnafu {
                msg: format!("namespace {identifier:?} does not exist"),
            }
            .build()
        })
    }

    /// Resolve a table identifier. A lookup through a namespace that does not
    /// exist resolves to "no table" rather than an error.
    pub(crate) fn find_table(&self, identifier: &TableIdentifier) -> Result<Option<Arc<TableInfo>>> {
        if let Some(table_id) = &identifier.table_id {
            return Ok(self.registry.read().table_by_id(table_id));
        }

        let Some(table_name) = &identifier.table_name else {
            return InvalidArgumentSnafu {
                msg: "neither table id nor table name are specified",
            }
            .fail();
        };

        let namespace_id = match &identifier.namespace {
            None => NamespaceId::from(DEFAULT_NAMESPACE_ID),
            Some(NamespaceIdentifier { id: Some(id), .. }) => id.clone(),
            Some(NamespaceIdentifier {
                name: Some(name), ..
            }) => match self.registry.read().namespace_by_name(name) {
                Some(ns) => ns.id().clone(),
                None => return Ok(None),
            },
            Some(_) => {
                return InvalidArgumentSnafu {
                    msg: "neither namespace id nor namespace name are specified",
                }
                .fail()
            }
        };

        Ok(self.registry.read().table_by_name(&namespace_id, table_name))
    }

    fn find_udt(&self, identifier: &UdtIdentifier) -> Result<Option<Arc<UdtInfo>>> {
        if let Some(type_id) = &identifier.type_id {
            return Ok(self.registry.read().udt_by_id(type_id));
        }
        let Some(type_name) = &identifier.type_name else {
            return TypeNotFoundSnafu {
                msg: "no type identifier given",
            }
            .fail();
        };
        let ns = self.resolve_namespace(identifier.namespace.as_ref())?;
        Ok(self.registry.read().udt_by_name(ns.id(), type_name))
    }

    // ------------------------------------------------------------------
    // CreateTable
    // ------------------------------------------------------------------

    /// Create a table and its initial tablets, all in the PREPARING state.
    /// The assignment engine drives them to RUNNING afterwards.
    pub async fn create_table(&self, req: CreateTableRequest) -> Result<CreateTableResponse> {
        let _l = self.leader_shared_lock()?;
        info!(name = %req.name, num_tablets = req.num_tablets, "servicing CreateTable");

        let ns = self.resolve_namespace(req.namespace.as_ref())?;
        let namespace_id = ns.id().clone();

        let schema = self.validate_and_build_schema(&req.columns)?;
        let next_column_id = ColumnId::new(schema.columns().len() as i32);

        // The partition schema is fixed by the table type; hash-key columns
        // force hash partitioning.
        let partition_schema = match req.table_type {
            TableType::KeyValueTable => PartitionSchema::FixedSlotHash,
            TableType::HashTable => PartitionSchema::MultiColumnHash,
            TableType::RangeTable => {
                if schema.num_hash_key_columns() > 0 {
                    PartitionSchema::MultiColumnHash
                } else {
                    PartitionSchema::RangeOnKey
                }
            }
        };
        let partitions = partition_schema.create_partitions(req.num_tablets, &req.split_keys)?;

        // Fall back to the cluster-wide replication settings, then to the
        // configured default factor.
        let requested_placement = req.replication_info.is_some();
        let mut replication_info = match req.replication_info {
            Some(info) => info,
            None => ReplicationInfo::clone(
                &self.cluster_config_info()?.metadata().read().replication_info,
            ),
        };
        if replication_info.live_replicas.num_replicas == 0 {
            replication_info.live_replicas.num_replicas = self.config.replication_factor;
        }
        if requested_placement && !replication_info.live_replicas.placement_blocks.is_empty() {
            let cluster_placement = self
                .cluster_config_info()?
                .metadata()
                .read()
                .replication_info
                .clone();
            if !cluster_placement.live_replicas.placement_blocks.is_empty() {
                return InvalidArgumentSnafu {
                    msg: "cannot set both table and cluster level replication info",
                }
                .fail();
            }
        }

        self.create_table_preflight(&replication_info, partitions.len())?;

        // Insert the table and its tablets under one registry write lock;
        // everything enters in PREPARING.
        let table: Arc<TableInfo>;
        let tablets: Vec<Arc<TabletInfo>>;
        {
            let mut maps = self.registry.write();

            if let Some(existing) = maps.table_by_name(&namespace_id, &req.name) {
                return AlreadyPresentSnafu {
                    msg: format!("table already exists: {}", existing.id()),
                }
                .fail();
            }

            let table_id = Self::generate_unique_id(|id| maps.tables_by_id.contains_key(id));
            table = Arc::new(TableInfo::new(
                table_id,
                TableMetadata {
                    name: req.name.clone(),
                    namespace_id: namespace_id.clone(),
                    table_type: req.table_type,
                    state: TableState::Preparing,
                    state_msg: String::new(),
                    schema,
                    version: 0,
                    next_column_id,
                    partition_schema,
                    replication_info,
                    fully_applied_schema: None,
                },
            ));
            maps.tables_by_id
                .insert(table.id().clone(), Arc::clone(&table));
            maps.tables_by_name
                .insert((namespace_id, req.name.clone()), Arc::clone(&table));

            let now = self.time_provider.now();
            tablets = partitions
                .into_iter()
                .map(|partition| {
                    let tablet_id =
                        Self::generate_unique_id(|id| maps.tablets_by_id.contains_key(id));
                    let tablet = Arc::new(TabletInfo::new(
                        tablet_id,
                        Some(Arc::clone(&table)),
                        TabletMetadata {
                            table_id: table.id().clone(),
                            partition,
                            state: TabletState::Preparing,
                            state_msg: String::new(),
                            committed_consensus_state: ConsensusState::default(),
                        },
                        now,
                    ));
                    maps.tablets_by_id
                        .insert(tablet.id().clone(), Arc::clone(&tablet));
                    tablet
                })
                .collect();
            table.add_tablets(tablets.iter().cloned());
        }

        // Persist table and tablets as one batch; abort the in-memory
        // creation wholesale if the write is refused.
        let mut entries: Vec<_> = tablets
            .iter()
            .map(|t| tablet_entry(t.id(), &t.metadata().read()))
            .collect();
        entries.push(table_entry(table.id(), &table.metadata().read()));
        if let Err(e) = self.sys_store.add_items(entries).await {
            warn!(table = %table.id(), error = %e, "aborting table creation");
            self.abort_table_creation(&table, &tablets).await;
            return Err(self.check_if_no_longer_leader(e));
        }

        info!(table = %table.id(), name = %req.name, "successfully created table");
        self.wake_bg_tasks();

        // Run the assignment tail for the new tablets right away; a failure
        // parks on the table and surfaces through IsCreateTableDone.
        if let Err(e) = self.process_pending_assignments(tablets).await {
            warn!(table = %table.id(), error = %e, "initial tablet assignment failed; will retry");
            table.set_create_table_error(e);
        }

        Ok(CreateTableResponse {
            table_id: table.id().clone(),
        })
    }

    fn validate_and_build_schema(&self, columns: &[ColumnDefinition]) -> Result<TableSchema> {
        if columns.iter().any(|c| c.id.is_some()) {
            return InvalidSchemaSnafu {
                msg: "user requests should not have column ids",
            }
            .fail();
        }
        if !columns.iter().any(|c| c.is_key) {
            return InvalidSchemaSnafu {
                msg: "must specify at least one key column",
            }
            .fail();
        }
        for column in columns.iter().filter(|c| c.is_key) {
            if !column.data_type.is_allowable_in_key() {
                return InvalidSchemaSnafu {
                    msg: format!("invalid datatype for primary key column {}", column.name),
                }
                .fail();
            }
        }

        // Referenced user-defined types must exist. The check is not held
        // across the create transaction; see DeleteUDType for the other half.
        {
            let maps = self.registry.read();
            for column in columns {
                if let Some(udt) = column.data_type.referenced_udt() {
                    if maps.udt_by_id(udt).is_none() {
                        return InvalidSchemaSnafu {
                            msg: format!("referenced user-defined type {udt} not found"),
                        }
                        .fail();
                    }
                }
            }
        }

        let with_ids = columns
            .iter()
            .enumerate()
            .map(|(i, c)| ColumnSchema {
                id: ColumnId::new(i as i32),
                name: c.name.clone(),
                data_type: c.data_type.clone(),
                is_nullable: c.is_nullable,
                is_key: c.is_key,
                is_hash_key: c.is_hash_key,
                read_default: c.read_default.clone(),
            })
            .collect();
        Ok(TableSchema::new(with_ids)?)
    }

    fn create_table_preflight(
        &self,
        replication_info: &ReplicationInfo,
        num_tablets: usize,
    ) -> Result<()> {
        let placement = &replication_info.live_replicas;
        let num_replicas = placement.num_replicas;
        let ts_descs = self.ts_manager.live_descriptors();
        let num_live = ts_descs.len();

        let max_tablets = self.config.max_create_tablets_per_ts * num_live;
        if num_replicas > 1 && max_tablets > 0 && num_tablets > max_tablets {
            return TooManyTabletsSnafu {
                msg: format!(
                    "the requested number of tablets ({num_tablets}) is over the permitted maximum ({max_tablets})"
                ),
            }
            .fail();
        }

        if self.config.catalog_manager_check_ts_count_for_create_table && num_replicas > num_live {
            return ReplicationFactorTooHighSnafu {
                msg: format!(
                    "not enough live tablet servers to create a table with the requested replication factor {num_replicas}; {num_live} tablet servers are alive"
                ),
            }
            .fail();
        }

        if !placement.placement_blocks.is_empty() {
            let minimum_sum: usize = placement
                .placement_blocks
                .iter()
                .map(|b| b.min_num_replicas)
                .sum();
            if minimum_sum > num_replicas {
                return InvalidSchemaSnafu {
                    msg: format!(
                        "sum of required minimum replicas per placement ({minimum_sum}) is greater than num_replicas ({num_replicas})"
                    ),
                }
                .fail();
            }
            self.check_placement_feasibility(placement, &ts_descs)?;
        }
        Ok(())
    }

    async fn abort_table_creation(&self, table: &Arc<TableInfo>, tablets: &[Arc<TabletInfo>]) {
        // No tasks can be pending against a table that failed to create, but
        // aborting is cheap and keeps the invariant obvious.
        table.tasks().abort_all();
        table.tasks().wait_completion().await;

        let meta = table.metadata().read();
        let mut maps = self.registry.write();
        for tablet in tablets {
            maps.tablets_by_id.remove(tablet.id());
        }
        maps.tables_by_name
            .remove(&(meta.namespace_id.clone(), meta.name.clone()));
        maps.tables_by_id.remove(table.id());
    }

    /// Whether the initial tablets of a table all reached RUNNING.
    pub fn is_create_table_done(
        &self,
        identifier: &TableIdentifier,
    ) -> Result<IsCreateTableDoneResponse> {
        let _l = self.leader_shared_lock()?;
        let table = self.find_table(identifier)?.ok_or_else(|| {
            NotFoundSnafu {
                msg: "the table does not exist",
            }
            .build()
        })?;

        let meta = table.metadata().read();
        if meta.started_deleting() {
            return NotFoundSnafu {
                msg: format!("the table was deleted: {}", meta.state_msg),
            }
            .fail();
        }

        // Replica-selection failures park on the table and bubble up here.
        if let Some(error) = table.create_table_error() {
            return Err(error);
        }

        Ok(IsCreateTableDoneResponse {
            done: meta.is_running(),
        })
    }

    // ------------------------------------------------------------------
    // AlterTable
    // ------------------------------------------------------------------

    /// Apply an ordered list of schema-change steps and/or a rename.
    pub async fn alter_table(&self, req: AlterTableRequest) -> Result<()> {
        let _l = self.leader_shared_lock()?;
        info!(table = ?req.table, steps = req.alter_schema_steps.len(), "servicing AlterTable");

        let table = self.find_table(&req.table)?.ok_or_else(|| {
            NotFoundSnafu {
                msg: "the table does not exist",
            }
            .build()
        })?;

        let new_namespace_id = match &req.new_namespace {
            Some(ns) => Some(self.resolve_namespace(Some(ns))?.id().clone()),
            None => None,
        };

        let mut guard = table.metadata().write().await;
        if guard.committed().started_deleting() {
            return NotFoundSnafu {
                msg: format!("the table was deleted: {}", guard.committed().state_msg),
            }
            .fail();
        }

        let old_name = guard.committed().name.clone();
        let old_namespace_id = guard.committed().namespace_id.clone();
        let new_table_name = req.new_table_name.clone().unwrap_or_else(|| old_name.clone());
        let target_namespace_id = new_namespace_id.unwrap_or_else(|| old_namespace_id.clone());

        let mut has_changes = false;

        // Compute the new schema for the on-disk state; nothing is persisted
        // yet.
        let mut new_schema = None;
        let mut next_column_id = guard.committed().next_column_id;
        if !req.alter_schema_steps.is_empty() {
            let (schema, next_id) =
                apply_alter_steps(guard.committed(), &req.alter_schema_steps)?;
            new_schema = Some(schema);
            next_column_id = next_id;
            has_changes = true;
        }
        if let Some(replication_info) = &req.alter_properties {
            guard.replication_info = replication_info.clone();
            has_changes = true;
        }

        // Take the new name first; until the old one is removed the table is
        // reachable under both.
        let renaming = req.new_table_name.is_some() || req.new_namespace.is_some();
        if renaming {
            let mut maps = self.registry.write();
            if let Some(other) = maps.table_by_name(&target_namespace_id, &new_table_name) {
                return AlreadyPresentSnafu {
                    msg: format!("table already exists: {}", other.id()),
                }
                .fail();
            }
            maps.tables_by_name.insert(
                (target_namespace_id.clone(), new_table_name.clone()),
                Arc::clone(&table),
            );
            guard.namespace_id = target_namespace_id.clone();
            guard.name = new_table_name.clone();
            has_changes = true;
        }

        if !has_changes {
            return Ok(());
        }

        if let Some(schema) = new_schema {
            if guard.fully_applied_schema.is_none() {
                guard.fully_applied_schema = Some(guard.committed().schema.clone());
            }
            guard.schema = schema;
        }
        let new_version = guard.committed().version + 1;
        guard.version = new_version;
        guard.next_column_id = next_column_id;
        guard.set_state(
            TableState::Altering,
            format!("alter table version={new_version}"),
        );

        if let Err(e) = self
            .sys_store
            .update_item(table_entry(table.id(), &guard))
            .await
        {
            if renaming {
                self.registry
                    .write()
                    .tables_by_name
                    .remove(&(target_namespace_id, new_table_name));
            }
            // Dropping the guard aborts the draft.
            return Err(self.check_if_no_longer_leader(e));
        }

        if renaming {
            let mut maps = self.registry.write();
            if maps
                .tables_by_name
                .remove(&(old_namespace_id, old_name))
                .is_none()
            {
                warn!(table = %table.id(), "old table name was already gone from the name index");
            }
        }

        guard.commit();

        info!(table = %table.id(), version = new_version, "initiated alter table");
        self.send_alter_table_request(&table);
        Ok(())
    }

    /// Whether the latest alter reached every replica.
    pub fn is_alter_table_done(
        &self,
        identifier: &TableIdentifier,
    ) -> Result<IsAlterTableDoneResponse> {
        let _l = self.leader_shared_lock()?;
        let table = self.find_table(identifier)?.ok_or_else(|| {
            NotFoundSnafu {
                msg: "the table does not exist",
            }
            .build()
        })?;

        let meta = table.metadata().read();
        if meta.started_deleting() {
            return NotFoundSnafu {
                msg: format!("the table was deleted: {}", meta.state_msg),
            }
            .fail();
        }

        Ok(IsAlterTableDoneResponse {
            schema_version: meta.version,
            done: meta.state != TableState::Altering,
        })
    }

    // ------------------------------------------------------------------
    // DeleteTable
    // ------------------------------------------------------------------

    /// Mark a table DELETING and tear its replicas down. The by-id entry
    /// stays until every replica acknowledged.
    pub async fn delete_table(&self, identifier: &TableIdentifier) -> Result<DeleteTableResponse> {
        let _l = self.leader_shared_lock()?;
        info!(table = ?identifier, "servicing DeleteTable");

        let table = self.find_table(identifier)?.ok_or_else(|| {
            NotFoundSnafu {
                msg: "the table does not exist",
            }
            .build()
        })?;

        let mut guard = table.metadata().write().await;
        if guard.committed().started_deleting() {
            return NotFoundSnafu {
                msg: format!("the table was deleted: {}", guard.committed().state_msg),
            }
            .fail();
        }

        guard.set_state(TableState::Deleting, "started deleting");
        if let Err(e) = self
            .sys_store
            .update_item(table_entry(table.id(), &guard))
            .await
        {
            return Err(self.check_if_no_longer_leader(e));
        }

        table.tasks().abort_all();

        // Index the outstanding (server, tablet) deletions so heartbeat acks
        // can drive the table to DELETED.
        let tracker = Arc::new(DeletedTableTracker::new(
            table.id().clone(),
            table.all_tablets().iter().flat_map(|tablet| {
                let tablet_id = tablet.id().clone();
                tablet
                    .replica_locations()
                    .keys()
                    .map(move |uuid| (uuid.clone(), tablet_id.clone()))
                    .collect::<Vec<_>>()
            }),
        ));

        // The name stays taken while the table is DELETING; it frees up only
        // once every replica confirmed deletion.
        {
            let mut maps = self.registry.write();
            for key in tracker.keys() {
                maps.deleted_tablet_index.insert(key, Arc::clone(&tracker));
            }
        }

        guard.commit();

        self.mark_table_deleted_if_no_tablets(&tracker).await;
        self.delete_tablets_and_send_requests(&table).await;

        info!(table = %table.id(), "successfully initiated table deletion");
        self.wake_bg_tasks();
        Ok(DeleteTableResponse {
            table_id: table.id().clone(),
        })
    }

    /// Persist DELETED on every tablet of the table and fan delete requests
    /// out to their replicas.
    async fn delete_tablets_and_send_requests(&self, table: &Arc<TableInfo>) {
        for tablet in table.all_tablets() {
            self.delete_tablet_replicas(&tablet, "table deleted");

            let mut guard = tablet.metadata().write().await;
            guard.set_state(TabletState::Deleted, "table deleted");
            match self
                .sys_store
                .update_item(tablet_entry(tablet.id(), &guard))
                .await
            {
                Ok(()) => guard.commit(),
                Err(e) => {
                    // The background loop re-drives deleted-table tablets.
                    warn!(tablet = %tablet.id(), error = %e, "failed to persist tablet deletion");
                }
            }
        }
    }

    async fn mark_table_deleted_if_no_tablets(&self, tracker: &DeletedTableTracker) {
        if tracker.has_tablets() {
            return;
        }

        let table = self.registry.read().table_by_id(tracker.table_id());
        let Some(table) = table else { return };

        let mut guard = table.metadata().write().await;
        if guard.committed().state != TableState::Deleting {
            return;
        }
        guard.set_state(TableState::Deleted, "all tablet replicas deleted");
        match self
            .sys_store
            .update_item(table_entry(table.id(), &guard))
            .await
        {
            Ok(()) => {
                let namespace_id = guard.namespace_id.clone();
                let name = guard.name.clone();
                guard.commit();
                self.registry
                    .write()
                    .tables_by_name
                    .remove(&(namespace_id, name));
                info!(table = %tracker.table_id(), "table fully deleted");
            }
            Err(e) => {
                warn!(table = %tracker.table_id(), error = %e, "failed to persist table deletion");
            }
        }
    }

    /// Heartbeat-side acknowledgement that one replica finished deleting.
    pub async fn notify_tablet_delete_finished(
        &self,
        ts_uuid: &TabletServerId,
        tablet_id: &TabletId,
    ) {
        let tracker = {
            let mut maps = self.registry.write();
            let key = (ts_uuid.clone(), tablet_id.clone());
            let tracker = maps.deleted_tablet_index.remove(&key);
            if let Some(tracker) = &tracker {
                info!(tablet = %tablet_id, server = %ts_uuid, table = %tracker.table_id(), "replica deletion acknowledged");
                tracker.ack(&key);
            }
            if let Some(tablet) = maps.tablet_by_id(tablet_id) {
                tablet.remove_replica(ts_uuid);
            }
            tracker
        };

        if let Some(tracker) = tracker {
            self.mark_table_deleted_if_no_tablets(&tracker).await;
        }

        if let Some(ts) = self.ts_manager.lookup(ts_uuid) {
            if ts.is_tablet_delete_pending(tablet_id) {
                ts.clear_pending_tablet_delete(tablet_id);
            } else {
                warn!(tablet = %tablet_id, server = %ts_uuid, "no pending delete recorded for acknowledged tablet");
            }
        } else {
            warn!(server = %ts_uuid, "unknown tablet server acknowledged a delete");
        }

        self.clean_up_deleted_tables();
    }

    /// Drop DELETED, task-free tables from the by-id map. DELETED rows stay
    /// in the sys catalog; there is deliberately no cleaner pass for them.
    pub(crate) fn clean_up_deleted_tables(&self) {
        let mut maps = self.registry.write();
        let gone: Vec<Arc<TableInfo>> = maps
            .tables_by_id
            .values()
            .filter(|table| table.tasks().is_empty() && table.metadata().read().is_deleted())
            .cloned()
            .collect();
        for table in gone {
            info!(table = %table.id(), "removing fully deleted table from the by-id map");
            let meta = table.metadata().read();
            maps.tables_by_name
                .remove(&(meta.namespace_id.clone(), meta.name.clone()));
            maps.tables_by_id.remove(table.id());
            table.detach_tablets();
        }
    }

    /// Whether every replica of a deleted table acknowledged the deletion.
    pub fn is_delete_table_done(&self, table_id: &TableId) -> Result<IsDeleteTableDoneResponse> {
        let _l = self.leader_shared_lock()?;
        let Some(table) = self.registry.read().table_by_id(table_id) else {
            info!(table = %table_id, "IsDeleteTableDone: already gone");
            return Ok(IsDeleteTableDoneResponse { done: true });
        };

        let meta = table.metadata().read();
        if !meta.started_deleting() {
            return IllegalStateSnafu {
                msg: "the table was NOT deleted",
            }
            .fail();
        }

        Ok(IsDeleteTableDoneResponse {
            done: meta.is_deleted() && table.tasks().is_empty(),
        })
    }

    // ------------------------------------------------------------------
    // Table reads
    // ------------------------------------------------------------------

    /// The schema clients should use: the fully-applied one while an alter is
    /// still propagating.
    pub fn get_table_schema(&self, identifier: &TableIdentifier) -> Result<GetTableSchemaResponse> {
        let _l = self.leader_shared_lock()?;
        let table = self.find_table(identifier)?.ok_or_else(|| {
            NotFoundSnafu {
                msg: "the table does not exist",
            }
            .build()
        })?;

        let meta = table.metadata().read();
        if meta.started_deleting() {
            return NotFoundSnafu {
                msg: format!("the table was deleted: {}", meta.state_msg),
            }
            .fail();
        }

        let schema = match &meta.fully_applied_schema {
            Some(previous) => {
                debug_assert_eq!(meta.state, TableState::Altering);
                previous.clone()
            }
            None => meta.schema.clone(),
        };

        let namespace = self
            .registry
            .read()
            .namespace_by_id(&meta.namespace_id)
            .ok_or_else(|| {
                NamespaceNotFoundSnafu {
                    msg: format!("could not find namespace {} for table", meta.namespace_id),
                }
                .build()
            })?;

        Ok(GetTableSchemaResponse {
            schema,
            version: meta.version,
            replication_info: meta.replication_info.clone(),
            partition_schema: meta.partition_schema,
            table_type: meta.table_type,
            create_table_done: meta.is_running(),
            table_id: table.id().clone(),
            table_name: meta.name.clone(),
            namespace_id: meta.namespace_id.clone(),
            namespace_name: namespace.name(),
        })
    }

    /// Running tables, optionally filtered by namespace and name substring.
    pub fn list_tables(&self, req: &ListTablesRequest) -> Result<Vec<ListedTable>> {
        let _l = self.leader_shared_lock()?;

        let namespace_filter = match &req.namespace {
            Some(ns) => Some(self.resolve_namespace(Some(ns))?.id().clone()),
            None => None,
        };

        let maps = self.registry.read();
        let mut tables = Vec::new();
        for ((namespace_id, _), table) in &maps.tables_by_name {
            let meta = table.metadata().read();
            if !meta.is_running() {
                continue;
            }
            if let Some(filter) = &namespace_filter {
                if filter != namespace_id {
                    continue;
                }
            }
            if let Some(filter) = &req.name_filter {
                if !meta.name.contains(filter.as_str()) {
                    continue;
                }
            }
            let namespace_name = maps
                .namespace_by_id(namespace_id)
                .map(|ns| ns.name())
                .unwrap_or_default();
            tables.push(ListedTable {
                id: table.id().clone(),
                name: meta.name.clone(),
                table_type: meta.table_type,
                namespace_id: namespace_id.clone(),
                namespace_name,
            });
        }
        Ok(tables)
    }

    /// Locations of the tablets covering a partition-key range.
    pub fn get_table_locations(
        &self,
        req: &GetTableLocationsRequest,
    ) -> Result<GetTableLocationsResponse> {
        let _l = self.leader_shared_lock()?;

        if let (Some(start), Some(end)) = (&req.partition_key_start, &req.partition_key_end) {
            if !end.is_empty() && start > end {
                return InvalidArgumentSnafu {
                    msg: "start partition key is greater than the end partition key",
                }
                .fail();
            }
        }
        if req.max_returned_locations == 0 {
            return InvalidArgumentSnafu {
                msg: "max_returned_locations must be greater than 0",
            }
            .fail();
        }

        let table = self.find_table(&req.table)?.ok_or_else(|| {
            NotFoundSnafu {
                msg: "the table does not exist",
            }
            .build()
        })?;

        let meta = table.metadata().read();
        if meta.started_deleting() {
            return NotFoundSnafu {
                msg: format!("the table was deleted: {}", meta.state_msg),
            }
            .fail();
        }
        if !meta.is_running() {
            return ServiceUnavailableSnafu {
                msg: "the table is not running",
            }
            .fail();
        }

        let tablets = table.tablets_in_range(
            req.partition_key_start.as_deref(),
            req.partition_key_end.as_deref(),
            req.max_returned_locations,
        );

        let mut tablet_locations = Vec::with_capacity(tablets.len());
        for tablet in tablets {
            match self.build_locations_for_tablet(&tablet) {
                Ok(locations) => tablet_locations.push(locations),
                // Not-running tablets are silently skipped.
                Err(_) => continue,
            }
        }

        Ok(GetTableLocationsResponse {
            tablet_locations,
            table_type: meta.table_type,
        })
    }

    /// Locations of a single tablet.
    pub fn get_tablet_locations(&self, tablet_id: &TabletId) -> Result<TabletLocations> {
        let _l = self.leader_shared_lock()?;
        let tablet = self.registry.read().tablet_by_id(tablet_id).ok_or_else(|| {
            NotFoundSnafu {
                msg: format!("unknown tablet {tablet_id}"),
            }
            .build()
        })?;
        self.build_locations_for_tablet(&tablet)
    }

    pub(crate) fn build_locations_for_tablet(
        &self,
        tablet: &Arc<TabletInfo>,
    ) -> Result<TabletLocations> {
        let table = tablet.table().ok_or_else(|| {
            NotFoundSnafu {
                msg: "tablet is orphaned",
            }
            .build()
        })?;

        // System tables are served by the masters themselves.
        if self.is_system_table(table) {
            let cstate = self.consensus.committed_consensus_state();
            let meta = tablet.metadata().read();
            return Ok(TabletLocations {
                tablet_id: tablet.id().clone(),
                table_id: table.id().clone(),
                partition: meta.partition.clone(),
                stale: false,
                replicas: consensus_state_to_replicas(&cstate),
            });
        }

        let meta = tablet.metadata().read();
        if meta.is_deleted() {
            return NotFoundSnafu {
                msg: format!("tablet deleted: {}", meta.state_msg),
            }
            .fail();
        }
        if !meta.is_running() {
            return ServiceUnavailableSnafu {
                msg: "tablet not running",
            }
            .fail();
        }

        let locations = tablet.replica_locations();
        if !locations.is_empty() {
            let replicas = locations
                .values()
                .map(|replica| ReplicaLocation {
                    role: replica.role,
                    permanent_uuid: replica.ts.permanent_uuid().clone(),
                    rpc_addresses: replica.ts.registration().rpc_addresses.clone(),
                    cloud_info: Some(replica.ts.registration().cloud_info.clone()),
                })
                .collect();
            return Ok(TabletLocations {
                tablet_id: tablet.id().clone(),
                table_id: table.id().clone(),
                partition: meta.partition.clone(),
                stale: false,
                replicas,
            });
        }

        // No heartbeat since this leader loaded; fall back to the committed
        // consensus config.
        Ok(TabletLocations {
            tablet_id: tablet.id().clone(),
            table_id: table.id().clone(),
            partition: meta.partition.clone(),
            stale: true,
            replicas: consensus_state_to_replicas(&meta.committed_consensus_state),
        })
    }

    // ------------------------------------------------------------------
    // Namespaces
    // ------------------------------------------------------------------

    /// Create a namespace.
    pub async fn create_namespace(&self, name: &str) -> Result<CreateNamespaceResponse> {
        let _l = self.leader_shared_lock()?;
        info!(name, "servicing CreateNamespace");

        let ns: Arc<NamespaceInfo>;
        {
            let mut maps = self.registry.write();
            if let Some(existing) = maps.namespace_by_name(name) {
                return AlreadyPresentSnafu {
                    msg: format!("namespace {name} already exists: {}", existing.id()),
                }
                .fail();
            }
            let id = Self::generate_unique_id(|id| maps.namespaces_by_id.contains_key(id));
            ns = Arc::new(NamespaceInfo::new(
                id,
                NamespaceMetadata { name: name.into() },
            ));
            maps.namespaces_by_id.insert(ns.id().clone(), Arc::clone(&ns));
            maps.namespaces_by_name.insert(name.into(), Arc::clone(&ns));
        }

        if let Err(e) = self
            .sys_store
            .add_item(namespace_entry(ns.id(), &ns.metadata().read()))
            .await
        {
            let mut maps = self.registry.write();
            maps.namespaces_by_name.remove(name);
            maps.namespaces_by_id.remove(ns.id());
            return Err(self.check_if_no_longer_leader(e));
        }

        info!(namespace = %ns.id(), name, "created namespace");
        Ok(CreateNamespaceResponse { id: ns.id().clone() })
    }

    /// Delete an empty namespace. The default namespace is indestructible.
    pub async fn delete_namespace(&self, identifier: &NamespaceIdentifier) -> Result<()> {
        let _l = self.leader_shared_lock()?;
        info!(namespace = ?identifier, "servicing DeleteNamespace");

        let ns = self.resolve_namespace(Some(identifier))?;
        if ns.id().as_str() == DEFAULT_NAMESPACE_ID {
            return CannotDeleteDefaultNamespaceSnafu {
                msg: "cannot delete default namespace",
            }
            .fail();
        }

        // Only an empty namespace can go.
        {
            let maps = self.registry.read();
            for table in maps.tables_by_id.values() {
                let meta = table.metadata().read();
                if !meta.started_deleting() && meta.namespace_id == *ns.id() {
                    return NamespaceIsNotEmptySnafu {
                        msg: format!(
                            "cannot delete namespace which has a table: {} [id={}]",
                            meta.name,
                            table.id()
                        ),
                    }
                    .fail();
                }
            }
            for udt in maps.udts_by_id.values() {
                if udt.namespace_id() == *ns.id() {
                    return NamespaceIsNotEmptySnafu {
                        msg: format!(
                            "cannot delete namespace which has a type: {} [id={}]",
                            udt.name(),
                            udt.id()
                        ),
                    }
                    .fail();
                }
            }
        }

        if let Err(e) = self
            .sys_store
            .delete_item(EntityKind::Namespace, ns.id().to_string())
            .await
        {
            return Err(self.check_if_no_longer_leader(e));
        }

        {
            let mut maps = self.registry.write();
            maps.namespaces_by_name.remove(&ns.name());
            maps.namespaces_by_id.remove(ns.id());
        }

        info!(namespace = %ns.id(), "successfully deleted namespace");
        Ok(())
    }

    /// Namespaces, optionally filtered by name substring.
    pub fn list_namespaces(&self, req: &ListNamespacesRequest) -> Result<Vec<ListedNamespace>> {
        let _l = self.leader_shared_lock()?;
        let maps = self.registry.read();
        Ok(maps
            .namespaces_by_name
            .iter()
            .filter(|(name, _)| {
                req.name_filter
                    .as_ref()
                    .map(|f| name.contains(f.as_str()))
                    .unwrap_or(true)
            })
            .map(|(name, ns)| ListedNamespace {
                id: ns.id().clone(),
                name: name.clone(),
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // User-defined types
    // ------------------------------------------------------------------

    /// Create a user-defined type.
    pub async fn create_udt(&self, req: CreateUdtRequest) -> Result<CreateUdtResponse> {
        let _l = self.leader_shared_lock()?;
        info!(name = %req.name, "servicing CreateUDType");

        if req.field_names.len() != req.field_types.len() {
            return InvalidArgumentSnafu {
                msg: "field names and field types differ in length",
            }
            .fail();
        }

        let ns = self.resolve_namespace(Some(&req.namespace))?;

        let udt: Arc<UdtInfo>;
        {
            let mut maps = self.registry.write();
            if let Some(existing) = maps.udt_by_name(ns.id(), &req.name) {
                return TypeAlreadyPresentSnafu {
                    msg: format!(
                        "type {}.{} already exists: {}",
                        ns.name(),
                        req.name,
                        existing.id()
                    ),
                }
                .fail();
            }
            let id = Self::generate_unique_id(|id| maps.udts_by_id.contains_key(id));
            udt = Arc::new(UdtInfo::new(
                id,
                UdtMetadata {
                    name: req.name.clone(),
                    namespace_id: ns.id().clone(),
                    field_names: req.field_names,
                    field_types: req.field_types,
                },
            ));
            maps.udts_by_id.insert(udt.id().clone(), Arc::clone(&udt));
            maps.udts_by_name
                .insert((ns.id().clone(), req.name.clone()), Arc::clone(&udt));
        }

        if let Err(e) = self
            .sys_store
            .add_item(udt_entry(udt.id(), &udt.metadata().read()))
            .await
        {
            let mut maps = self.registry.write();
            maps.udts_by_name.remove(&(ns.id().clone(), req.name.clone()));
            maps.udts_by_id.remove(udt.id());
            return Err(self.check_if_no_longer_leader(e));
        }

        info!(udt = %udt.id(), name = %req.name, "created user-defined type");
        Ok(CreateUdtResponse {
            id: udt.id().clone(),
        })
    }

    /// Delete a user-defined type that no table references.
    pub async fn delete_udt(&self, identifier: &UdtIdentifier) -> Result<()> {
        let _l = self.leader_shared_lock()?;
        info!(udt = ?identifier, "servicing DeleteUDType");

        let udt = self.find_udt(identifier)?.ok_or_else(|| {
            TypeNotFoundSnafu {
                msg: "the type does not exist",
            }
            .build()
        })?;

        {
            let maps = self.registry.read();
            for table in maps.tables_by_id.values() {
                let meta = table.metadata().read();
                if meta.started_deleting() {
                    continue;
                }
                for column in meta.schema.columns() {
                    if column.data_type.referenced_udt() == Some(udt.id()) {
                        return NamespaceIsNotEmptySnafu {
                            msg: format!(
                                "cannot delete type '{}': it is used in column {} of table {}",
                                udt.name(),
                                column.name,
                                meta.name
                            ),
                        }
                        .fail();
                    }
                }
            }
        }

        if let Err(e) = self
            .sys_store
            .delete_item(EntityKind::UdType, udt.id().to_string())
            .await
        {
            return Err(self.check_if_no_longer_leader(e));
        }

        {
            let mut maps = self.registry.write();
            maps.udts_by_id.remove(udt.id());
            maps.udts_by_name
                .remove(&(udt.namespace_id(), udt.name()));
        }

        info!(udt = %udt.id(), "successfully deleted user-defined type");
        Ok(())
    }

    /// Describe one user-defined type.
    pub fn get_udt_info(&self, identifier: &UdtIdentifier) -> Result<UdtDescription> {
        let _l = self.leader_shared_lock()?;
        let udt = self.find_udt(identifier)?.ok_or_else(|| {
            TypeNotFoundSnafu {
                msg: "couldn't find type",
            }
            .build()
        })?;

        let meta = udt.metadata().read();
        Ok(UdtDescription {
            id: udt.id().clone(),
            name: meta.name.clone(),
            namespace_id: meta.namespace_id.clone(),
            field_names: meta.field_names.clone(),
            field_types: meta.field_types.clone(),
        })
    }

    /// Types of one namespace.
    pub fn list_udts(&self, namespace: &NamespaceIdentifier) -> Result<Vec<UdtDescription>> {
        let _l = self.leader_shared_lock()?;
        let ns = self.resolve_namespace(Some(namespace))?;
        let maps = self.registry.read();
        Ok(maps
            .udts_by_name
            .iter()
            .filter(|((namespace_id, _), _)| namespace_id == ns.id())
            .map(|(_, udt)| {
                let meta = udt.metadata().read();
                UdtDescription {
                    id: udt.id().clone(),
                    name: meta.name.clone(),
                    namespace_id: meta.namespace_id.clone(),
                    field_names: meta.field_names.clone(),
                    field_types: meta.field_types.clone(),
                }
            })
            .collect())
    }

    pub(crate) fn is_system_table(&self, table: &TableInfo) -> bool {
        crate::loader::SYSTEM_NAMESPACE_IDS
            .iter()
            .any(|id| table.namespace_id().as_str() == *id)
    }
}

fn consensus_state_to_replicas(cstate: &ConsensusState) -> Vec<ReplicaLocation> {
    cstate
        .config
        .peers
        .iter()
        .map(|peer| ReplicaLocation {
            role: cstate.role_of(&peer.permanent_uuid),
            permanent_uuid: peer.permanent_uuid.clone(),
            rpc_addresses: peer.last_known_addr.clone().into_iter().collect(),
            cloud_info: None,
        })
        .collect()
}

/// Apply the ordered alter steps to the current schema, handing out fresh
/// column ids.
fn apply_alter_steps(
    current: &TableMetadata,
    steps: &[AlterTableStep],
) -> Result<(TableSchema, ColumnId)> {
    let mut builder = SchemaBuilder::from_schema(&current.schema, current.next_column_id);

    for step in steps {
        match step {
            AlterTableStep::AddColumn { column } => {
                if column.id.is_some() {
                    return InvalidArgumentSnafu {
                        msg: format!("column {}: client should not specify column id", column.name),
                    }
                    .fail();
                }
                if column.is_key {
                    return InvalidArgumentSnafu {
                        msg: "key columns cannot be added after table creation",
                    }
                    .fail();
                }
                if !column.is_nullable && column.read_default.is_none() {
                    return InvalidArgumentSnafu {
                        msg: format!("column `{}`: NOT NULL columns must have a default", column.name),
                    }
                    .fail();
                }
                builder.add_column(
                    column.name.clone(),
                    column.data_type.clone(),
                    column.is_nullable,
                    column.read_default.clone(),
                )?;
            }
            AlterTableStep::DropColumn { name } => {
                builder.remove_column(name)?;
            }
            AlterTableStep::RenameColumn { old_name, new_name } => {
                builder.rename_column(old_name, new_name)?;
            }
        }
    }

    Ok(builder.build())
}
