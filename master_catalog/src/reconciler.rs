//! The report reconciler: folds tablet-server heartbeat reports into the
//! catalog, tombstones evicted replicas, and completes create/alter flows
//! once replicas confirm them.

use crate::api::{
    ReportedState, ReportedTablet, ReportedTabletUpdate, TabletReport, TabletReportUpdates,
};
use crate::catalog::{table_entry, tablet_entry, CatalogManager};
use crate::cow::CowWriteGuard;
use crate::entity::{ReplicaMap, TableInfo, TabletInfo, TabletReplica};
use crate::error::Result;
use crate::rpc::TabletDataState;
use crate::ts_manager::TsDescriptor;
use data_types::{ConsensusState, TableState, TabletMetadata, TabletState};
use observability_deps::tracing::{error, info, warn};
use std::sync::Arc;

impl CatalogManager {
    /// Fold one server's tablet report into the catalog. Accepts incremental
    /// reports only once a full report has been seen from this server.
    pub async fn process_tablet_report(
        &self,
        ts: &Arc<TsDescriptor>,
        report: &TabletReport,
    ) -> Result<TabletReportUpdates> {
        let _l = self.leader_shared_lock()?;

        if !ts.has_tablet_report() && report.is_incremental {
            warn!(
                server = %ts.permanent_uuid(),
                "received an incremental tablet report when a full one was needed"
            );
            return Ok(TabletReportUpdates {
                tablets: vec![],
                needs_full_tablet_report: true,
            });
        }

        let mut updates = TabletReportUpdates::default();
        for reported in &report.updated_tablets {
            let state_msg = self.handle_reported_tablet(ts, reported).await?;
            updates.tablets.push(ReportedTabletUpdate {
                tablet_id: reported.tablet_id.clone(),
                state_msg,
            });
        }

        ts.set_has_tablet_report(true);

        if !report.updated_tablets.is_empty() {
            self.wake_bg_tasks_if_pending();
        }
        Ok(updates)
    }

    async fn handle_reported_tablet(
        &self,
        ts: &Arc<TsDescriptor>,
        reported: &ReportedTablet,
    ) -> Result<String> {
        let tablet = self.registry.read().tablet_by_id(&reported.tablet_id);
        let Some(tablet) = tablet else {
            info!(
                tablet = %reported.tablet_id,
                server = %ts.permanent_uuid(),
                "got report from unknown tablet; sending delete request"
            );
            self.send_delete_replica_request(
                &reported.tablet_id,
                TabletDataState::Deleted,
                None,
                None,
                Arc::clone(ts),
                "report from unknown tablet",
            );
            return Ok(String::new());
        };

        let Some(table) = tablet.table().map(Arc::clone) else {
            info!(tablet = %reported.tablet_id, "got report from an orphaned tablet");
            self.send_delete_replica_request(
                &reported.tablet_id,
                TabletDataState::Deleted,
                None,
                None,
                Arc::clone(ts),
                "report from an orphaned tablet",
            );
            return Ok(String::new());
        };

        let table_meta = table.metadata().read();
        let mut guard = tablet.metadata().write().await;

        // A replica of a deleted tablet, or of a tablet whose table is going
        // away, is told to delete itself. Tablets are not individually marked
        // when a table starts deleting, so the table state matters too.
        if guard.committed().is_deleted() || table_meta.started_deleting() {
            let msg = guard.committed().state_msg.clone();
            info!(
                tablet = %tablet.id(),
                server = %ts.permanent_uuid(),
                %msg,
                "got report from deleted tablet; sending delete request"
            );
            self.send_delete_replica_request(
                tablet.id(),
                TabletDataState::Deleted,
                None,
                Some(&table),
                Arc::clone(ts),
                format!("tablet deleted: {msg}"),
            );
            return Ok(msg);
        }

        let mut tablet_needs_alter = false;
        if let Some(version) = reported.schema_version {
            if version != table_meta.version {
                if version > table_meta.version {
                    error!(
                        tablet = %tablet.id(),
                        server = %ts.permanent_uuid(),
                        expected = table_meta.version,
                        got = version,
                        "server reported a schema version greater than the current one"
                    );
                } else {
                    info!(
                        tablet = %tablet.id(),
                        server = %ts.permanent_uuid(),
                        expected = table_meta.version,
                        got = version,
                        "server does not have the latest schema"
                    );
                }
                // The replica may be laggy and its leader already received
                // the alter; resending is safe either way.
                tablet_needs_alter = true;
            }
        }

        if let Some(report_error) = &reported.error {
            warn!(
                tablet = %tablet.id(),
                server = %ts.permanent_uuid(),
                error = %report_error,
                "tablet replica has failed"
            );
            return Ok(guard.committed().state_msg.clone());
        }

        // A report carries no committed consensus state while the replica is
        // still bootstrapping; nothing to reconcile then.
        if let Some(reported_cstate) = &reported.committed_consensus_state {
            let prev_cstate = guard.committed().committed_consensus_state.clone();
            let mut cstate = reported_cstate.clone();

            // A replica whose config is strictly older than the committed one
            // and who is not a member of it was evicted: tombstone it. The
            // CAS on the previous opid index protects replicas that were just
            // added to a pending config.
            if self.config.master_tombstone_evicted_tablet_replicas
                && cstate.config.opid_index < prev_cstate.config.opid_index
                && !prev_cstate.config.contains(ts.permanent_uuid())
            {
                self.send_delete_replica_request(
                    tablet.id(),
                    TabletDataState::Tombstoned,
                    Some(prev_cstate.config.opid_index),
                    Some(&table),
                    Arc::clone(ts),
                    format!(
                        "replica from old config with index {} (latest is {})",
                        cstate.config.opid_index, prev_cstate.config.opid_index
                    ),
                );
                return Ok(guard.committed().state_msg.clone());
            }

            // Wait for an elected leader before declaring the tablet created,
            // or a minority of successful replicas could wedge it forever.
            if !guard.committed().is_running() && self.should_transition_tablet_to_running(reported)
            {
                info!(tablet = %tablet.id(), "tablet is now online");
                guard.set_state(
                    TabletState::Running,
                    "tablet reported with an active leader",
                );
            }

            if cstate.config.opid_index > prev_cstate.config.opid_index
                || (cstate.leader_uuid.is_some()
                    && (prev_cstate.leader_uuid.is_none()
                        || cstate.current_term > prev_cstate.current_term))
            {
                if cstate.current_term == prev_cstate.current_term {
                    match (&cstate.leader_uuid, &prev_cstate.leader_uuid) {
                        (None, Some(prev_leader)) => {
                            // The reporting follower may simply not know the
                            // leader yet; keep the one already known for this
                            // term.
                            cstate.leader_uuid = Some(prev_leader.clone());
                        }
                        (Some(new_leader), Some(prev_leader)) if new_leader != prev_leader => {
                            error!(
                                tablet = %tablet.id(),
                                term = cstate.current_term,
                                %new_leader,
                                %prev_leader,
                                "diverging leaders within one term"
                            );
                            panic!(
                                "diverging leaders: tablet {} has two leaders in term {}",
                                tablet.id(),
                                cstate.current_term
                            );
                        }
                        _ => {}
                    }
                }

                info!(
                    tablet = %tablet.id(),
                    opid_index = cstate.config.opid_index,
                    term = cstate.current_term,
                    "tablet reported a consensus state change"
                );
                self.reset_tablet_replicas_from_reported_config(
                    &tablet,
                    &mut guard,
                    &prev_cstate,
                    cstate,
                    reported.state,
                );
            } else if cstate.config.opid_index == prev_cstate.config.opid_index {
                // Same config we already know; make sure the reporter is
                // tracked.
                self.add_replica_to_tablet_if_not_found(ts, &tablet, &cstate, reported.state);
            }
        }

        // Persist the updated tablet before committing so a refused write
        // cleanly aborts the draft.
        let state_msg = guard.state_msg.clone();
        let tablet_running = guard.is_running();
        if let Err(e) = self
            .sys_store
            .update_item(tablet_entry(tablet.id(), &guard))
            .await
        {
            warn!(tablet = %tablet.id(), error = %e, "error updating tablet from report");
            return Err(self.check_if_no_longer_leader(e));
        }
        guard.commit();

        // The alter command must go out after the new tablet data committed:
        // the report may have changed the raft config and the alter needs the
        // freshest leader.
        if tablet_needs_alter {
            self.send_alter_tablet_request(&table, &tablet);
        } else if let Some(version) = reported.schema_version {
            self.handle_tablet_schema_version_report(&table, &tablet, version)
                .await?;
        }

        if tablet_running {
            self.maybe_complete_table_creation(&table).await;
        }

        Ok(state_msg)
    }

    fn should_transition_tablet_to_running(&self, reported: &ReportedTablet) -> bool {
        if reported.state != ReportedState::Running {
            return false;
        }

        // Tests that disable leader election transition on any report.
        if !self.config.catalog_manager_wait_for_new_tablets_to_elect_leader {
            return true;
        }

        reported
            .committed_consensus_state
            .as_ref()
            .map(|cstate| cstate.leader_uuid.is_some())
            .unwrap_or(false)
    }

    /// Adopt a newer consensus state: replace the stored one, rebuild the
    /// replica map from its peers, and tombstone peers that fell out of the
    /// config.
    fn reset_tablet_replicas_from_reported_config(
        &self,
        tablet: &Arc<TabletInfo>,
        guard: &mut CowWriteGuard<TabletMetadata>,
        prev_cstate: &ConsensusState,
        cstate: ConsensusState,
        reported_state: ReportedState,
    ) {
        let mut replica_locations = ReplicaMap::default();
        for peer in &cstate.config.peers {
            let Some(desc) = self.ts_manager.lookup(&peer.permanent_uuid) else {
                warn!(
                    peer = %peer.permanent_uuid,
                    tablet = %tablet.id(),
                    "tablet server has never reported in; not including in replica locations yet"
                );
                continue;
            };
            replica_locations.insert(
                peer.permanent_uuid.clone(),
                TabletReplica {
                    ts: desc,
                    role: cstate.role_of(&peer.permanent_uuid),
                    state: reported_state,
                },
            );
        }
        tablet.set_replica_locations(replica_locations, self.time_provider.now());

        if self.config.master_tombstone_evicted_tablet_replicas {
            for prev_peer in &prev_cstate.config.peers {
                if cstate.config.contains(&prev_peer.permanent_uuid) {
                    continue;
                }
                let Some(desc) = self.ts_manager.lookup(&prev_peer.permanent_uuid) else {
                    continue;
                };
                self.send_delete_replica_request(
                    tablet.id(),
                    TabletDataState::Tombstoned,
                    Some(prev_cstate.config.opid_index),
                    tablet.table(),
                    desc,
                    format!(
                        "TS {} not found in new config with opid_index {}",
                        prev_peer.permanent_uuid, cstate.config.opid_index
                    ),
                );
            }
        }

        guard.committed_consensus_state = cstate;
    }

    fn add_replica_to_tablet_if_not_found(
        &self,
        ts: &Arc<TsDescriptor>,
        tablet: &Arc<TabletInfo>,
        cstate: &ConsensusState,
        reported_state: ReportedState,
    ) {
        tablet.add_replica_if_not_found(TabletReplica {
            ts: Arc::clone(ts),
            role: cstate.role_of(ts.permanent_uuid()),
            state: reported_state,
        });
    }

    /// Record the schema version a replica runs; once every tablet caught up
    /// the alter is complete and the previous schema can be dropped.
    async fn handle_tablet_schema_version_report(
        &self,
        table: &Arc<TableInfo>,
        tablet: &Arc<TabletInfo>,
        version: u32,
    ) -> Result<()> {
        tablet.set_reported_schema_version(version);

        let mut guard = table.metadata().write().await;
        if guard.committed().state != TableState::Altering {
            return Ok(());
        }

        let current_version = guard.committed().version;
        if table.is_alter_in_progress(current_version) {
            return Ok(());
        }

        guard.fully_applied_schema = None;
        guard.set_state(
            TableState::Running,
            format!("current schema version={current_version}"),
        );

        if let Err(e) = self
            .sys_store
            .update_item(table_entry(table.id(), &guard))
            .await
        {
            warn!(table = %table.id(), error = %e, "error persisting alter completion");
            return Err(self.check_if_no_longer_leader(e));
        }
        guard.commit();
        info!(table = %table.id(), version = current_version, "alter table completed");
        Ok(())
    }

    /// Drive a PREPARING table to RUNNING once all of its tablets run.
    pub(crate) async fn maybe_complete_table_creation(&self, table: &Arc<TableInfo>) {
        let mut guard = table.metadata().write().await;
        if guard.committed().state != TableState::Preparing {
            return;
        }
        if table.is_create_in_progress() {
            return;
        }

        guard.set_state(TableState::Running, "all tablets running");
        match self
            .sys_store
            .update_item(table_entry(table.id(), &guard))
            .await
        {
            Ok(()) => {
                guard.commit();
                info!(table = %table.id(), "table creation completed");
            }
            Err(e) => {
                // Left in PREPARING; the next report retries this path.
                warn!(table = %table.id(), error = %e, "failed to persist table completion");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::MasterConfig;
    use crate::test_util::{consensus_state, running_report, RpcCall, TestMaster};
    use crate::rpc::TabletDataState;
    use data_types::TabletState;
    use std::time::Duration;

    #[tokio::test]
    async fn leader_is_retained_when_a_follower_omits_it() {
        let master = TestMaster::start().await;
        let a = master.add_ts("ts-a");
        let b = master.add_ts("ts-b");
        let c = master.add_ts("ts-c");

        let table_id = master.create_simple_table("t", 1).await.unwrap();
        let tablet = master.tablets_of(&table_id)[0].clone();

        master
            .report(
                &a,
                vec![running_report(
                    tablet.id(),
                    consensus_state(&[&a, &b, &c], Some(&a), 1, 1),
                )],
            )
            .await
            .unwrap();

        // B reports a newer config in the same term but does not know the
        // leader yet.
        master
            .report(
                &b,
                vec![running_report(
                    tablet.id(),
                    consensus_state(&[&a, &b, &c], None, 1, 2),
                )],
            )
            .await
            .unwrap();

        let cstate = tablet.metadata().read().committed_consensus_state.clone();
        assert_eq!(cstate.config.opid_index, 2);
        assert_eq!(cstate.leader_uuid.as_ref(), Some(a.permanent_uuid()));
    }

    #[tokio::test]
    async fn laggy_evicted_replica_is_tombstoned_with_a_cas() {
        let master = TestMaster::start().await;
        let a = master.add_ts("ts-a");
        let b = master.add_ts("ts-b");
        let c = master.add_ts("ts-c");
        let d = master.add_ts("ts-d");

        let table_id = master.create_simple_table("t", 1).await.unwrap();
        let tablet = master.tablets_of(&table_id)[0].clone();

        // Committed config is {A, B, D} at index 7.
        master
            .report(
                &a,
                vec![running_report(
                    tablet.id(),
                    consensus_state(&[&a, &b, &d], Some(&a), 1, 7),
                )],
            )
            .await
            .unwrap();
        master.rpc.take_calls();

        // C reports with an old config it was evicted from.
        master
            .report(
                &c,
                vec![running_report(
                    tablet.id(),
                    consensus_state(&[&a, &b, &c], Some(&a), 1, 5),
                )],
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let tombstones: Vec<_> = master
            .rpc
            .delete_calls()
            .into_iter()
            .filter(|call| {
                matches!(
                    call,
                    RpcCall::DeleteReplica {
                        server,
                        delete_type: TabletDataState::Tombstoned,
                        cas_config_opid_index_less_or_equal: Some(7),
                        ..
                    } if server == c.permanent_uuid()
                )
            })
            .collect();
        assert_eq!(tombstones.len(), 1);

        // The committed config was not disturbed.
        let cstate = tablet.metadata().read().committed_consensus_state.clone();
        assert_eq!(cstate.config.opid_index, 7);
    }

    #[tokio::test]
    async fn test_mode_transitions_on_any_running_report() {
        let mut config = MasterConfig::default();
        config.catalog_manager_wait_for_new_tablets_to_elect_leader = false;
        let master = TestMaster::start_with_config(config).await;
        let a = master.add_ts("ts-a");
        let b = master.add_ts("ts-b");
        let c = master.add_ts("ts-c");

        let table_id = master.create_simple_table("t", 1).await.unwrap();
        let tablet = master.tablets_of(&table_id)[0].clone();

        // No leader elected, yet the tablet comes online.
        master
            .report(
                &a,
                vec![running_report(
                    tablet.id(),
                    consensus_state(&[&a, &b, &c], None, 0, 0),
                )],
            )
            .await
            .unwrap();
        assert_eq!(tablet.metadata().read().state, TabletState::Running);
    }

    #[tokio::test]
    async fn reports_for_deleting_tables_answer_with_a_delete() {
        let master = TestMaster::start().await;
        let a = master.add_ts("ts-a");
        let b = master.add_ts("ts-b");
        let c = master.add_ts("ts-c");

        let table_id = master.create_simple_table("t", 1).await.unwrap();
        let tablet = master.tablets_of(&table_id)[0].clone();
        master
            .report(
                &a,
                vec![running_report(
                    tablet.id(),
                    consensus_state(&[&a, &b, &c], Some(&a), 1, 1),
                )],
            )
            .await
            .unwrap();

        master
            .catalog
            .delete_table(&crate::api::TableIdentifier::by_id(table_id))
            .await
            .unwrap();
        master.rpc.take_calls();

        // A straggler replica reports after the deletion started.
        master
            .report(
                &b,
                vec![running_report(
                    tablet.id(),
                    consensus_state(&[&a, &b, &c], Some(&a), 1, 1),
                )],
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(master.rpc.delete_calls().iter().any(|call| matches!(
            call,
            RpcCall::DeleteReplica { server, delete_type: TabletDataState::Deleted, .. }
                if server == b.permanent_uuid()
        )));
    }
}
