//! The assignment engine: drives tablets from PREPARING through CREATING to
//! RUNNING (or REPLACED), picking replica placements with power-of-two-choices
//! selection.

use crate::catalog::{tablet_entry, CatalogManager};
use crate::cow::CowWriteGuard;
use crate::entity::{TableInfo, TabletInfo};
use crate::error::{Error, InvalidArgumentSnafu, Result};
use crate::sys_store::SysOp;
use crate::ts_manager::TsDescriptor;
use data_types::{
    ConsensusState, PlacementInfo, RaftConfig, RaftPeer, TabletMetadata, TabletServerId,
    TabletState, INVALID_OPID_INDEX, MINIMUM_TERM,
};
use observability_deps::tracing::{info, warn};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug)]
struct PendingTablet {
    tablet: Arc<TabletInfo>,
    guard: CowWriteGuard<TabletMetadata>,
    is_new: bool,
    to_update: bool,
    needs_create_rpc: bool,
}

impl CatalogManager {
    /// Partition all known tablets into those whose replicas must be torn
    /// down and those that still need assignment work. Running tablets and
    /// orphans are skipped.
    pub(crate) fn extract_tablets_to_process(
        &self,
    ) -> (Vec<Arc<TabletInfo>>, Vec<Arc<TabletInfo>>) {
        let maps = self.registry.read();
        let mut to_delete = Vec::new();
        let mut to_process = Vec::new();

        for tablet in maps.tablets_by_id.values() {
            let Some(table) = tablet.table() else {
                // Orphaned at load time; the reconciler answers its reports
                // with a delete instruction.
                continue;
            };

            let tablet_meta = tablet.metadata().read();
            let table_meta = table.metadata().read();

            if tablet_meta.is_deleted() || table_meta.started_deleting() {
                to_delete.push(Arc::clone(tablet));
                continue;
            }
            if tablet_meta.is_running() {
                continue;
            }
            to_process.push(Arc::clone(tablet));
        }

        (to_delete, to_process)
    }

    /// One assignment pass over `tablets`: move PREPARING tablets to
    /// CREATING, replace timed-out CREATING tablets, pick replicas, persist
    /// everything in one batch, then fan the create requests out.
    pub(crate) async fn process_pending_assignments(
        &self,
        mut tablets: Vec<Arc<TabletInfo>>,
    ) -> Result<()> {
        // Tablet write locks are taken in tablet-id order.
        tablets.sort_by(|a, b| a.id().cmp(b.id()));
        tablets.dedup_by(|a, b| a.id() == b.id());

        let mut pending = Vec::with_capacity(tablets.len());
        for tablet in tablets {
            let guard = tablet.metadata().write().await;
            pending.push(PendingTablet {
                tablet,
                guard,
                is_new: false,
                to_update: false,
                needs_create_rpc: false,
            });
        }

        let now = self.time_provider.now();
        let creation_timeout = self.config.tablet_creation_timeout();
        let mut replacements = Vec::new();

        for entry in &mut pending {
            match entry.guard.committed().state {
                TabletState::Preparing => {
                    entry
                        .guard
                        .set_state(TabletState::Creating, "sending initial creation of tablet");
                    entry.to_update = true;
                    entry.needs_create_rpc = true;
                }
                TabletState::Creating => {
                    let expired = now
                        .checked_duration_since(entry.tablet.last_update_time())
                        .map(|elapsed| elapsed >= creation_timeout)
                        .unwrap_or(false);
                    if !expired {
                        continue;
                    }

                    // The creation request went unanswered for too long; spawn
                    // a sibling over the same partition and retire this one.
                    let Some(table) = entry.tablet.table().map(Arc::clone) else {
                        continue;
                    };
                    let replacement_id = {
                        let maps = self.registry.read();
                        Self::generate_unique_id(|id| maps.tablets_by_id.contains_key(id))
                    };
                    warn!(
                        tablet = %entry.tablet.id(),
                        replacement = %replacement_id,
                        "tablet was not created within the allowed timeout; replacing"
                    );

                    let replacement = Arc::new(TabletInfo::new(
                        replacement_id,
                        Some(Arc::clone(&table)),
                        TabletMetadata {
                            table_id: table.id().clone(),
                            partition: entry.guard.committed().partition.clone(),
                            state: TabletState::Creating,
                            state_msg: format!("replacement for {}", entry.tablet.id()),
                            committed_consensus_state: ConsensusState::default(),
                        },
                        now,
                    ));
                    table.add_tablet(Arc::clone(&replacement));
                    self.registry
                        .write()
                        .tablets_by_id
                        .insert(replacement.id().clone(), Arc::clone(&replacement));

                    entry.guard.set_state(
                        TabletState::Replaced,
                        format!("replaced by {} at creation timeout", replacement.id()),
                    );
                    entry.to_update = true;
                    replacements.push(replacement);
                }
                _ => {}
            }
        }

        for replacement in replacements {
            let guard = replacement.metadata().write().await;
            pending.push(PendingTablet {
                tablet: replacement,
                guard,
                is_new: true,
                to_update: false,
                needs_create_rpc: true,
            });
        }

        if !pending.iter().any(|e| e.is_new || e.to_update || e.needs_create_rpc) {
            return Ok(());
        }

        // Pick replicas for everything that will receive a create request.
        let ts_descs = self.ts_manager.live_descriptors();
        let mut selection_error: Option<Error> = None;
        for entry in &mut pending {
            if !entry.needs_create_rpc {
                continue;
            }
            let Some(table) = entry.tablet.table().map(Arc::clone) else {
                continue;
            };
            if let Err(e) = self.select_replicas_for_tablet(&ts_descs, &table, &mut entry.guard) {
                let e = Error::InvalidArgument {
                    msg: format!(
                        "an error occurred while selecting replicas for tablet {}: {e}",
                        entry.tablet.id()
                    ),
                };
                table.set_create_table_error(e.clone());
                selection_error = Some(e);
                break;
            }
        }

        let result = match selection_error {
            Some(e) => Err(e),
            None => {
                let ops = pending
                    .iter()
                    .filter(|e| e.is_new || e.to_update)
                    .map(|e| {
                        let entry = tablet_entry(e.tablet.id(), &e.guard);
                        if e.is_new {
                            SysOp::Insert(entry)
                        } else {
                            SysOp::Update(entry)
                        }
                    })
                    .collect();
                self.sys_store
                    .write_batch(ops)
                    .await
                    .map_err(|e| self.check_if_no_longer_leader(e))
            }
        };

        if let Err(e) = result {
            warn!(error = %e, "aborting assignment pass");
            // Abort every draft and unregister the tablets this pass created.
            let new_tablets: Vec<_> = pending
                .iter()
                .filter(|entry| entry.is_new)
                .map(|entry| {
                    (
                        Arc::clone(&entry.tablet),
                        entry.guard.committed().partition.partition_key_start.clone(),
                    )
                })
                .collect();
            drop(pending);

            let mut maps = self.registry.write();
            for (tablet, partition_key_start) in new_tablets {
                if let Some(table) = tablet.table() {
                    table.remove_tablet(&partition_key_start);
                }
                maps.tablets_by_id.remove(tablet.id());
            }
            return Err(e);
        }

        // Tear down replicas of tablets this pass retired, then publish.
        for entry in &pending {
            if entry.to_update && entry.guard.is_deleted() {
                self.delete_tablet_replicas(&entry.tablet, &entry.guard.state_msg);
            }
        }

        let to_create: Vec<_> = pending
            .iter()
            .filter(|e| e.needs_create_rpc)
            .map(|e| Arc::clone(&e.tablet))
            .collect();
        for entry in pending {
            entry.guard.commit();
        }

        // Selection succeeded for everything in this pass; stale failures
        // must not keep IsCreateTableDone red.
        for tablet in &to_create {
            if let Some(table) = tablet.table() {
                table.clear_create_table_error();
            }
        }

        self.send_create_tablet_requests(&to_create);
        Ok(())
    }

    /// Choose the replica set for one tablet and record it as the initial
    /// consensus config in the tablet's draft.
    fn select_replicas_for_tablet(
        &self,
        ts_descs: &[Arc<TsDescriptor>],
        table: &Arc<TableInfo>,
        dirty: &mut CowWriteGuard<TabletMetadata>,
    ) -> Result<()> {
        let table_meta = table.metadata().read();
        let mut replication_info = table_meta.replication_info.clone();
        if replication_info.live_replicas.num_replicas == 0 {
            replication_info = self
                .cluster_config_info()?
                .metadata()
                .read()
                .replication_info
                .clone();
        }
        if replication_info.live_replicas.num_replicas == 0 {
            replication_info.live_replicas.num_replicas = self.config.replication_factor;
        }
        let placement = &replication_info.live_replicas;
        let nreplicas = placement.num_replicas;

        if ts_descs.len() < nreplicas {
            return InvalidArgumentSnafu {
                msg: format!(
                    "not enough tablet servers are online for table '{}'. Need at least {nreplicas} replicas, but only {} tablet servers are available",
                    table_meta.name,
                    ts_descs.len()
                ),
            }
            .fail();
        }

        let mut config = RaftConfig {
            opid_index: INVALID_OPID_INDEX,
            peers: vec![],
        };
        let mut already_selected = HashSet::new();

        if placement.placement_blocks.is_empty() {
            self.select_replicas(ts_descs, nreplicas, &mut config, &mut already_selected);
        } else {
            // Satisfy each block's minimum within its own eligible set, then
            // fill the remaining slots from the union.
            let (by_block, all_allowed) = partition_by_placement(placement, ts_descs)?;
            for (_, min_num_replicas, eligible) in &by_block {
                self.select_replicas(eligible, *min_num_replicas, &mut config, &mut already_selected);
            }
            let replicas_left = nreplicas.saturating_sub(already_selected.len());
            if replicas_left > 0 {
                self.select_replicas(&all_allowed, replicas_left, &mut config, &mut already_selected);
            }
        }

        info!(
            table = %dirty.table_id,
            peers = ?config.peers.iter().map(|p| p.permanent_uuid.to_string()).collect::<Vec<_>>(),
            "initial tserver uuids for tablet"
        );

        dirty.committed_consensus_state = ConsensusState {
            current_term: MINIMUM_TERM,
            leader_uuid: None,
            config,
        };
        Ok(())
    }

    fn select_replicas(
        &self,
        ts_descs: &[Arc<TsDescriptor>],
        nreplicas: usize,
        config: &mut RaftConfig,
        already_selected: &mut HashSet<TabletServerId>,
    ) {
        for _ in 0..nreplicas {
            let Some(ts) = select_replica(ts_descs, already_selected) else {
                break;
            };
            already_selected.insert(ts.permanent_uuid().clone());

            // Count the selection immediately so the next tablet of the same
            // batch sees this server as more loaded.
            ts.increment_recent_replica_creations();

            config.peers.push(RaftPeer {
                permanent_uuid: ts.permanent_uuid().clone(),
                last_known_addr: ts.registration().rpc_addresses.first().cloned(),
            });
        }
    }

    /// Validate that a placement's minimums can be satisfied by the live
    /// servers. Shared by the CreateTable preflight and the assignment pass.
    pub(crate) fn check_placement_feasibility(
        &self,
        placement: &PlacementInfo,
        ts_descs: &[Arc<TsDescriptor>],
    ) -> Result<()> {
        partition_by_placement(placement, ts_descs).map(|_| ())
    }
}

type PlacementPartition = (
    Vec<(String, usize, Vec<Arc<TsDescriptor>>)>,
    Vec<Arc<TsDescriptor>>,
);

/// Split the live servers by which placement blocks they satisfy. A server
/// may match several blocks; the union holds each matching server once.
fn partition_by_placement(
    placement: &PlacementInfo,
    ts_descs: &[Arc<TsDescriptor>],
) -> Result<PlacementPartition> {
    let mut by_block = Vec::with_capacity(placement.placement_blocks.len());
    let mut all_allowed: Vec<Arc<TsDescriptor>> = Vec::new();
    let mut in_union = HashSet::new();

    for block in &placement.placement_blocks {
        let placement_id = block.cloud_info.placement_id();
        let eligible: Vec<_> = ts_descs
            .iter()
            .filter(|ts| ts.matches_cloud_info(&block.cloud_info))
            .map(Arc::clone)
            .collect();

        if eligible.len() < block.min_num_replicas {
            return InvalidArgumentSnafu {
                msg: format!(
                    "Not enough tablet servers in {placement_id}. Need at least {} but only have {}",
                    block.min_num_replicas,
                    eligible.len()
                ),
            }
            .fail();
        }

        for ts in &eligible {
            if in_union.insert(ts.permanent_uuid().clone()) {
                all_allowed.push(Arc::clone(ts));
            }
        }
        by_block.push((placement_id, block.min_num_replicas, eligible));
    }

    if all_allowed.len() < placement.num_replicas {
        return InvalidArgumentSnafu {
            msg: format!(
                "Not enough tablet servers in the requested placements. Need at least {}, have {}",
                placement.num_replicas,
                all_allowed.len()
            ),
        }
        .fail();
    }

    Ok((by_block, all_allowed))
}

/// Power-of-two-choices selection: sample two servers not yet chosen and keep
/// the one with the lower creation load. With one candidate left, take it.
fn select_replica(
    ts_descs: &[Arc<TsDescriptor>],
    excluded: &HashSet<TabletServerId>,
) -> Option<Arc<TsDescriptor>> {
    let candidates: Vec<Arc<TsDescriptor>> = ts_descs
        .iter()
        .filter(|ts| !excluded.contains(ts.permanent_uuid()))
        .map(Arc::clone)
        .collect();

    let mut rng = rand::thread_rng();
    let two_choices: Vec<&Arc<TsDescriptor>> = candidates.choose_multiple(&mut rng, 2).collect();
    match two_choices.as_slice() {
        [] => None,
        [only] => Some(Arc::clone(only)),
        [a, b] => Some(pick_better_replica_location(a, b, &mut rng)),
        _ => unreachable!("sampled more than two"),
    }
}

/// Of two candidates, prefer the one with fewer hosted replicas plus fewer
/// recent selections; break ties randomly.
fn pick_better_replica_location(
    a: &Arc<TsDescriptor>,
    b: &Arc<TsDescriptor>,
    rng: &mut impl Rng,
) -> Arc<TsDescriptor> {
    let load_a = a.recent_replica_creations() + a.num_live_replicas() as f64;
    let load_b = b.recent_replica_creations() + b.num_live_replicas() as f64;
    if load_a < load_b {
        Arc::clone(a)
    } else if load_b < load_a {
        Arc::clone(b)
    } else if rng.gen_bool(0.5) {
        Arc::clone(a)
    } else {
        Arc::clone(b)
    }
}
