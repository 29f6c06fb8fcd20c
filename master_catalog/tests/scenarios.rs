//! End-to-end scenarios driven through the public catalog manager surface.

use assert_matches::assert_matches;
use data_types::{TableState, TabletState};
use master_catalog::api::TableIdentifier;
use master_catalog::error::Error;
use master_catalog::rpc::TabletDataState;
use master_catalog::test_util::{consensus_state, running_report, RpcCall, TestMaster};
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn fresh_cluster_bootstrap() {
    let master = TestMaster::start().await;
    let a = master.add_ts("ts-a");
    let b = master.add_ts("ts-b");
    let c = master.add_ts("ts-c");

    let table_id = master.create_simple_table("t", 1).await.unwrap();
    let tablets = master.tablets_of(&table_id);
    assert_eq!(tablets.len(), 1);
    let tablet = &tablets[0];

    // The create tail already moved the tablet to CREATING and fanned one
    // create request out to each of the three servers.
    assert_eq!(tablet.metadata().read().state, TabletState::Creating);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let targets: HashSet<_> = master.rpc.create_targets(tablet.id()).into_iter().collect();
    assert_eq!(targets.len(), 3);

    // One heartbeat carrying an elected leader brings tablet and table
    // online.
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

    assert_eq!(tablet.metadata().read().state, TabletState::Running);
    let table = master.table(&table_id).unwrap();
    assert_eq!(table.metadata().read().state, TableState::Running);
    assert_eq!(tablet.replica_locations().len(), 3);

    let done = master
        .catalog
        .is_create_table_done(&TableIdentifier::by_name("default", "t"))
        .unwrap();
    assert!(done.done);
}

#[tokio::test]
async fn stuck_creation_replaces_the_tablet() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    let table_id = master.create_simple_table("t", 1).await.unwrap();
    let original = master.tablets_of(&table_id)[0].clone();
    assert_eq!(original.metadata().read().state, TabletState::Creating);

    // No server ever reports; push the clock past the creation timeout and
    // run a background pass.
    master.time.inc(Duration::from_millis(30_000 + 1));
    master.tick().await;

    assert_eq!(original.metadata().read().state, TabletState::Replaced);

    let replacements = master.tablets_of(&table_id);
    assert_eq!(replacements.len(), 1);
    let replacement = &replacements[0];
    assert_ne!(replacement.id(), original.id());
    assert_eq!(replacement.metadata().read().state, TabletState::Creating);
    assert_eq!(
        replacement.metadata().read().partition,
        original.metadata().read().partition
    );

    // The replacement got its own create requests.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(master.rpc.create_targets(replacement.id()).len(), 3);

    // The retired tablet remains known by id.
    assert!(master.tablet(original.id()).is_some());
}

#[tokio::test]
async fn evicted_replica_is_tombstoned() {
    let master = TestMaster::start().await;
    let a = master.add_ts("ts-a");
    let b = master.add_ts("ts-b");
    let c = master.add_ts("ts-c");
    let d = master.add_ts("ts-d");

    let table_id = master.create_simple_table("t", 1).await.unwrap();
    let tablet = master.tablets_of(&table_id)[0].clone();

    // Reach a committed config {A, B, C} at opid index 5.
    master
        .report(
            &a,
            vec![running_report(
                tablet.id(),
                consensus_state(&[&a, &b, &c], Some(&a), 1, 5),
            )],
        )
        .await
        .unwrap();
    master.rpc.take_calls();

    // A reports a newer config {A, B, D} at opid index 7.
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

    let cstate = tablet.metadata().read().committed_consensus_state.clone();
    assert_eq!(cstate.config.opid_index, 7);
    assert!(cstate.config.contains(d.permanent_uuid()));
    assert!(!cstate.config.contains(c.permanent_uuid()));

    let replicas: HashSet<_> = tablet.replica_locations().keys().cloned().collect();
    assert_eq!(
        replicas,
        HashSet::from([
            a.permanent_uuid().clone(),
            b.permanent_uuid().clone(),
            d.permanent_uuid().clone(),
        ])
    );

    // C got exactly one tombstone gated on the previous opid index.
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
                    cas_config_opid_index_less_or_equal: Some(5),
                    ..
                } if server == c.permanent_uuid()
            )
        })
        .collect();
    assert_eq!(tombstones.len(), 1);
}

#[tokio::test]
async fn alter_propagation_round_trip() {
    use master_catalog::api::{AlterTableRequest, AlterTableStep, ColumnDefinition};

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
    master.rpc.take_calls();

    let table = master.table(&table_id).unwrap();
    let old_columns = table.metadata().read().schema.columns().len();

    let mut req = AlterTableRequest::new(TableIdentifier::by_id(table_id.clone()));
    req.alter_schema_steps = vec![AlterTableStep::AddColumn {
        column: ColumnDefinition {
            id: None,
            name: "c".into(),
            data_type: data_types::DataType::Int32,
            is_nullable: true,
            is_key: false,
            is_hash_key: false,
            read_default: None,
        },
    }];
    master.catalog.alter_table(req).await.unwrap();

    {
        let meta = table.metadata().read();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.state, TableState::Altering);
        let previous = meta.fully_applied_schema.as_ref().unwrap();
        assert_eq!(previous.columns().len(), old_columns);
        assert_eq!(meta.schema.columns().len(), old_columns + 1);
    }

    // Clients read the fully-applied (previous) schema mid-alter.
    let resp = master
        .catalog
        .get_table_schema(&TableIdentifier::by_id(table_id.clone()))
        .unwrap();
    assert_eq!(resp.schema.columns().len(), old_columns);
    assert_eq!(resp.version, 1);

    // The alter went out to the tablet's leader.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let alter_sent = master.rpc.calls().iter().any(|call| {
        matches!(
            call,
            RpcCall::AlterReplica { server, schema_version: 1, .. }
                if server == a.permanent_uuid()
        )
    });
    assert!(alter_sent);

    // Once every tablet reports the new version the alter completes.
    let mut report = running_report(tablet.id(), consensus_state(&[&a, &b, &c], Some(&a), 1, 1));
    report.schema_version = Some(1);
    master.report(&a, vec![report]).await.unwrap();

    let meta = table.metadata().read();
    assert_eq!(meta.state, TableState::Running);
    assert!(meta.fully_applied_schema.is_none());

    let done = master
        .catalog
        .is_alter_table_done(&TableIdentifier::by_id(table_id))
        .unwrap();
    assert!(done.done);
    assert_eq!(done.schema_version, 1);
}

#[tokio::test]
async fn placement_minimums_are_enforced() {
    use data_types::{CloudInfo, PlacementBlock, PlacementInfo, ReplicationInfo};

    let master = TestMaster::start().await;
    master
        .ts_manager
        .add_ts("east-1", CloudInfo::new("aws", "us-east", "1a"));
    master
        .ts_manager
        .add_ts("west-1", CloudInfo::new("aws", "us-west", "1a"));
    master
        .ts_manager
        .add_ts("west-2", CloudInfo::new("aws", "us-west", "1a"));

    let mut req = TestMaster::simple_create_request("t", 1);
    req.replication_info = Some(ReplicationInfo {
        live_replicas: PlacementInfo {
            num_replicas: 3,
            placement_blocks: vec![
                PlacementBlock {
                    cloud_info: CloudInfo::new("aws", "us-east", "1a"),
                    min_num_replicas: 2,
                },
                PlacementBlock {
                    cloud_info: CloudInfo::new("aws", "us-west", "1a"),
                    min_num_replicas: 1,
                },
            ],
        },
    });

    let err = master.catalog.create_table(req).await.unwrap_err();
    assert_matches!(err, Error::InvalidArgument { .. });
    assert!(err.to_string().contains("Not enough tablet servers in"));

    // Nothing was created.
    let err = master
        .catalog
        .is_create_table_done(&TableIdentifier::by_name("default", "t"))
        .unwrap_err();
    assert_matches!(err, Error::NotFound { .. });
}

#[tokio::test]
async fn cluster_config_is_a_version_cas() {
    use master_catalog::api::ChangeClusterConfigRequest;

    let master = TestMaster::start().await;

    let current = master.catalog.get_cluster_config().unwrap();
    assert_eq!(current.version, 0);

    // Two clients race on the same observed version; exactly one wins.
    let mut first = current.clone();
    first.replication_info.live_replicas.num_replicas = 5;
    master
        .catalog
        .set_cluster_config(ChangeClusterConfigRequest {
            cluster_config: first,
        })
        .await
        .unwrap();

    let mut second = current;
    second.replication_info.live_replicas.num_replicas = 7;
    let err = master
        .catalog
        .set_cluster_config(ChangeClusterConfigRequest {
            cluster_config: second,
        })
        .await
        .unwrap_err();
    assert_matches!(err, Error::ConfigVersionMismatch { .. });

    let after = master.catalog.get_cluster_config().unwrap();
    assert_eq!(after.version, 1);
    assert_eq!(after.replication_info.live_replicas.num_replicas, 5);
}

#[tokio::test]
async fn load_is_idempotent() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    master.catalog.create_namespace("app").await.unwrap();
    let table_id = master.create_simple_table("t", 2).await.unwrap();

    let snapshot = |m: &TestMaster| {
        let mut tablet_states: Vec<_> = m
            .tablets_of(&table_id)
            .iter()
            .map(|t| (t.id().clone(), t.metadata().read().state))
            .collect();
        tablet_states.sort_by(|x, y| x.0.cmp(&y.0));
        let mut namespaces: Vec<_> = m
            .catalog
            .list_namespaces(&Default::default())
            .unwrap()
            .into_iter()
            .map(|ns| ns.name)
            .collect();
        namespaces.sort();
        (tablet_states, namespaces)
    };

    master.reload_for_term(2).await;
    let first = snapshot(&master);

    master.reload_for_term(3).await;
    let second = snapshot(&master);

    assert_eq!(first, second);
    assert_eq!(master.catalog.get_cluster_config().unwrap().version, 0);
}

#[tokio::test]
async fn reports_are_idempotent() {
    let master = TestMaster::start().await;
    let a = master.add_ts("ts-a");
    let b = master.add_ts("ts-b");
    let c = master.add_ts("ts-c");

    let table_id = master.create_simple_table("t", 1).await.unwrap();
    let tablet = master.tablets_of(&table_id)[0].clone();

    let report = running_report(tablet.id(), consensus_state(&[&a, &b, &c], Some(&a), 1, 3));
    master.report(&a, vec![report.clone()]).await.unwrap();

    let committed_before = data_types::TabletMetadata::clone(&tablet.metadata().read());
    let replicas_before: HashSet<_> = tablet.replica_locations().keys().cloned().collect();

    master.report(&a, vec![report]).await.unwrap();

    assert_eq!(*tablet.metadata().read(), committed_before);
    let replicas_after: HashSet<_> = tablet.replica_locations().keys().cloned().collect();
    assert_eq!(replicas_before, replicas_after);
}

#[tokio::test]
async fn recreating_a_table_requires_the_delete_to_finish() {
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

    let identifier = TableIdentifier::by_name("default", "t");
    master.catalog.delete_table(&identifier).await.unwrap();

    let table = master.table(&table_id).unwrap();
    assert_eq!(table.metadata().read().state, TableState::Deleting);

    // Let the fanned-out delete-replica tasks drain.
    tokio::time::sleep(Duration::from_millis(50)).await;
    table.tasks().wait_completion().await;

    // While replicas have not acknowledged, the name stays taken.
    let err = master
        .catalog
        .create_table(TestMaster::simple_create_request("t", 1))
        .await
        .unwrap_err();
    assert_matches!(err, Error::AlreadyPresent { .. });

    let done = master.catalog.is_delete_table_done(&table_id).unwrap();
    assert!(!done.done);

    // Acknowledge all three replica deletions.
    for ts in [&a, &b, &c] {
        master
            .catalog
            .notify_tablet_delete_finished(ts.permanent_uuid(), tablet.id())
            .await;
    }

    assert_eq!(table.metadata().read().state, TableState::Deleted);
    let done = master.catalog.is_delete_table_done(&table_id).unwrap();
    assert!(done.done);

    // Now the name is free again.
    master
        .catalog
        .create_table(TestMaster::simple_create_request("t", 1))
        .await
        .unwrap();
}
