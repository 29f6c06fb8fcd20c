//! Request-surface coverage: validation failures, admission refusals,
//! namespace/type administration, cluster config and balance checks.

use assert_matches::assert_matches;
use data_types::{DataType, TypeId};
use master_catalog::api::{
    AlterTableRequest, ChangeClusterConfigRequest, ColumnDefinition, CreateUdtRequest,
    GetTableLocationsRequest, IsLoadBalancedRequest, ListNamespacesRequest, ListTablesRequest,
    NamespaceIdentifier, TableIdentifier, UdtIdentifier,
};
use master_catalog::error::Error;
use master_catalog::test_util::{consensus_state, running_report, TestMaster};
use std::time::Duration;

#[tokio::test]
async fn replication_factor_above_live_servers_is_refused() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");

    // Default replication factor is 3 but only two servers are alive.
    let err = master
        .catalog
        .create_table(TestMaster::simple_create_request("t", 1))
        .await
        .unwrap_err();
    assert_matches!(err, Error::ReplicationFactorTooHigh { .. });
}

#[tokio::test]
async fn placement_minimum_sum_above_num_replicas_is_invalid_schema() {
    use data_types::{CloudInfo, PlacementBlock, PlacementInfo, ReplicationInfo};

    let master = TestMaster::start().await;
    for i in 0..4 {
        master.add_ts(&format!("ts-{i}"));
    }

    let mut req = TestMaster::simple_create_request("t", 1);
    req.replication_info = Some(ReplicationInfo {
        live_replicas: PlacementInfo {
            num_replicas: 3,
            placement_blocks: vec![PlacementBlock {
                cloud_info: CloudInfo::new("cloud1", "datacenter1", "rack1"),
                min_num_replicas: 4,
            }],
        },
    });

    let err = master.catalog.create_table(req).await.unwrap_err();
    assert_matches!(err, Error::InvalidSchema { .. });
}

#[tokio::test]
async fn too_many_tablets_is_refused() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    // 3 live servers and the default cap of 20 tablets per server.
    let err = master
        .catalog
        .create_table(TestMaster::simple_create_request("t", 61))
        .await
        .unwrap_err();
    assert_matches!(err, Error::TooManyTablets { .. });
}

#[tokio::test]
async fn schema_validation_refusals() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    // No key column.
    let mut req = TestMaster::simple_create_request("t", 1);
    for column in &mut req.columns {
        column.is_key = false;
        column.is_hash_key = false;
    }
    assert_matches!(
        master.catalog.create_table(req).await.unwrap_err(),
        Error::InvalidSchema { .. }
    );

    // Client-supplied column ids.
    let mut req = TestMaster::simple_create_request("t", 1);
    req.columns[0].id = Some(data_types::ColumnId::new(7));
    assert_matches!(
        master.catalog.create_table(req).await.unwrap_err(),
        Error::InvalidSchema { .. }
    );

    // Uncomparable key type.
    let mut req = TestMaster::simple_create_request("t", 1);
    req.columns[0].data_type = DataType::Double;
    assert_matches!(
        master.catalog.create_table(req).await.unwrap_err(),
        Error::InvalidSchema { .. }
    );

    // Reference to a type that does not exist.
    let mut req = TestMaster::simple_create_request("t", 1);
    req.columns[1].data_type = DataType::UserDefined(TypeId::from("missing"));
    assert_matches!(
        master.catalog.create_table(req).await.unwrap_err(),
        Error::InvalidSchema { .. }
    );
}

#[tokio::test]
async fn duplicate_table_name_is_already_present() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    master.create_simple_table("t", 1).await.unwrap();
    let err = master
        .catalog
        .create_table(TestMaster::simple_create_request("t", 1))
        .await
        .unwrap_err();
    assert_matches!(err, Error::AlreadyPresent { .. });
}

#[tokio::test]
async fn followers_refuse_mutations() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    master
        .consensus
        .set_leader(Some(data_types::TabletServerId::from("some-other-master")));

    let err = master
        .catalog
        .create_table(TestMaster::simple_create_request("t", 1))
        .await
        .unwrap_err();
    assert_matches!(err, Error::IllegalState { .. });
}

#[tokio::test]
async fn a_leader_that_has_not_loaded_this_term_refuses() {
    let master = TestMaster::start().await;

    // New term, loader not yet run for it.
    master.consensus.set_term(2);
    let err = master.catalog.get_cluster_config().unwrap_err();
    assert_matches!(err, Error::LeaderNotReadyToServe { .. });

    // Loading for the new term restores service.
    master.catalog.load_sys_catalog_data().await;
    master.catalog.get_cluster_config().unwrap();
}

#[tokio::test]
async fn lost_leadership_during_a_write_downgrades_to_service_unavailable() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    // The sys catalog write is refused and the consensus now shows another
    // leader: clients should retry over there.
    master.replicator.fail_next_with_lost_leadership();
    let err = master
        .catalog
        .create_table(TestMaster::simple_create_request("t", 1))
        .await
        .unwrap_err();
    assert_matches!(err, Error::ServiceUnavailable { .. });

    // The aborted creation left nothing behind.
    assert_matches!(
        master
            .catalog
            .is_create_table_done(&TableIdentifier::by_name("default", "t"))
            .unwrap_err(),
        Error::NotFound { .. }
    );
    master
        .catalog
        .create_table(TestMaster::simple_create_request("t", 1))
        .await
        .unwrap();
}

#[tokio::test]
async fn rename_crossover_rolls_back_on_a_refused_write() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    let table_id = master.create_simple_table("old", 1).await.unwrap();

    let mut req = AlterTableRequest::new(TableIdentifier::by_name("default", "old"));
    req.new_table_name = Some("new".into());
    master.replicator.fail_next_with_lost_leadership();
    let err = master.catalog.alter_table(req).await.unwrap_err();
    assert_matches!(err, Error::ServiceUnavailable { .. });

    // The new name was released, the old one still resolves, and the version
    // did not move.
    assert_matches!(
        master
            .catalog
            .get_table_schema(&TableIdentifier::by_name("default", "new"))
            .unwrap_err(),
        Error::NotFound { .. }
    );
    let table = master.table(&table_id).unwrap();
    {
        let meta = table.metadata().read();
        assert_eq!(meta.name, "old");
        assert_eq!(meta.version, 0);
    }

    // Retrying succeeds and swaps the keys.
    let mut req = AlterTableRequest::new(TableIdentifier::by_name("default", "old"));
    req.new_table_name = Some("new".into());
    master.catalog.alter_table(req).await.unwrap();
    assert_matches!(
        master
            .catalog
            .get_table_schema(&TableIdentifier::by_name("default", "old"))
            .unwrap_err(),
        Error::NotFound { .. }
    );
    master
        .catalog
        .get_table_schema(&TableIdentifier::by_name("default", "new"))
        .unwrap();
}

#[tokio::test]
async fn alter_validation_refusals() {
    use master_catalog::api::AlterTableStep;

    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");
    master.create_simple_table("t", 1).await.unwrap();
    let ident = TableIdentifier::by_name("default", "t");

    // NOT NULL addition without a read default.
    let mut req = AlterTableRequest::new(ident.clone());
    req.alter_schema_steps = vec![AlterTableStep::AddColumn {
        column: ColumnDefinition {
            id: None,
            name: "strict".into(),
            data_type: DataType::Int32,
            is_nullable: false,
            is_key: false,
            is_hash_key: false,
            read_default: None,
        },
    }];
    assert_matches!(
        master.catalog.alter_table(req).await.unwrap_err(),
        Error::InvalidArgument { .. }
    );

    // Dropping a key column.
    let mut req = AlterTableRequest::new(ident.clone());
    req.alter_schema_steps = vec![AlterTableStep::DropColumn { name: "k".into() }];
    assert_matches!(
        master.catalog.alter_table(req).await.unwrap_err(),
        Error::InvalidSchema { .. }
    );

    // Renaming to an existing column name.
    let mut req = AlterTableRequest::new(ident);
    req.alter_schema_steps = vec![AlterTableStep::RenameColumn {
        old_name: "v".into(),
        new_name: "k".into(),
    }];
    assert_matches!(
        master.catalog.alter_table(req).await.unwrap_err(),
        Error::InvalidSchema { .. }
    );
}

#[tokio::test]
async fn table_locations_cover_the_requested_range() {
    let master = TestMaster::start().await;
    let a = master.add_ts("ts-a");
    let b = master.add_ts("ts-b");
    let c = master.add_ts("ts-c");

    let table_id = master.create_simple_table("t", 4).await.unwrap();
    for tablet in master.tablets_of(&table_id) {
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
    }

    let resp = master
        .catalog
        .get_table_locations(&GetTableLocationsRequest {
            table: TableIdentifier::by_id(table_id.clone()),
            partition_key_start: None,
            partition_key_end: None,
            max_returned_locations: 100,
        })
        .unwrap();
    assert_eq!(resp.tablet_locations.len(), 4);
    assert!(resp.tablet_locations.iter().all(|l| !l.stale));
    assert!(resp
        .tablet_locations
        .iter()
        .all(|l| l.replicas.len() == 3));

    // A range covering only the second half.
    let resp = master
        .catalog
        .get_table_locations(&GetTableLocationsRequest {
            table: TableIdentifier::by_id(table_id.clone()),
            partition_key_start: Some(vec![0x80, 0x00]),
            partition_key_end: None,
            max_returned_locations: 100,
        })
        .unwrap();
    assert_eq!(resp.tablet_locations.len(), 2);

    // max_returned_locations caps the answer.
    let resp = master
        .catalog
        .get_table_locations(&GetTableLocationsRequest {
            table: TableIdentifier::by_id(table_id.clone()),
            partition_key_start: None,
            partition_key_end: None,
            max_returned_locations: 1,
        })
        .unwrap();
    assert_eq!(resp.tablet_locations.len(), 1);

    // Inverted ranges are a caller bug.
    let err = master
        .catalog
        .get_table_locations(&GetTableLocationsRequest {
            table: TableIdentifier::by_id(table_id.clone()),
            partition_key_start: Some(vec![0x90]),
            partition_key_end: Some(vec![0x10]),
            max_returned_locations: 100,
        })
        .unwrap_err();
    assert_matches!(err, Error::InvalidArgument { .. });

    let err = master
        .catalog
        .get_table_locations(&GetTableLocationsRequest {
            table: TableIdentifier::by_id(table_id),
            partition_key_start: None,
            partition_key_end: None,
            max_returned_locations: 0,
        })
        .unwrap_err();
    assert_matches!(err, Error::InvalidArgument { .. });
}

#[tokio::test]
async fn namespace_administration() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    let created = master.catalog.create_namespace("app").await.unwrap();
    assert_matches!(
        master.catalog.create_namespace("app").await.unwrap_err(),
        Error::AlreadyPresent { .. }
    );

    // Substring filtering.
    let filtered = master
        .catalog
        .list_namespaces(&ListNamespacesRequest {
            name_filter: Some("app".into()),
        })
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, created.id);

    let all = master
        .catalog
        .list_namespaces(&ListNamespacesRequest::default())
        .unwrap();
    assert!(all.len() >= 5, "bootstrap namespaces plus app: {all:?}");

    // The default namespace is indestructible.
    assert_matches!(
        master
            .catalog
            .delete_namespace(&NamespaceIdentifier::by_name("default"))
            .await
            .unwrap_err(),
        Error::CannotDeleteDefaultNamespace { .. }
    );

    // A namespace with a table refuses deletion until the table is gone.
    let mut req = TestMaster::simple_create_request("t", 1);
    req.namespace = Some(NamespaceIdentifier::by_name("app"));
    master.catalog.create_table(req).await.unwrap();
    assert_matches!(
        master
            .catalog
            .delete_namespace(&NamespaceIdentifier::by_name("app"))
            .await
            .unwrap_err(),
        Error::NamespaceIsNotEmpty { .. }
    );
}

#[tokio::test]
async fn udt_administration() {
    let master = TestMaster::start().await;
    master.add_ts("ts-a");
    master.add_ts("ts-b");
    master.add_ts("ts-c");

    let created = master
        .catalog
        .create_udt(CreateUdtRequest {
            name: "address".into(),
            namespace: NamespaceIdentifier::by_name("default"),
            field_names: vec!["street".into(), "city".into()],
            field_types: vec![DataType::String, DataType::String],
        })
        .await
        .unwrap();

    assert_matches!(
        master
            .catalog
            .create_udt(CreateUdtRequest {
                name: "address".into(),
                namespace: NamespaceIdentifier::by_name("default"),
                field_names: vec![],
                field_types: vec![],
            })
            .await
            .unwrap_err(),
        Error::TypeAlreadyPresent { .. }
    );

    let described = master
        .catalog
        .get_udt_info(&UdtIdentifier {
            type_id: Some(created.id.clone()),
            type_name: None,
            namespace: None,
        })
        .unwrap();
    assert_eq!(described.field_names, vec!["street", "city"]);

    let listed = master
        .catalog
        .list_udts(&NamespaceIdentifier::by_name("default"))
        .unwrap();
    assert_eq!(listed.len(), 1);

    // A table using the type pins it.
    let mut req = TestMaster::simple_create_request("addresses", 1);
    req.columns[1].data_type = DataType::UserDefined(created.id.clone());
    master.catalog.create_table(req).await.unwrap();

    let ident = UdtIdentifier {
        type_id: Some(created.id.clone()),
        type_name: None,
        namespace: None,
    };
    assert_matches!(
        master.catalog.delete_udt(&ident).await.unwrap_err(),
        Error::NamespaceIsNotEmpty { .. }
    );

    // Dropping the table unpins it.
    master
        .catalog
        .delete_table(&TableIdentifier::by_name("default", "addresses"))
        .await
        .unwrap();
    master.catalog.delete_udt(&ident).await.unwrap();
    assert_matches!(
        master.catalog.get_udt_info(&ident).unwrap_err(),
        Error::TypeNotFound { .. }
    );
}

#[tokio::test]
async fn list_tables_filters() {
    let master = TestMaster::start().await;
    let a = master.add_ts("ts-a");
    let b = master.add_ts("ts-b");
    let c = master.add_ts("ts-c");

    for name in ["orders", "order_items", "users"] {
        let table_id = master.create_simple_table(name, 1).await.unwrap();
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
    }

    let listed = master
        .catalog
        .list_tables(&ListTablesRequest {
            name_filter: Some("order".into()),
            namespace: Some(NamespaceIdentifier::by_name("default")),
        })
        .unwrap();
    let mut names: Vec<_> = listed.into_iter().map(|t| t.name).collect();
    names.sort();
    assert_eq!(names, vec!["order_items", "orders"]);
}

#[tokio::test]
async fn cluster_uuid_cannot_change() {
    let master = TestMaster::start().await;

    let mut config = master.catalog.get_cluster_config().unwrap();
    config.cluster_uuid = "11111111-2222-3333-4444-555555555555".into();
    let err = master
        .catalog
        .set_cluster_config(ChangeClusterConfigRequest {
            cluster_config: config,
        })
        .await
        .unwrap_err();
    assert_matches!(err, Error::InvalidClusterConfig { .. });
}

#[tokio::test]
async fn load_balance_checks() {
    let master = TestMaster::start().await;
    let a = master.add_ts("ts-a");
    let b = master.add_ts("ts-b");
    let c = master.add_ts("ts-c");

    // Fewer servers than expected: check again later.
    assert_matches!(
        master
            .catalog
            .is_load_balanced(IsLoadBalancedRequest {
                expected_num_servers: Some(5),
            })
            .unwrap_err(),
        Error::TryAgain { .. }
    );

    // Balanced load.
    for ts in [&a, &b, &c] {
        ts.set_num_live_replicas(4);
    }
    master
        .catalog
        .is_load_balanced(IsLoadBalancedRequest::default())
        .unwrap();

    // Skewed load.
    a.set_num_live_replicas(12);
    b.set_num_live_replicas(0);
    c.set_num_live_replicas(0);
    assert_matches!(
        master
            .catalog
            .is_load_balanced(IsLoadBalancedRequest::default())
            .unwrap_err(),
        Error::TryAgain { .. }
    );
}

#[tokio::test]
async fn blacklist_move_progress() {
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

    // Blacklist server A, which hosts one replica.
    let mut config = master.catalog.get_cluster_config().unwrap();
    config.server_blacklist = Some(data_types::Blacklist {
        hosts: vec![a.registration().rpc_addresses[0].clone()],
        initial_replica_load: 0,
    });
    master
        .catalog
        .set_cluster_config(ChangeClusterConfigRequest {
            cluster_config: config,
        })
        .await
        .unwrap();

    let stored = master.catalog.get_cluster_config().unwrap();
    assert_eq!(
        stored.server_blacklist.as_ref().unwrap().initial_replica_load,
        1
    );

    // Nothing moved yet.
    let progress = master.catalog.get_load_move_completion_percent().unwrap();
    assert_eq!(progress.percent, 0.0);

    // Once the replica is gone from A, the move is complete.
    tablet.remove_replica(a.permanent_uuid());
    let progress = master.catalog.get_load_move_completion_percent().unwrap();
    assert_eq!(progress.percent, 100.0);
}

#[tokio::test]
async fn incremental_report_before_full_requests_a_full_one() {
    use master_catalog::api::TabletReport;

    let master = TestMaster::start().await;
    let a = master.add_ts("ts-a");

    let updates = master
        .catalog
        .process_tablet_report(
            &a,
            &TabletReport {
                is_incremental: true,
                updated_tablets: vec![],
            },
        )
        .await
        .unwrap();
    assert!(updates.needs_full_tablet_report);

    // After a full report, incremental ones are accepted.
    master.report(&a, vec![]).await.unwrap();
    let updates = master
        .catalog
        .process_tablet_report(
            &a,
            &TabletReport {
                is_incremental: true,
                updated_tablets: vec![],
            },
        )
        .await
        .unwrap();
    assert!(!updates.needs_full_tablet_report);
}

#[tokio::test]
async fn unknown_tablet_reports_get_a_delete_instruction() {
    use data_types::TabletId;
    use master_catalog::test_util::RpcCall;

    let master = TestMaster::start().await;
    let a = master.add_ts("ts-a");

    let ghost = TabletId::from("no-such-tablet");
    master
        .report(
            &a,
            vec![running_report(&ghost, consensus_state(&[&a], Some(&a), 1, 1))],
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let deletes = master.rpc.delete_calls();
    assert!(deletes.iter().any(|call| matches!(
        call,
        RpcCall::DeleteReplica { tablet_id, .. } if tablet_id == &ghost
    )));
}

#[tokio::test]
#[should_panic(expected = "diverging leaders")]
async fn diverging_leaders_within_a_term_are_fatal() {
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

    // Same term, higher opid index, different leader: consensus divergence.
    master
        .report(
            &b,
            vec![running_report(
                tablet.id(),
                consensus_state(&[&a, &b, &c], Some(&b), 1, 2),
            )],
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn shell_mode_and_remote_bootstrap() {
    use data_types::HostPort;
    use master_catalog::api::StartRemoteBootstrapRequest;
    use master_catalog::test_util::SnapshotBootstrapSource;
    use std::sync::Arc;

    // A populated donor master.
    let donor = TestMaster::start().await;
    donor.add_ts("ts-a");
    donor.add_ts("ts-b");
    donor.add_ts("ts-c");
    donor.create_simple_table("t", 1).await.unwrap();
    let snapshot = donor.catalog.catalog_snapshot();

    let source = Arc::new(SnapshotBootstrapSource::new(snapshot));
    let master = TestMaster::start_with(Default::default(), Some(source as _)).await;

    // Bootstrapping a master that is not in shell mode is illegal.
    let req = StartRemoteBootstrapRequest {
        bootstrap_peer_uuid: data_types::TabletServerId::from("master-0"),
        bootstrap_peer_addr: HostPort::new("master-0", 7100),
        caller_term: 1,
    };
    assert_matches!(
        master.catalog.start_remote_bootstrap(req.clone()).await.unwrap_err(),
        Error::IllegalState { .. }
    );

    master.catalog.go_into_shell_mode().await.unwrap();
    assert_matches!(
        master.catalog.get_cluster_config().unwrap_err(),
        Error::IllegalState { .. }
    );
    assert_matches!(
        master.catalog.go_into_shell_mode().await.unwrap_err(),
        Error::IllegalState { .. }
    );

    master.catalog.start_remote_bootstrap(req).await.unwrap();
    assert!(!master.catalog.is_shell_mode());

    // The adopted catalog serves after the next leader load.
    master.reload_for_term(2).await;
    let listed = master
        .catalog
        .list_namespaces(&ListNamespacesRequest::default())
        .unwrap();
    assert!(listed.iter().any(|ns| ns.name == "default"));
}
