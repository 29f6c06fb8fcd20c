//! Catalog manager configuration.

use clap::ArgAction;
use std::time::Duration;

/// Configuration options recognised by the catalog manager. Every option can
/// be set either with a command line flag or with the corresponding
/// environment variable.
#[derive(Debug, Clone, clap::Parser)]
pub struct MasterConfig {
    /// Deadline for outbound RPCs to tablet servers.
    #[clap(
        long = "master-ts-rpc-timeout-ms",
        env = "MASTER_TS_RPC_TIMEOUT_MS",
        default_value_t = 30_000
    )]
    pub master_ts_rpc_timeout_ms: u64,

    /// How long a tablet may stay in the CREATING state before it is replaced
    /// by a fresh tablet covering the same partition.
    #[clap(
        long = "tablet-creation-timeout-ms",
        env = "MASTER_TABLET_CREATION_TIMEOUT_MS",
        default_value_t = 30_000
    )]
    pub tablet_creation_timeout_ms: u64,

    /// Whether a new tablet only becomes RUNNING once its replicas elected a
    /// leader. Disabled in tests that run without leader election.
    #[clap(
        long = "catalog-manager-wait-for-new-tablets-to-elect-leader",
        env = "MASTER_CATALOG_MANAGER_WAIT_FOR_NEW_TABLETS_TO_ELECT_LEADER",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub catalog_manager_wait_for_new_tablets_to_elect_leader: bool,

    /// Default number of replicas for tables that do not specify one.
    #[clap(
        long = "replication-factor",
        env = "MASTER_REPLICATION_FACTOR",
        default_value_t = 3
    )]
    pub replication_factor: usize,

    /// Upper bound on how long the background task loop sleeps between passes.
    #[clap(
        long = "catalog-manager-bg-task-wait-ms",
        env = "MASTER_CATALOG_MANAGER_BG_TASK_WAIT_MS",
        default_value_t = 1_000
    )]
    pub catalog_manager_bg_task_wait_ms: u64,

    /// Maximum number of tablets a single CreateTable may spread over each
    /// live tablet server.
    #[clap(
        long = "max-create-tablets-per-ts",
        env = "MASTER_MAX_CREATE_TABLETS_PER_TS",
        default_value_t = 20
    )]
    pub max_create_tablets_per_ts: usize,

    /// Deadline for the newly elected leader to catch up with the replicated
    /// catalog before loading it.
    #[clap(
        long = "master-failover-catchup-timeout-ms",
        env = "MASTER_FAILOVER_CATCHUP_TIMEOUT_MS",
        default_value_t = 30_000
    )]
    pub master_failover_catchup_timeout_ms: u64,

    /// Whether replicas evicted from a tablet's consensus config are
    /// tombstoned on their host.
    #[clap(
        long = "master-tombstone-evicted-tablet-replicas",
        env = "MASTER_TOMBSTONE_EVICTED_TABLET_REPLICAS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub master_tombstone_evicted_tablet_replicas: bool,

    /// Whether CreateTable refuses replication factors larger than the number
    /// of live tablet servers.
    #[clap(
        long = "catalog-manager-check-ts-count-for-create-table",
        env = "MASTER_CATALOG_MANAGER_CHECK_TS_COUNT_FOR_CREATE_TABLE",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub catalog_manager_check_ts_count_for_create_table: bool,

    /// Cluster uuid written into the very first ClusterConfig. If empty a
    /// random uuid is generated. An existing persisted config always wins.
    #[clap(
        long = "cluster-uuid",
        env = "MASTER_CLUSTER_UUID",
        default_value = ""
    )]
    pub cluster_uuid: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            master_ts_rpc_timeout_ms: 30_000,
            tablet_creation_timeout_ms: 30_000,
            catalog_manager_wait_for_new_tablets_to_elect_leader: true,
            replication_factor: 3,
            catalog_manager_bg_task_wait_ms: 1_000,
            max_create_tablets_per_ts: 20,
            master_failover_catchup_timeout_ms: 30_000,
            master_tombstone_evicted_tablet_replicas: true,
            catalog_manager_check_ts_count_for_create_table: true,
            cluster_uuid: String::new(),
        }
    }
}

impl MasterConfig {
    /// Outbound RPC deadline.
    pub fn ts_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.master_ts_rpc_timeout_ms)
    }

    /// CREATING → REPLACED timeout.
    pub fn tablet_creation_timeout(&self) -> Duration {
        Duration::from_millis(self.tablet_creation_timeout_ms)
    }

    /// Background loop sleep bound.
    pub fn bg_task_wait(&self) -> Duration {
        Duration::from_millis(self.catalog_manager_bg_task_wait_ms)
    }

    /// Loader catch-up deadline.
    pub fn failover_catchup_timeout(&self) -> Duration {
        Duration::from_millis(self.master_failover_catchup_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_flag_defaults() {
        let parsed = MasterConfig::try_parse_from(["test"]).unwrap();
        let defaulted = MasterConfig::default();
        assert_eq!(parsed.replication_factor, defaulted.replication_factor);
        assert_eq!(
            parsed.tablet_creation_timeout_ms,
            defaulted.tablet_creation_timeout_ms
        );
        assert!(parsed.catalog_manager_wait_for_new_tablets_to_elect_leader);
        assert!(parsed.cluster_uuid.is_empty());
    }

    #[test]
    fn flags_override_defaults() {
        let parsed = MasterConfig::try_parse_from([
            "test",
            "--replication-factor",
            "5",
            "--catalog-manager-wait-for-new-tablets-to-elect-leader",
            "false",
        ])
        .unwrap();
        assert_eq!(parsed.replication_factor, 5);
        assert!(!parsed.catalog_manager_wait_for_new_tablets_to_elect_leader);
    }
}
