//! Test support: configuration factories, an in-memory ghost-table model
//! implementing the pipelines' write surfaces, and a scripted binlog
//! reader.

pub mod memory;
pub mod scripted_reader;

use std::sync::Arc;

use molt_config::shared::{
    CutOverConfig, MigrationConfig, MigratorConfig, ServeConfig, ThrottleConfig,
};
use molt_mysql::MySqlConnectionConfig;

use crate::context::MigrationContext;

/// A minimal valid configuration for the `shop`.`orders` migration used
/// throughout the tests.
pub fn test_config() -> MigratorConfig {
    MigratorConfig {
        inspector: MySqlConnectionConfig {
            host: "localhost".to_string(),
            port: 3306,
            database: "shop".to_string(),
            username: "molt".to_string(),
            password: None,
            timeout_secs: MySqlConnectionConfig::DEFAULT_TIMEOUT_SECS,
        },
        applier: None,
        migration: MigrationConfig {
            database: "shop".to_string(),
            table: "orders".to_string(),
            alter: "ADD COLUMN note varchar(64) NULL".to_string(),
            chunk_size: MigrationConfig::DEFAULT_CHUNK_SIZE,
            dml_batch_size: MigrationConfig::DEFAULT_DML_BATCH_SIZE,
            event_queue_capacity: MigrationConfig::DEFAULT_EVENT_QUEUE_CAPACITY,
            default_retries: 3,
            nice_ratio: 0.0,
            heartbeat_interval_ms: MigrationConfig::DEFAULT_HEARTBEAT_INTERVAL_MS,
            exact_rowcount: false,
            allow_nullable_unique_key: false,
            approve_renamed_columns: false,
            discard_foreign_keys: false,
            drop_tables_on_abort: false,
            aliyun_rds: false,
            azure_mysql: false,
            gcp_mysql: false,
            on_failure_hook: None,
        },
        throttle: ThrottleConfig::default(),
        cut_over: CutOverConfig::default(),
        serve: ServeConfig::default(),
    }
}

/// A fresh shared context over [`test_config`].
pub fn test_context() -> Arc<MigrationContext> {
    Arc::new(MigrationContext::new(test_config()).expect("test config is valid"))
}
