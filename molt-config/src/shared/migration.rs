use molt_mysql::MySqlConnectionConfig;
use serde::Deserialize;

use crate::load::Config;
use crate::shared::{CutOverConfig, ServeConfig, ThrottleConfig, ValidationError};

/// What to migrate and how aggressively.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Database (schema) the migrated table lives in.
    pub database: String,
    /// Name of the table being altered.
    pub table: String,
    /// The ALTER TABLE clause to apply, without the `ALTER TABLE <name>`
    /// prefix (e.g. `ADD COLUMN shipped_at TIMESTAMP NULL`).
    pub alter: String,

    /// Rows copied per chunk transaction.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    /// Maximum binlog events applied in one transaction.
    #[serde(default = "default_dml_batch_size")]
    pub dml_batch_size: i64,
    /// Capacity of the decoded binlog entry queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    /// Budget for retrying transient failures before giving up.
    #[serde(default = "default_retries")]
    pub default_retries: u32,
    /// Sleep after each copied chunk, as a fraction of the chunk duration.
    #[serde(default)]
    pub nice_ratio: f64,
    /// Interval between heartbeat writes into the changelog table.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Run an exact `SELECT COUNT(*)` concurrently with row copy; its result
    /// supersedes the information-schema estimate.
    #[serde(default)]
    pub exact_rowcount: bool,
    /// Allow iterating on a unique key with nullable columns.
    #[serde(default)]
    pub allow_nullable_unique_key: bool,
    /// Apply column renames detected in the ALTER text without aborting.
    #[serde(default)]
    pub approve_renamed_columns: bool,
    /// Proceed although the table has foreign keys, discarding them on the
    /// ghost.
    #[serde(default)]
    pub discard_foreign_keys: bool,
    /// Drop the ghost and changelog tables when the migration aborts.
    #[serde(default)]
    pub drop_tables_on_abort: bool,

    /// Accept a NULL `@@global.port` (Aliyun RDS).
    #[serde(default)]
    pub aliyun_rds: bool,
    /// Accept a NULL `@@global.port` (Azure Database for MySQL).
    #[serde(default)]
    pub azure_mysql: bool,
    /// Accept a NULL `@@global.port` (Google Cloud SQL).
    #[serde(default)]
    pub gcp_mysql: bool,

    /// External command executed when the migration fails.
    #[serde(default)]
    pub on_failure_hook: Option<String>,
}

impl MigrationConfig {
    pub const DEFAULT_CHUNK_SIZE: i64 = 1000;
    pub const DEFAULT_DML_BATCH_SIZE: i64 = 10;
    pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 100;
    pub const DEFAULT_RETRIES: u32 = 60;
    pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 100;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.database.is_empty() {
            return Err(ValidationError::missing("migration.database"));
        }
        if self.table.is_empty() {
            return Err(ValidationError::missing("migration.table"));
        }
        if self.alter.is_empty() {
            return Err(ValidationError::missing("migration.alter"));
        }
        if self.chunk_size <= 0 {
            return Err(ValidationError::invalid(
                "migration.chunk_size",
                "must be greater than 0",
            ));
        }
        if self.dml_batch_size <= 0 {
            return Err(ValidationError::invalid(
                "migration.dml_batch_size",
                "must be greater than 0",
            ));
        }
        if !(0.0..=100.0).contains(&self.nice_ratio) {
            return Err(ValidationError::invalid(
                "migration.nice_ratio",
                "must be within 0..=100",
            ));
        }
        Ok(())
    }
}

fn default_chunk_size() -> i64 {
    MigrationConfig::DEFAULT_CHUNK_SIZE
}

fn default_dml_batch_size() -> i64 {
    MigrationConfig::DEFAULT_DML_BATCH_SIZE
}

fn default_event_queue_capacity() -> usize {
    MigrationConfig::DEFAULT_EVENT_QUEUE_CAPACITY
}

fn default_retries() -> u32 {
    MigrationConfig::DEFAULT_RETRIES
}

fn default_heartbeat_interval_ms() -> u64 {
    MigrationConfig::DEFAULT_HEARTBEAT_INTERVAL_MS
}

/// Complete configuration for one migration run.
#[derive(Debug, Clone, Deserialize)]
pub struct MigratorConfig {
    /// Server the migration inspects and streams the binlog from
    /// (a replica, or the primary itself).
    pub inspector: MySqlConnectionConfig,
    /// Server the migration writes to. Defaults to the inspector's server
    /// when absent.
    #[serde(default)]
    pub applier: Option<MySqlConnectionConfig>,
    pub migration: MigrationConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub cut_over: CutOverConfig,
    #[serde(default)]
    pub serve: ServeConfig,
}

impl MigratorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.migration.validate()?;
        self.throttle.validate()?;
        self.cut_over.validate()?;
        Ok(())
    }

    /// The applier connection config, falling back to the inspector's.
    pub fn applier_connection(&self) -> &MySqlConnectionConfig {
        self.applier.as_ref().unwrap_or(&self.inspector)
    }
}

impl Config for MigratorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &["throttle.control_replicas"];
}
