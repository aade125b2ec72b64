use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use molt_config::shared::MigratorConfig;
use molt_mysql::{BinlogCoordinates, InstanceKey, InstanceKeyMap, ServerInfo};
use tokio::sync::mpsc;

use crate::error::MoltError;
use crate::schema::{ColumnList, ColumnMapping, UniqueKey};
use crate::sql::builder::{changelog_table_name, ghost_table_name, old_table_name};

/// Status-variable thresholds, e.g. `Threads_running=80,Threads_connected=1000`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadMap {
    thresholds: BTreeMap<String, i64>,
}

impl LoadMap {
    /// Parses a comma delimited `name=threshold` list, replacing the current
    /// thresholds. Empty input clears the map.
    pub fn parse(spec: &str) -> Result<LoadMap, String> {
        let mut thresholds = BTreeMap::new();
        for token in spec.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, value) = token
                .split_once('=')
                .ok_or_else(|| format!("expected name=threshold, got `{token}`"))?;
            let value: i64 = value
                .trim()
                .parse()
                .map_err(|_| format!("invalid threshold in `{token}`"))?;
            thresholds.insert(name.trim().to_string(), value);
        }
        Ok(LoadMap { thresholds })
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.thresholds.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl fmt::Display for LoadMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .thresholds
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        f.write_str(&rendered.join(","))
    }
}

/// Why the migration is currently paused.
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleReason {
    CommandedByUser,
    ReplicationLag { lag_millis: i64 },
    ControlReplicaLag { key: InstanceKey, lag_millis: i64 },
    MaxLoad { metric: String, value: i64, threshold: i64 },
    CriticalLoad { metric: String, value: i64, threshold: i64 },
    ThrottleQuery,
    ThrottleHttp { status: u16 },
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleReason::CommandedByUser => f.write_str("commanded by user"),
            ThrottleReason::ReplicationLag { lag_millis } => {
                write!(f, "lag={:.3}s", *lag_millis as f64 / 1000.0)
            }
            ThrottleReason::ControlReplicaLag { key, lag_millis } => {
                write!(f, "{key} lag={:.3}s", *lag_millis as f64 / 1000.0)
            }
            ThrottleReason::MaxLoad {
                metric,
                value,
                threshold,
            } => write!(f, "max-load {metric}={value} >= {threshold}"),
            ThrottleReason::CriticalLoad {
                metric,
                value,
                threshold,
            } => write!(f, "critical-load {metric}={value} >= {threshold}"),
            ThrottleReason::ThrottleQuery => f.write_str("throttle-query"),
            ThrottleReason::ThrottleHttp { status } => {
                write!(f, "throttle-http status={status}")
            }
        }
    }
}

/// Compound fields guarded by the context's single internal lock.
#[derive(Debug, Default)]
struct ContextInner {
    max_load: LoadMap,
    critical_load: LoadMap,
    throttle_control_replicas: InstanceKeyMap,
    throttle_query: Option<String>,
    throttle_http: Option<String>,
    throttle_reason: Option<ThrottleReason>,
    recent_binlog_coordinates: Option<BinlogCoordinates>,
    applied_binlog_coordinates: Option<BinlogCoordinates>,
    last_heartbeat: Option<DateTime<Utc>>,
    unique_key: Option<UniqueKey>,
    column_mapping: Option<ColumnMapping>,
    original_columns: Option<ColumnList>,
    inspector_server_info: Option<ServerInfo>,
    applier_server_info: Option<ServerInfo>,
}

/// Process-wide mutable migration state, shared by reference between all
/// workers.
///
/// Scalar fields are mutated through atomics exclusively; compound fields go
/// through the single internal lock, which is never held across an await
/// point.
pub struct MigrationContext {
    pub config: MigratorConfig,

    pub database: String,
    pub original_table: String,
    pub ghost_table: String,
    pub old_table: String,
    pub changelog_table: String,

    started_at: Instant,

    chunk_size: AtomicI64,
    dml_batch_size: AtomicI64,
    max_lag_millis: AtomicI64,
    nice_ratio_bits: AtomicU64,

    throttle_commanded_by_user: AtomicBool,
    is_postponing_cut_over: AtomicBool,
    user_commanded_unpostpone: AtomicBool,
    row_copy_complete: AtomicBool,
    in_cut_over_critical_section: AtomicBool,

    rows_copied: AtomicU64,
    rows_estimate: AtomicU64,
    exact_count_pending: AtomicBool,
    binlog_events_read: AtomicU64,
    binlog_events_applied: AtomicU64,
    cut_over_attempts: AtomicU32,

    inner: Mutex<ContextInner>,

    abort_tx: mpsc::Sender<MoltError>,
    abort_rx: Mutex<Option<mpsc::Receiver<MoltError>>>,
}

impl MigrationContext {
    pub const MIN_CHUNK_SIZE: i64 = 10;
    pub const MAX_CHUNK_SIZE: i64 = 100_000;
    pub const MIN_DML_BATCH_SIZE: i64 = 1;
    pub const MAX_DML_BATCH_SIZE: i64 = 100;

    pub fn new(config: MigratorConfig) -> Result<Self, MoltError> {
        let mut inner = ContextInner::default();
        inner.max_load = match &config.throttle.max_load {
            Some(spec) => LoadMap::parse(spec).map_err(|reason| {
                MoltError::new(crate::error::ErrorKind::ConfigurationError {
                    parameter: "throttle.max_load".to_string(),
                    reason,
                })
            })?,
            None => LoadMap::default(),
        };
        inner.critical_load = match &config.throttle.critical_load {
            Some(spec) => LoadMap::parse(spec).map_err(|reason| {
                MoltError::new(crate::error::ErrorKind::ConfigurationError {
                    parameter: "throttle.critical_load".to_string(),
                    reason,
                })
            })?,
            None => LoadMap::default(),
        };
        let mut replicas = InstanceKeyMap::new();
        for entry in &config.throttle.control_replicas {
            let key: InstanceKey = entry.parse().map_err(|err| {
                MoltError::new(crate::error::ErrorKind::ConfigurationError {
                    parameter: "throttle.control_replicas".to_string(),
                    reason: format!("{err}"),
                })
            })?;
            replicas.add_key(key);
        }
        inner.throttle_control_replicas = replicas;
        inner.throttle_query = config.throttle.throttle_query.clone();
        inner.throttle_http = config.throttle.throttle_http.clone();

        let (abort_tx, abort_rx) = mpsc::channel(1);

        let database = config.migration.database.clone();
        let original_table = config.migration.table.clone();

        Ok(MigrationContext {
            database,
            ghost_table: ghost_table_name(&original_table),
            old_table: old_table_name(&original_table),
            changelog_table: changelog_table_name(&original_table),
            original_table,
            started_at: Instant::now(),
            chunk_size: AtomicI64::new(
                config
                    .migration
                    .chunk_size
                    .clamp(Self::MIN_CHUNK_SIZE, Self::MAX_CHUNK_SIZE),
            ),
            dml_batch_size: AtomicI64::new(
                config
                    .migration
                    .dml_batch_size
                    .clamp(Self::MIN_DML_BATCH_SIZE, Self::MAX_DML_BATCH_SIZE),
            ),
            max_lag_millis: AtomicI64::new(config.throttle.max_lag_millis),
            nice_ratio_bits: AtomicU64::new(config.migration.nice_ratio.to_bits()),
            throttle_commanded_by_user: AtomicBool::new(false),
            is_postponing_cut_over: AtomicBool::new(false),
            user_commanded_unpostpone: AtomicBool::new(false),
            row_copy_complete: AtomicBool::new(false),
            in_cut_over_critical_section: AtomicBool::new(false),
            rows_copied: AtomicU64::new(0),
            rows_estimate: AtomicU64::new(0),
            exact_count_pending: AtomicBool::new(false),
            binlog_events_read: AtomicU64::new(0),
            binlog_events_applied: AtomicU64::new(0),
            cut_over_attempts: AtomicU32::new(0),
            inner: Mutex::new(inner),
            abort_tx,
            abort_rx: Mutex::new(Some(abort_rx)),
            config,
        })
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    // Tunables.

    pub fn chunk_size(&self) -> i64 {
        self.chunk_size.load(Ordering::Relaxed)
    }

    pub fn set_chunk_size(&self, size: i64) {
        self.chunk_size.store(
            size.clamp(Self::MIN_CHUNK_SIZE, Self::MAX_CHUNK_SIZE),
            Ordering::Relaxed,
        );
    }

    pub fn dml_batch_size(&self) -> i64 {
        self.dml_batch_size.load(Ordering::Relaxed)
    }

    pub fn set_dml_batch_size(&self, size: i64) {
        self.dml_batch_size.store(
            size.clamp(Self::MIN_DML_BATCH_SIZE, Self::MAX_DML_BATCH_SIZE),
            Ordering::Relaxed,
        );
    }

    pub fn max_lag_millis(&self) -> i64 {
        self.max_lag_millis.load(Ordering::Relaxed)
    }

    pub fn set_max_lag_millis(&self, millis: i64) {
        self.max_lag_millis.store(millis.max(100), Ordering::Relaxed);
    }

    pub fn nice_ratio(&self) -> f64 {
        f64::from_bits(self.nice_ratio_bits.load(Ordering::Relaxed))
    }

    pub fn set_nice_ratio(&self, ratio: f64) {
        self.nice_ratio_bits
            .store(ratio.clamp(0.0, 100.0).to_bits(), Ordering::Relaxed);
    }

    // Flags.

    pub fn is_throttle_commanded_by_user(&self) -> bool {
        self.throttle_commanded_by_user.load(Ordering::Relaxed)
    }

    pub fn set_throttle_commanded_by_user(&self, commanded: bool) {
        self.throttle_commanded_by_user
            .store(commanded, Ordering::Relaxed);
    }

    pub fn is_postponing_cut_over(&self) -> bool {
        self.is_postponing_cut_over.load(Ordering::Relaxed)
    }

    pub fn set_postponing_cut_over(&self, postponing: bool) {
        self.is_postponing_cut_over
            .store(postponing, Ordering::Relaxed);
    }

    pub fn is_user_commanded_unpostpone(&self) -> bool {
        self.user_commanded_unpostpone.load(Ordering::Relaxed)
    }

    pub fn set_user_commanded_unpostpone(&self) {
        self.user_commanded_unpostpone.store(true, Ordering::Relaxed);
    }

    pub fn is_row_copy_complete(&self) -> bool {
        self.row_copy_complete.load(Ordering::Relaxed)
    }

    pub fn mark_row_copy_complete(&self) {
        self.row_copy_complete.store(true, Ordering::Relaxed);
    }

    /// While true the event-apply pipeline ignores the throttle gate: the
    /// cut-over drain must complete even when lag or load would otherwise
    /// pause it.
    pub fn is_in_cut_over_critical_section(&self) -> bool {
        self.in_cut_over_critical_section.load(Ordering::Relaxed)
    }

    pub fn set_in_cut_over_critical_section(&self, active: bool) {
        self.in_cut_over_critical_section
            .store(active, Ordering::Relaxed);
    }

    // Counters.

    pub fn rows_copied(&self) -> u64 {
        self.rows_copied.load(Ordering::Relaxed)
    }

    pub fn add_rows_copied(&self, rows: u64) {
        self.rows_copied.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn rows_estimate(&self) -> u64 {
        self.rows_estimate.load(Ordering::Relaxed)
    }

    pub fn set_rows_estimate(&self, estimate: u64) {
        self.rows_estimate.store(estimate, Ordering::Relaxed);
    }

    pub fn set_exact_count_pending(&self, pending: bool) {
        self.exact_count_pending.store(pending, Ordering::Relaxed);
    }

    pub fn is_exact_count_pending(&self) -> bool {
        self.exact_count_pending.load(Ordering::Relaxed)
    }

    pub fn binlog_events_read(&self) -> u64 {
        self.binlog_events_read.load(Ordering::Relaxed)
    }

    pub fn add_binlog_events_read(&self, events: u64) {
        self.binlog_events_read.fetch_add(events, Ordering::Relaxed);
    }

    pub fn binlog_events_applied(&self) -> u64 {
        self.binlog_events_applied.load(Ordering::Relaxed)
    }

    pub fn add_binlog_events_applied(&self, events: u64) {
        self.binlog_events_applied
            .fetch_add(events, Ordering::Relaxed);
    }

    pub fn cut_over_attempts(&self) -> u32 {
        self.cut_over_attempts.load(Ordering::Relaxed)
    }

    pub fn add_cut_over_attempt(&self) -> u32 {
        self.cut_over_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    // Compound state.

    pub fn max_load(&self) -> LoadMap {
        self.inner.lock().unwrap().max_load.clone()
    }

    pub fn read_max_load(&self, spec: &str) -> Result<(), String> {
        let parsed = LoadMap::parse(spec)?;
        self.inner.lock().unwrap().max_load = parsed;
        Ok(())
    }

    pub fn critical_load(&self) -> LoadMap {
        self.inner.lock().unwrap().critical_load.clone()
    }

    pub fn read_critical_load(&self, spec: &str) -> Result<(), String> {
        let parsed = LoadMap::parse(spec)?;
        self.inner.lock().unwrap().critical_load = parsed;
        Ok(())
    }

    pub fn throttle_control_replicas(&self) -> InstanceKeyMap {
        self.inner.lock().unwrap().throttle_control_replicas.clone()
    }

    pub fn read_throttle_control_replicas(&self, list: &str) -> Result<(), String> {
        let mut map = InstanceKeyMap::new();
        map.read_comma_delimited_list(list)
            .map_err(|err| err.to_string())?;
        self.inner.lock().unwrap().throttle_control_replicas = map;
        Ok(())
    }

    pub fn throttle_query(&self) -> Option<String> {
        self.inner.lock().unwrap().throttle_query.clone()
    }

    pub fn set_throttle_query(&self, query: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.throttle_query = if query.is_empty() {
            None
        } else {
            Some(query.to_string())
        };
    }

    pub fn throttle_http(&self) -> Option<String> {
        self.inner.lock().unwrap().throttle_http.clone()
    }

    pub fn set_throttle_http(&self, url: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.throttle_http = if url.is_empty() {
            None
        } else {
            Some(url.to_string())
        };
    }

    pub fn throttle_reason(&self) -> Option<ThrottleReason> {
        self.inner.lock().unwrap().throttle_reason.clone()
    }

    pub fn set_throttle_reason(&self, reason: Option<ThrottleReason>) {
        self.inner.lock().unwrap().throttle_reason = reason;
    }

    pub fn recent_binlog_coordinates(&self) -> Option<BinlogCoordinates> {
        self.inner.lock().unwrap().recent_binlog_coordinates.clone()
    }

    pub fn set_recent_binlog_coordinates(&self, coordinates: BinlogCoordinates) {
        self.inner.lock().unwrap().recent_binlog_coordinates = Some(coordinates);
    }

    pub fn applied_binlog_coordinates(&self) -> Option<BinlogCoordinates> {
        self.inner.lock().unwrap().applied_binlog_coordinates.clone()
    }

    pub fn set_applied_binlog_coordinates(&self, coordinates: BinlogCoordinates) {
        self.inner.lock().unwrap().applied_binlog_coordinates = Some(coordinates);
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().unwrap().last_heartbeat
    }

    pub fn set_last_heartbeat(&self, heartbeat: DateTime<Utc>) {
        self.inner.lock().unwrap().last_heartbeat = Some(heartbeat);
    }

    /// Heartbeat-measured replication lag of the inspected server.
    pub fn heartbeat_lag(&self) -> Option<Duration> {
        self.last_heartbeat()
            .map(|hb| (Utc::now() - hb).to_std().unwrap_or_default())
    }

    pub fn unique_key(&self) -> Option<UniqueKey> {
        self.inner.lock().unwrap().unique_key.clone()
    }

    pub fn set_unique_key(&self, key: UniqueKey) {
        self.inner.lock().unwrap().unique_key = Some(key);
    }

    pub fn column_mapping(&self) -> Option<ColumnMapping> {
        self.inner.lock().unwrap().column_mapping.clone()
    }

    pub fn set_column_mapping(&self, mapping: ColumnMapping) {
        self.inner.lock().unwrap().column_mapping = Some(mapping);
    }

    pub fn original_columns(&self) -> Option<ColumnList> {
        self.inner.lock().unwrap().original_columns.clone()
    }

    pub fn set_original_columns(&self, columns: ColumnList) {
        self.inner.lock().unwrap().original_columns = Some(columns);
    }

    pub fn inspector_server_info(&self) -> Option<ServerInfo> {
        self.inner.lock().unwrap().inspector_server_info.clone()
    }

    pub fn set_inspector_server_info(&self, info: ServerInfo) {
        self.inner.lock().unwrap().inspector_server_info = Some(info);
    }

    pub fn applier_server_info(&self) -> Option<ServerInfo> {
        self.inner.lock().unwrap().applier_server_info.clone()
    }

    pub fn set_applier_server_info(&self, info: ServerInfo) {
        self.inner.lock().unwrap().applier_server_info = Some(info);
    }

    // Abort channel.

    /// Publishes a fatal error. The first error wins; later calls are
    /// dropped because teardown is already under way.
    pub fn panic_abort(&self, error: MoltError) {
        let _ = self.abort_tx.try_send(error);
    }

    /// Takes the abort receiver. Only the coordinator calls this, once.
    pub fn take_abort_receiver(&self) -> Option<mpsc::Receiver<MoltError>> {
        self.abort_rx.lock().unwrap().take()
    }

    /// Estimated migration progress in percent.
    pub fn progress_pct(&self) -> f64 {
        let estimate = self.rows_estimate();
        if estimate == 0 {
            return 100.0;
        }
        (self.rows_copied() as f64 / estimate as f64 * 100.0).min(100.0)
    }
}

impl fmt::Debug for MigrationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationContext")
            .field("database", &self.database)
            .field("original_table", &self.original_table)
            .field("ghost_table", &self.ghost_table)
            .field("rows_copied", &self.rows_copied())
            .field("binlog_events_applied", &self.binlog_events_applied())
            .finish()
    }
}
