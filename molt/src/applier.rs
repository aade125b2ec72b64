use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use molt_mysql::ServerInfo;
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql, MySqlPool, Row};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binlog::entry::{BinlogEntry, DmlKind};
use crate::binlog::streamer::{HINT_HEARTBEAT, HINT_STATE};
use crate::context::MigrationContext;
use crate::error::{ErrorKind, MoltError, MoltResult};
use crate::molt_error;
use crate::schema::{ColumnKind, ColumnMapping, UniqueKey};
use crate::sink::{ApplyStats, ChunkBoundary, ChunkStore, DmlSink, MigrationRange};
use crate::sql::builder::{
    blocked_rename_pattern, build_alter_ghost_table_query, build_changelog_write_query,
    build_chunk_insert_query, build_create_changelog_table_query, build_create_ghost_table_query,
    build_create_sentry_table_query, build_cut_over_lock_query, build_dml_delete_query,
    build_dml_insert_query, build_dml_update_query, build_drop_table_query,
    build_find_blocked_rename_query, build_next_chunk_boundary_query, build_range_extremes_query,
    build_swap_tables_query, unique_key_values,
};
use crate::sql::{ColumnValue, OptimizerHints};

type MySqlQuery<'q> = sqlx::query::Query<'q, MySql, MySqlArguments>;

/// Binds a dynamic value onto a prepared statement.
pub(crate) fn bind_value<'q>(query: MySqlQuery<'q>, value: &'q ColumnValue) -> MySqlQuery<'q> {
    match value {
        ColumnValue::Null => query.bind(Option::<i64>::None),
        ColumnValue::Int(v) => query.bind(*v),
        ColumnValue::UInt(v) => query.bind(*v),
        ColumnValue::Float(v) => query.bind(*v),
        ColumnValue::Text(v) => query.bind(v.as_str()),
        ColumnValue::Bytes(v) => query.bind(v.as_slice()),
        ColumnValue::DateTime(v) => query.bind(*v),
    }
}

/// Decodes a result column according to its schema kind.
pub(crate) fn value_from_row(
    row: &MySqlRow,
    index: usize,
    kind: ColumnKind,
) -> MoltResult<ColumnValue> {
    let value = match kind {
        ColumnKind::SignedInteger => row.try_get::<Option<i64>, _>(index)?.map(ColumnValue::Int),
        ColumnKind::UnsignedInteger => {
            row.try_get::<Option<u64>, _>(index)?.map(ColumnValue::UInt)
        }
        ColumnKind::Float => row.try_get::<Option<f64>, _>(index)?.map(ColumnValue::Float),
        ColumnKind::Decimal | ColumnKind::Text | ColumnKind::Other => {
            row.try_get::<Option<String>, _>(index)?.map(ColumnValue::Text)
        }
        ColumnKind::Binary => row
            .try_get::<Option<Vec<u8>>, _>(index)?
            .map(ColumnValue::Bytes),
        ColumnKind::DateTime => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
            .map(ColumnValue::DateTime),
    };
    Ok(value.unwrap_or(ColumnValue::Null))
}

/// State of an in-flight cut-over attempt: the locker session and the
/// blocked rename task.
#[derive(Default)]
struct CutOverSessions {
    lock_conn: Option<PoolConnection<MySql>>,
    rename_task: Option<JoinHandle<MoltResult<()>>>,
}

/// Owns the ghost and changelog tables and performs every write against
/// them: DDL setup, chunk copies, DML replay and the cut-over statements.
pub struct Applier {
    context: Arc<MigrationContext>,
    pool: MySqlPool,
    hints: OptimizerHints,
    cut_over: tokio::sync::Mutex<CutOverSessions>,
}

impl Applier {
    pub fn new(context: Arc<MigrationContext>, pool: MySqlPool) -> Self {
        Applier {
            context,
            pool,
            hints: OptimizerHints::default(),
            cut_over: tokio::sync::Mutex::new(CutOverSessions::default()),
        }
    }

    pub fn with_hints(mut self, hints: OptimizerHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Snapshots the applier server's identity into the context.
    pub async fn init(&self) -> MoltResult<()> {
        let info = ServerInfo::load(&self.pool).await?;
        info!(server = %info, "applier server");
        self.context.set_applier_server_info(info);
        Ok(())
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.context.applier_server_info()
    }

    // DDL setup.

    pub async fn create_ghost_table(&self) -> MoltResult<()> {
        let query = build_create_ghost_table_query(
            &self.context.database,
            &self.context.original_table,
            &self.context.ghost_table,
        );
        info!(table = %self.context.ghost_table, "creating ghost table");
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn alter_ghost_table(&self) -> MoltResult<()> {
        let query = build_alter_ghost_table_query(
            &self.context.database,
            &self.context.ghost_table,
            &self.context.config.migration.alter,
        );
        info!(alter = %self.context.config.migration.alter, "altering ghost table");
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn create_changelog_table(&self) -> MoltResult<()> {
        let drop = build_drop_table_query(&self.context.database, &self.context.changelog_table);
        sqlx::query(&drop).execute(&self.pool).await?;

        let query = build_create_changelog_table_query(
            &self.context.database,
            &self.context.changelog_table,
        );
        info!(table = %self.context.changelog_table, "creating changelog table");
        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Drops the migration's auxiliary tables. Called on cleanup and,
    /// policy permitting, on abort.
    pub async fn drop_auxiliary_tables(&self, drop_ghost: bool) -> MoltResult<()> {
        let changelog =
            build_drop_table_query(&self.context.database, &self.context.changelog_table);
        sqlx::query(&changelog).execute(&self.pool).await?;

        if drop_ghost {
            let ghost = build_drop_table_query(&self.context.database, &self.context.ghost_table);
            sqlx::query(&ghost).execute(&self.pool).await?;
        }
        Ok(())
    }

    // Changelog writes.

    async fn write_changelog(&self, hint: &str, value: &str) -> MoltResult<()> {
        let query =
            build_changelog_write_query(&self.context.database, &self.context.changelog_table);
        sqlx::query(&query)
            .bind(hint)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Writes a heartbeat row carrying the current wall-clock time.
    pub async fn write_heartbeat(&self) -> MoltResult<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.write_changelog(HINT_HEARTBEAT, &now).await
    }

    /// Writes a state row; the streamer reflects it back through the ordered
    /// event channel once replication has caught up to this write.
    pub async fn write_changelog_state(&self, value: &str) -> MoltResult<()> {
        self.write_changelog(HINT_STATE, value).await
    }

    // Schema metadata needed per batch/chunk.

    fn unique_key(&self) -> MoltResult<UniqueKey> {
        self.context
            .unique_key()
            .ok_or_else(|| MoltError::other("unique key not chosen yet"))
    }

    fn column_mapping(&self) -> MoltResult<ColumnMapping> {
        self.context
            .column_mapping()
            .ok_or_else(|| MoltError::other("column mapping not derived yet"))
    }

    fn rewrite_entry(
        &self,
        entry: &BinlogEntry,
        mapping: &ColumnMapping,
        unique_key: &UniqueKey,
    ) -> MoltResult<Vec<(String, Vec<ColumnValue>)>> {
        let database = &self.context.database;
        let ghost = &self.context.ghost_table;
        let original_columns = self
            .context
            .original_columns()
            .ok_or_else(|| MoltError::other("original columns not inspected yet"))?;
        let key_of = |row: &[ColumnValue]| {
            unique_key_values(unique_key, |name| original_columns.index_of(name), row)
        };

        match entry.dml_event.kind {
            DmlKind::Insert => {
                let new_values = entry
                    .dml_event
                    .new_values
                    .as_deref()
                    .ok_or_else(|| missing_image(entry, "new"))?;
                Ok(vec![build_dml_insert_query(
                    database, ghost, mapping, new_values,
                )])
            }
            DmlKind::Update => {
                let new_values = entry
                    .dml_event
                    .new_values
                    .as_deref()
                    .ok_or_else(|| missing_image(entry, "new"))?;
                let where_values = entry
                    .dml_event
                    .where_values
                    .as_deref()
                    .ok_or_else(|| missing_image(entry, "where"))?;
                let old_key = key_of(where_values);
                let new_key = key_of(new_values);

                if old_key == new_key {
                    Ok(vec![build_dml_update_query(
                        database, ghost, mapping, unique_key, &old_key, new_values,
                    )])
                } else {
                    // An update that moves the unique key cannot be keyed on
                    // the pre-image alone: the pre-image row may not have
                    // been copied yet, in which case a plain UPDATE matches
                    // nothing and the row would never reach the ghost.
                    Ok(vec![
                        build_dml_delete_query(database, ghost, mapping, unique_key, &old_key),
                        build_dml_insert_query(database, ghost, mapping, new_values),
                    ])
                }
            }
            DmlKind::Delete => {
                let where_values = entry
                    .dml_event
                    .where_values
                    .as_deref()
                    .ok_or_else(|| missing_image(entry, "where"))?;
                let key_values = key_of(where_values);
                Ok(vec![build_dml_delete_query(
                    database,
                    ghost,
                    mapping,
                    unique_key,
                    &key_values,
                )])
            }
        }
    }

    // Cut-over primitives. The protocol needs three sessions: the locker
    // (holds the write locks and the sentry table), the renamer (whose swap
    // statement queues behind the locks), and the coordinator's own session
    // observing the processlist.

    /// Session one: creates the sentry table and takes write locks on the
    /// original table and the sentry. While these locks are held no client
    /// can write the original table, and the sentry's existence makes any
    /// premature swap fail.
    pub async fn cut_over_lock_tables(&self) -> MoltResult<()> {
        let lock_timeout = self.context.config.cut_over.lock_timeout_secs;
        let mut sessions = self.cut_over.lock().await;

        let mut conn = self.pool.acquire().await?;

        let drop_old = build_drop_table_query(&self.context.database, &self.context.old_table);
        sqlx::query(&drop_old).execute(&mut *conn).await?;

        let create_sentry =
            build_create_sentry_table_query(&self.context.database, &self.context.old_table);
        sqlx::query(&create_sentry).execute(&mut *conn).await?;

        let set_timeout = format!("set session lock_wait_timeout = {lock_timeout}");
        sqlx::query(&set_timeout).execute(&mut *conn).await?;

        let lock = build_cut_over_lock_query(
            &self.context.database,
            &self.context.original_table,
            &self.context.old_table,
        );
        info!(timeout_secs = lock_timeout, "locking tables for cut-over");

        let locked = tokio::time::timeout(
            Duration::from_secs(lock_timeout + 1),
            sqlx::query(&lock).execute(&mut *conn),
        )
        .await;

        match locked {
            Ok(Ok(_)) => {
                sessions.lock_conn = Some(conn);
                Ok(())
            }
            // Any failure to take the locks aborts this cut-over attempt as
            // a whole; the attempt is what gets retried.
            Ok(Err(err)) => Err(MoltError::with_source(
                ErrorKind::CutOverLockTimeout {
                    timeout_secs: lock_timeout,
                },
                err,
            )),
            Err(_) => {
                // The statement may still be executing server-side; do not
                // hand this session back to the pool.
                let _ = conn.detach().close().await;
                Err(MoltError::new(ErrorKind::CutOverLockTimeout {
                    timeout_secs: lock_timeout,
                }))
            }
        }
    }

    /// Session two: issues the atomic swap, which blocks behind the locker's
    /// write locks until they are released.
    pub async fn cut_over_start_rename(&self) -> MoltResult<()> {
        let mut sessions = self.cut_over.lock().await;

        let pool = self.pool.clone();
        let swap = build_swap_tables_query(
            &self.context.database,
            &self.context.original_table,
            &self.context.old_table,
            &self.context.ghost_table,
        );
        let lock_timeout = self.context.config.cut_over.lock_timeout_secs * 2;

        let task = tokio::spawn(async move {
            let mut conn = pool.acquire().await.map_err(MoltError::from)?;
            let set_timeout = format!("set session lock_wait_timeout = {lock_timeout}");
            sqlx::query(&set_timeout)
                .execute(&mut *conn)
                .await
                .map_err(MoltError::from)?;
            debug!(query = %swap, "issuing blocked rename");
            sqlx::query(&swap)
                .execute(&mut *conn)
                .await
                .map_err(MoltError::from)?;
            Ok(())
        });

        sessions.rename_task = Some(task);
        Ok(())
    }

    /// Session three: checks whether the swap is visibly queued behind the
    /// metadata lock.
    pub async fn cut_over_rename_is_blocked(&self) -> MoltResult<bool> {
        let pattern =
            blocked_rename_pattern(&self.context.database, &self.context.original_table);
        let row = sqlx::query(build_find_blocked_rename_query())
            .bind(&pattern)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// The commit point: still holding the write locks, the locker drops
    /// the sentry and unlocks. The queued swap then executes first, before
    /// any client DML, and observes the rename as a single instant.
    pub async fn cut_over_unlock(&self) -> MoltResult<()> {
        let mut sessions = self.cut_over.lock().await;
        let Some(mut conn) = sessions.lock_conn.take() else {
            return Err(MoltError::other("cut-over unlock without a held lock"));
        };

        let drop_sentry = build_drop_table_query(&self.context.database, &self.context.old_table);
        sqlx::query(&drop_sentry).execute(&mut *conn).await?;
        sqlx::query("unlock tables").execute(&mut *conn).await?;
        Ok(())
    }

    /// Waits for the rename task to finish and reports its outcome.
    pub async fn cut_over_await_rename(&self, timeout: Duration) -> MoltResult<()> {
        let task = {
            let mut sessions = self.cut_over.lock().await;
            sessions.rename_task.take()
        };
        let Some(task) = task else {
            return Err(MoltError::other("cut-over rename was never started"));
        };

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(MoltError::with_source(
                ErrorKind::WorkerPanicked {
                    worker: "cut-over rename".to_string(),
                },
                join_err,
            )),
            Err(_) => Err(MoltError::timeout(
                "cut-over rename",
                timeout.as_millis() as u64,
            )),
        }
    }

    /// Rolls back a failed attempt: unlock while the sentry still exists so
    /// the queued swap fails harmlessly, then clean the sentry up.
    pub async fn cut_over_abort(&self) {
        let mut sessions = self.cut_over.lock().await;

        if let Some(mut conn) = sessions.lock_conn.take() {
            if let Err(err) = sqlx::query("unlock tables").execute(&mut *conn).await {
                warn!(error = %err, "failed to unlock tables while aborting cut-over");
            }
        }

        if let Some(task) = sessions.rename_task.take() {
            // The sentry blocks the swap; the statement errors out.
            match task.await {
                Ok(Err(err)) => debug!(error = %err, "blocked rename aborted"),
                Ok(Ok(())) => warn!("rename unexpectedly succeeded during cut-over abort"),
                Err(err) => warn!(error = %err, "rename task panicked during cut-over abort"),
            }
        }

        let drop_sentry = build_drop_table_query(&self.context.database, &self.context.old_table);
        if let Err(err) = sqlx::query(&drop_sentry).execute(&self.pool).await {
            warn!(error = %err, "failed to drop sentry table while aborting cut-over");
        }
    }

    /// Executes the swap directly on a pool session. Only the two-step
    /// cut-over uses this; it runs after the locks were released, so there
    /// is a brief window in which clients see no table.
    pub async fn swap_tables_now(&self) -> MoltResult<()> {
        let swap = build_swap_tables_query(
            &self.context.database,
            &self.context.original_table,
            &self.context.old_table,
            &self.context.ghost_table,
        );
        sqlx::query(&swap).execute(&self.pool).await?;
        Ok(())
    }

    /// Verifies the swap took effect: the ghost table name must be gone and
    /// the original name present.
    pub async fn cut_over_verify(&self) -> MoltResult<()> {
        let row = sqlx::query(
            "select count(*) from information_schema.tables \
             where table_schema = ? and table_name = ?",
        )
        .bind(&self.context.database)
        .bind(&self.context.ghost_table)
        .fetch_one(&self.pool)
        .await?;
        let ghost_still_there: i64 = row.try_get(0)?;

        if ghost_still_there > 0 {
            return Err(MoltError::new(ErrorKind::RenameFailed));
        }
        Ok(())
    }
}

fn missing_image(entry: &BinlogEntry, which: &str) -> MoltError {
    molt_error!(
        ErrorKind::BinlogStreamFailed,
        "row event missing required image",
        format!("{which} image absent in {entry}")
    )
}

#[async_trait]
impl ChunkStore for Applier {
    async fn migration_range(&self) -> MoltResult<Option<MigrationRange>> {
        let unique_key = self.unique_key()?;

        let min_query = build_range_extremes_query(
            &self.context.database,
            &self.context.original_table,
            &unique_key,
            true,
        );
        let max_query = build_range_extremes_query(
            &self.context.database,
            &self.context.original_table,
            &unique_key,
            false,
        );

        let Some(min_row) = sqlx::query(&min_query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let Some(max_row) = sqlx::query(&max_query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let decode = |row: &MySqlRow| -> MoltResult<Vec<ColumnValue>> {
            unique_key
                .columns
                .columns()
                .iter()
                .enumerate()
                .map(|(i, column)| value_from_row(row, i, column.kind))
                .collect()
        };

        Ok(Some(MigrationRange {
            min_values: decode(&min_row)?,
            max_values: decode(&max_row)?,
        }))
    }

    async fn next_chunk_boundary(
        &self,
        from_values: &[ColumnValue],
        include_from: bool,
        chunk_size: i64,
    ) -> MoltResult<Option<Vec<ColumnValue>>> {
        let unique_key = self.unique_key()?;
        let (query, params) = build_next_chunk_boundary_query(
            &self.context.database,
            &self.context.original_table,
            &unique_key,
            from_values,
            include_from,
            chunk_size,
        );

        let mut prepared = sqlx::query(&query);
        for param in &params {
            prepared = bind_value(prepared, param);
        }

        let Some(row) = prepared.fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let boundary = unique_key
            .columns
            .columns()
            .iter()
            .enumerate()
            .map(|(i, column)| value_from_row(&row, i, column.kind))
            .collect::<MoltResult<Vec<_>>>()?;
        Ok(Some(boundary))
    }

    async fn copy_chunk(&self, boundary: &ChunkBoundary) -> MoltResult<ApplyStats> {
        let unique_key = self.unique_key()?;
        let mapping = self.column_mapping()?;

        let (query, params) = build_chunk_insert_query(
            &self.context.database,
            &self.context.original_table,
            &self.context.ghost_table,
            &mapping,
            &unique_key,
            &boundary.from_values,
            &boundary.to_values,
            boundary.include_from,
            &self.hints,
        );

        let started = Instant::now();
        let mut tx = self.pool.begin().await?;
        let mut prepared = sqlx::query(&query);
        for param in &params {
            prepared = bind_value(prepared, param);
        }
        let result = prepared.execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(ApplyStats {
            rows_affected: result.rows_affected(),
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl DmlSink for Applier {
    async fn apply_dml_batch(&self, entries: &[BinlogEntry]) -> MoltResult<ApplyStats> {
        if entries.is_empty() {
            return Ok(ApplyStats::default());
        }

        let unique_key = self.unique_key()?;
        let mapping = self.column_mapping()?;

        let started = Instant::now();
        let mut rows_affected = 0u64;
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            for (query, params) in self.rewrite_entry(entry, &mapping, &unique_key)? {
                let mut prepared = sqlx::query(&query);
                for param in &params {
                    prepared = bind_value(prepared, param);
                }
                let result = prepared.execute(&mut *tx).await?;
                rows_affected += result.rows_affected();
            }
        }

        tx.commit().await?;

        if let Some(last) = entries.last() {
            self.context
                .set_applied_binlog_coordinates(last.coordinates.clone());
        }

        Ok(ApplyStats {
            rows_affected,
            duration: started.elapsed(),
        })
    }
}
