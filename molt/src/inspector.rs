use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use molt_mysql::ServerInfo;
use sqlx::{MySqlPool, Row};
use tracing::{info, warn};

use crate::context::MigrationContext;
use crate::error::{ErrorKind, MoltError, MoltResult};
use crate::molt_error;
use crate::schema::{Column, ColumnKind, ColumnList, UniqueKey};

/// Checks that the server the pool landed on is the server the operator
/// configured.
///
/// The reported `@@global.port` (or `@@global.extra_port` on servers that
/// expose one) must match the configured port. Some managed MySQL flavours
/// report NULL for both; `allow_null_port` accepts that.
pub fn validate_connection(
    info: &ServerInfo,
    configured_port: u16,
    allow_null_port: bool,
    role: &str,
) -> MoltResult<()> {
    if info.port.matches(configured_port) || info.extra_port.matches(configured_port) {
        return Ok(());
    }

    if !info.port.is_valid() && !info.extra_port.is_valid() {
        if allow_null_port {
            return Ok(());
        }
        return Err(MoltError::new(ErrorKind::ConnectionValidationFailed {
            role: role.to_string(),
            reason: "server reports no port and no cloud flavour is configured".to_string(),
        }));
    }

    Err(MoltError::new(ErrorKind::ConnectionValidationFailed {
        role: role.to_string(),
        reason: format!(
            "configured port {configured_port} does not match server port {:?} / extra_port {:?}",
            info.port.0, info.extra_port.0
        ),
    }))
}

/// Reads the last heartbeat timestamp from a server's copy of the changelog
/// table. Used against the inspected server and against throttle-control
/// replicas, whose replication streams carry the changelog writes.
pub async fn read_changelog_heartbeat(
    pool: &MySqlPool,
    database: &str,
    changelog_table: &str,
) -> MoltResult<Option<DateTime<Utc>>> {
    let query = format!(
        "select value from {} where hint = 'heartbeat'",
        crate::sql::builder::quote_table(database, changelog_table),
    );

    let Some(row) = sqlx::query(&query).fetch_optional(pool).await? else {
        return Ok(None);
    };
    let value: String = row.try_get(0)?;

    match DateTime::parse_from_rfc3339(&value) {
        Ok(written_at) => Ok(Some(written_at.with_timezone(&Utc))),
        Err(err) => {
            warn!(value = %value, error = %err, "unparseable heartbeat value in changelog");
            Ok(None)
        }
    }
}

/// Heartbeat-derived replication lag of the given server.
pub async fn heartbeat_lag(
    pool: &MySqlPool,
    database: &str,
    changelog_table: &str,
) -> MoltResult<Option<Duration>> {
    let heartbeat = read_changelog_heartbeat(pool, database, changelog_table).await?;
    Ok(heartbeat.map(|hb| (Utc::now() - hb).to_std().unwrap_or_default()))
}

/// Reads one `SHOW GLOBAL STATUS` variable as an integer.
pub async fn show_status_variable(pool: &MySqlPool, name: &str) -> MoltResult<Option<i64>> {
    let row = sqlx::query("show global status like ?")
        .bind(name)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let value: String = row.try_get(1)?;
    Ok(value.parse().ok())
}

/// Reads schema metadata off the inspected server and validates the
/// environment before any work starts.
pub struct Inspector {
    context: Arc<MigrationContext>,
    pool: MySqlPool,
}

impl Inspector {
    pub fn new(context: Arc<MigrationContext>, pool: MySqlPool) -> Self {
        Inspector { context, pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Snapshots the inspected server's identity and validates the
    /// connection against the configured endpoint.
    pub async fn init(&self) -> MoltResult<()> {
        let info = ServerInfo::load(&self.pool).await?;
        info!(server = %info, "inspected server");

        let migration = &self.context.config.migration;
        let allow_null_port = migration.aliyun_rds || migration.azure_mysql || migration.gcp_mysql;
        validate_connection(
            &info,
            self.context.config.inspector.port,
            allow_null_port,
            "inspector",
        )?;

        if info.binlog_format.to_ascii_uppercase() != "ROW" {
            return Err(MoltError::new(ErrorKind::ConnectionValidationFailed {
                role: "inspector".to_string(),
                reason: format!(
                    "binlog_format must be ROW, server reports {}",
                    info.binlog_format
                ),
            }));
        }
        if info.binlog_row_image.to_ascii_uppercase() != "FULL" {
            return Err(MoltError::new(ErrorKind::ConnectionValidationFailed {
                role: "inspector".to_string(),
                reason: format!(
                    "binlog_row_image must be FULL, server reports {}",
                    info.binlog_row_image
                ),
            }));
        }

        self.context.set_inspector_server_info(info);
        Ok(())
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.context.inspector_server_info()
    }

    /// Validates the original table and returns its columns, candidate
    /// unique keys and an estimated row count.
    pub async fn inspect_original_table(
        &self,
    ) -> MoltResult<(ColumnList, Vec<UniqueKey>, u64)> {
        let database = self.context.database.clone();
        let table = self.context.original_table.clone();

        let columns = self.read_table_columns(&table).await?;
        if columns.is_empty() {
            return Err(MoltError::new(ErrorKind::TableNotFound { database, table }));
        }

        let migration = &self.context.config.migration;
        let foreign_keys = self.count_foreign_keys(&table).await?;
        if foreign_keys > 0 && !migration.discard_foreign_keys {
            return Err(MoltError::new(ErrorKind::ForeignKeysFound {
                table,
                count: foreign_keys,
            }));
        }

        let unique_keys = self.read_unique_keys(&table, &columns).await?;
        if unique_keys.is_empty() {
            return Err(MoltError::new(ErrorKind::NoUsableUniqueKey { table }));
        }

        let estimate = self.estimate_row_count().await?;
        info!(
            table = %self.context.original_table,
            columns = columns.len(),
            unique_keys = unique_keys.len(),
            rows_estimate = estimate,
            "inspected original table"
        );

        Ok((columns, unique_keys, estimate))
    }

    /// Reads the ghost table's columns after the ALTER was applied to it.
    pub async fn inspect_ghost_columns(&self) -> MoltResult<ColumnList> {
        let ghost_table = self.context.ghost_table.clone();
        let columns = self.read_table_columns(&ghost_table).await?;
        if columns.is_empty() {
            return Err(MoltError::new(ErrorKind::TableNotFound {
                database: self.context.database.clone(),
                table: ghost_table,
            }));
        }
        Ok(columns)
    }

    async fn read_table_columns(&self, table: &str) -> MoltResult<ColumnList> {
        let rows = sqlx::query(
            "select column_name, data_type, column_type, is_nullable \
             from information_schema.columns \
             where table_schema = ? and table_name = ? \
             order by ordinal_position",
        )
        .bind(&self.context.database)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.try_get(0)?;
                let data_type: String = row.try_get(1)?;
                let column_type: String = row.try_get(2)?;
                let is_nullable: String = row.try_get(3)?;
                Ok(Column::new(
                    name,
                    ColumnKind::from_data_type(&data_type, &column_type),
                    is_nullable.eq_ignore_ascii_case("YES"),
                ))
            })
            .collect::<MoltResult<Vec<_>>>()?;

        Ok(ColumnList::new(columns))
    }

    async fn read_unique_keys(
        &self,
        table: &str,
        columns: &ColumnList,
    ) -> MoltResult<Vec<UniqueKey>> {
        let rows = sqlx::query(
            "select index_name, column_name \
             from information_schema.statistics \
             where table_schema = ? and table_name = ? and non_unique = 0 \
             order by index_name = 'PRIMARY' desc, index_name, seq_in_index",
        )
        .bind(&self.context.database)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut order: Vec<String> = Vec::new();
        let mut grouped: HashMap<String, Vec<Column>> = HashMap::new();

        for row in &rows {
            let index_name: String = row.try_get(0)?;
            let column_name: String = row.try_get(1)?;
            let column = columns.get(&column_name).cloned().unwrap_or_else(|| {
                Column::new(column_name.clone(), ColumnKind::Other, true)
            });
            if !grouped.contains_key(&index_name) {
                order.push(index_name.clone());
            }
            grouped.entry(index_name).or_default().push(column);
        }

        Ok(order
            .into_iter()
            .map(|name| {
                let key_columns = grouped.remove(&name).unwrap_or_default();
                UniqueKey::new(name, ColumnList::new(key_columns))
            })
            .collect())
    }

    async fn count_foreign_keys(&self, table: &str) -> MoltResult<u64> {
        let row = sqlx::query(
            "select count(*) from information_schema.key_column_usage \
             where referenced_table_name is not null and \
             ((table_schema = ? and table_name = ?) \
              or (referenced_table_schema = ? and referenced_table_name = ?))",
        )
        .bind(&self.context.database)
        .bind(table)
        .bind(&self.context.database)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.try_get(0)?;
        Ok(count.max(0) as u64)
    }

    /// information_schema approximation of the table's row count.
    pub async fn estimate_row_count(&self) -> MoltResult<u64> {
        let row = sqlx::query(
            "select table_rows from information_schema.tables \
             where table_schema = ? and table_name = ?",
        )
        .bind(&self.context.database)
        .bind(&self.context.original_table)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(MoltError::new(ErrorKind::TableNotFound {
                database: self.context.database.clone(),
                table: self.context.original_table.clone(),
            }));
        };
        let estimate: Option<u64> = row.try_get(0)?;
        Ok(estimate.unwrap_or(0))
    }

    /// Kicks off an exact `SELECT COUNT(*)` concurrently with the row copy;
    /// its result supersedes the estimate once it lands.
    pub fn spawn_exact_row_count(&self) {
        let pool = self.pool.clone();
        let context = self.context.clone();
        let query = format!(
            "select /* molt */ count(*) from {}",
            crate::sql::builder::quote_table(&context.database, &context.original_table),
        );

        context.set_exact_count_pending(true);
        tokio::spawn(async move {
            match sqlx::query(&query).fetch_one(&pool).await {
                Ok(row) => match row.try_get::<i64, _>(0) {
                    Ok(count) => {
                        info!(count, "exact row count supersedes estimate");
                        context.set_rows_estimate(count.max(0) as u64);
                    }
                    Err(err) => warn!(error = %err, "exact row count decode failed"),
                },
                Err(err) => warn!(error = %err, "exact row count query failed"),
            }
            context.set_exact_count_pending(false);
        });
    }

    /// Picks the row-copy iteration axis: the primary key when usable,
    /// otherwise the first unique key shared with the ghost table.
    pub fn choose_unique_key(
        &self,
        candidate_keys: &[UniqueKey],
        ghost_columns: &ColumnList,
        renames: &HashMap<String, String>,
    ) -> MoltResult<UniqueKey> {
        choose_shared_unique_key(
            candidate_keys,
            ghost_columns,
            renames,
            self.context.config.migration.allow_nullable_unique_key,
        )
        .ok_or_else(|| {
            MoltError::new(ErrorKind::NoUsableUniqueKey {
                table: self.context.original_table.clone(),
            })
        })
    }

    /// Heartbeat-measured replication lag of the inspected server.
    pub async fn replication_lag(&self) -> MoltResult<Option<Duration>> {
        heartbeat_lag(
            &self.pool,
            &self.context.database,
            &self.context.changelog_table,
        )
        .await
    }

    /// Runs the configured throttle query; a positive scalar result means
    /// throttle.
    pub async fn execute_throttle_query(&self, query: &str) -> MoltResult<i64> {
        let row = sqlx::query(query).fetch_one(&self.pool).await?;
        let value: i64 = row.try_get(0).map_err(|err| {
            molt_error!(
                ErrorKind::ConfigurationError {
                    parameter: "throttle.throttle_query".to_string(),
                    reason: "query must return an integer scalar".to_string(),
                },
                "throttle query result not an integer",
                err
            )
        })?;
        Ok(value)
    }
}

/// Core of the unique-key choice, shared with tests: candidates are tried
/// in order (the caller lists the primary key first); a key qualifies when
/// every column exists on the ghost (modulo renames) and its nullability
/// policy passes.
pub fn choose_shared_unique_key(
    candidate_keys: &[UniqueKey],
    ghost_columns: &ColumnList,
    renames: &HashMap<String, String>,
    allow_nullable: bool,
) -> Option<UniqueKey> {
    for key in candidate_keys {
        let shared_with_ghost = key.columns.names().iter().all(|name| {
            let ghost_name = renames.get(*name).map(String::as_str).unwrap_or(name);
            ghost_columns.contains(ghost_name)
        });
        if !shared_with_ghost {
            continue;
        }
        if key.has_nullable() && !allow_nullable {
            warn!(key = %key, "skipping nullable unique key");
            continue;
        }
        return Some(key.clone());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use molt_mysql::ServerPort;

    const CONFIGURED_PORT: u16 = 3306;

    fn info_with(port: ServerPort, extra_port: ServerPort) -> ServerInfo {
        ServerInfo {
            port,
            extra_port,
            ..Default::default()
        }
    }

    #[test]
    fn matching_port_validates() {
        let info = info_with(ServerPort::new(3306), ServerPort::new(3307));
        assert!(validate_connection(&info, CONFIGURED_PORT, false, "test").is_ok());
    }

    #[test]
    fn null_port_validates_with_cloud_flavour() {
        let info = info_with(ServerPort(None), ServerPort(None));
        assert!(validate_connection(&info, CONFIGURED_PORT, true, "test").is_ok());
    }

    #[test]
    fn extra_port_validates_when_port_is_null() {
        let info = info_with(ServerPort(None), ServerPort::new(3306));
        assert!(validate_connection(&info, CONFIGURED_PORT, false, "test").is_ok());
    }

    #[test]
    fn extra_port_validates_when_port_mismatches() {
        let info = info_with(ServerPort::new(12345), ServerPort::new(3306));
        assert!(validate_connection(&info, CONFIGURED_PORT, false, "test").is_ok());
    }

    #[test]
    fn mismatched_port_fails() {
        let info = info_with(ServerPort::new(9999), ServerPort(None));
        assert!(validate_connection(&info, CONFIGURED_PORT, false, "test").is_err());
    }

    #[test]
    fn null_ports_fail_without_cloud_flavour() {
        let info = info_with(ServerPort(None), ServerPort(None));
        assert!(validate_connection(&info, CONFIGURED_PORT, false, "test").is_err());
    }

    #[test]
    fn primary_key_is_preferred() {
        let primary = UniqueKey::new("PRIMARY", ColumnList::from_names(["id"]));
        let secondary = UniqueKey::new("email_uidx", ColumnList::from_names(["email"]));
        let ghost = ColumnList::from_names(["id", "email"]);

        let chosen = choose_shared_unique_key(
            &[primary.clone(), secondary],
            &ghost,
            &HashMap::new(),
            false,
        )
        .unwrap();
        assert_eq!(chosen, primary);
    }

    #[test]
    fn key_missing_on_ghost_is_skipped() {
        let primary = UniqueKey::new("PRIMARY", ColumnList::from_names(["dropped_col"]));
        let secondary = UniqueKey::new("email_uidx", ColumnList::from_names(["email"]));
        let ghost = ColumnList::from_names(["id", "email"]);

        let chosen =
            choose_shared_unique_key(&[primary, secondary.clone()], &ghost, &HashMap::new(), false)
                .unwrap();
        assert_eq!(chosen, secondary);
    }

    #[test]
    fn nullable_key_needs_explicit_approval() {
        let nullable = UniqueKey::new(
            "maybe_uidx",
            ColumnList::new(vec![Column::new("maybe", ColumnKind::Text, true)]),
        );
        let ghost = ColumnList::new(vec![Column::new("maybe", ColumnKind::Text, true)]);

        assert!(
            choose_shared_unique_key(&[nullable.clone()], &ghost, &HashMap::new(), false).is_none()
        );
        assert!(
            choose_shared_unique_key(&[nullable], &ghost, &HashMap::new(), true).is_some()
        );
    }

    #[test]
    fn renamed_key_column_still_qualifies() {
        let key = UniqueKey::new("PRIMARY", ColumnList::from_names(["uuid"]));
        let ghost = ColumnList::from_names(["guid"]);
        let mut renames = HashMap::new();
        renames.insert("uuid".to_string(), "guid".to_string());

        assert!(choose_shared_unique_key(&[key], &ghost, &renames, false).is_some());
    }
}
