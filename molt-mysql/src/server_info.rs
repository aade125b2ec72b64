use std::fmt;

use serde::Serialize;
use sqlx::Row;
use sqlx::mysql::MySqlPool;

/// A server port that may be NULL.
///
/// Some managed MySQL flavours report a NULL `@@global.port`; equality and
/// validation must treat "absent" and "present" explicitly rather than
/// relying on a wrapped default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServerPort(pub Option<u16>);

impl ServerPort {
    pub fn new(port: i64) -> Self {
        if (1..=65535).contains(&port) {
            ServerPort(Some(port as u16))
        } else {
            ServerPort(None)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.0.is_some()
    }

    pub fn matches(&self, port: u16) -> bool {
        self.0 == Some(port)
    }
}

/// Snapshot of a MySQL server's online identity and replication-relevant
/// configuration.
///
/// Taken once at initialization and re-read by the watchdog; any field
/// diverging mid-migration means the server behind the address changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub version: String,
    pub version_comment: String,
    pub hostname: String,
    pub port: ServerPort,
    pub binlog_format: String,
    pub binlog_row_image: String,
    pub log_bin: bool,
    pub log_slave_updates: bool,
    pub sql_mode: String,
    pub time_zone: String,
    /// Percona/MariaDB only; NULL elsewhere.
    pub extra_port: ServerPort,
}

impl ServerInfo {
    /// Reads the server's online configuration.
    pub async fn load(pool: &MySqlPool) -> Result<ServerInfo, sqlx::Error> {
        let row = sqlx::query(
            "select @@global.version, @@global.version_comment, @@global.hostname, \
             @@global.port, @@global.binlog_format, @@global.binlog_row_image, \
             @@global.log_bin, @@global.log_slave_updates, @@global.sql_mode, \
             @@global.time_zone",
        )
        .fetch_one(pool)
        .await?;

        let mut info = ServerInfo {
            version: row.try_get(0)?,
            version_comment: row.try_get(1)?,
            hostname: row.try_get(2)?,
            port: row
                .try_get::<Option<i64>, _>(3)?
                .map(ServerPort::new)
                .unwrap_or_default(),
            binlog_format: row.try_get(4)?,
            binlog_row_image: row.try_get(5)?,
            log_bin: row.try_get::<i64, _>(6)? != 0,
            log_slave_updates: row.try_get::<i64, _>(7)? != 0,
            sql_mode: row.try_get(8)?,
            time_zone: row.try_get(9)?,
            extra_port: ServerPort::default(),
        };

        // Not all servers support extra_port; swallow the error.
        if let Ok(row) = sqlx::query("select @@global.extra_port")
            .fetch_one(pool)
            .await
        {
            info.extra_port = row
                .try_get::<Option<i64>, _>(0)
                .ok()
                .flatten()
                .map(ServerPort::new)
                .unwrap_or_default();
        }

        Ok(info)
    }

    /// Field-wise equality against another snapshot.
    pub fn equals(&self, other: &ServerInfo) -> bool {
        self == other
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(err) => write!(f, "{err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_port_rejects_out_of_range() {
        assert!(!ServerPort::new(0).is_valid());
        assert!(!ServerPort::new(-1).is_valid());
        assert!(!ServerPort::new(70000).is_valid());
        assert!(ServerPort::new(3306).matches(3306));
    }

    #[test]
    fn server_info_equality_is_field_wise() {
        let a = ServerInfo {
            version: "8.0.35".into(),
            port: ServerPort::new(3306),
            ..Default::default()
        };
        let mut b = a.clone();
        assert!(a.equals(&b));

        b.port = ServerPort(None);
        assert!(!a.equals(&b));

        b.port = ServerPort::new(3306);
        b.binlog_format = "STATEMENT".into();
        assert!(!a.equals(&b));
    }

    #[test]
    fn display_renders_json() {
        let info = ServerInfo {
            version: "8.0.35".into(),
            ..Default::default()
        };
        assert!(info.to_string().contains("\"version\":\"8.0.35\""));
    }
}
