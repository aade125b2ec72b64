use sqlx::Row;
use sqlx::mysql::MySqlPool;
use thiserror::Error;

use crate::coordinates::BinlogCoordinates;

#[derive(Debug, Error)]
pub enum BinlogStatusError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("server has no binary log position (log_bin disabled?)")]
    NoPosition,
}

/// Reads the server's current binlog write position.
///
/// `SHOW MASTER STATUS` was renamed to `SHOW BINARY LOG STATUS` in 8.4;
/// the legacy spelling is tried second so both families work.
pub async fn current_binlog_coordinates(
    pool: &MySqlPool,
) -> Result<BinlogCoordinates, BinlogStatusError> {
    let row = match sqlx::query("SHOW BINARY LOG STATUS").fetch_optional(pool).await {
        Ok(row) => row,
        Err(_) => sqlx::query("SHOW MASTER STATUS").fetch_optional(pool).await?,
    };

    let row = row.ok_or(BinlogStatusError::NoPosition)?;
    let log_file: String = row.try_get(0)?;
    let log_pos: u64 = row.try_get(1)?;

    Ok(BinlogCoordinates::file(log_file, log_pos))
}

/// Parses the numeric suffix out of a binlog file name
/// ("mysql-bin.000123" -> 123).
pub fn parse_binlog_file_number(file_name: &str) -> Option<u32> {
    file_name.rsplit_once('.').and_then(|(prefix, suffix)| {
        if prefix.is_empty() {
            None
        } else {
            suffix.parse().ok()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binlog_file_numbers() {
        assert_eq!(parse_binlog_file_number("mysql-bin.000123"), Some(123));
        assert_eq!(parse_binlog_file_number("binlog.000456"), Some(456));
        assert_eq!(parse_binlog_file_number("log.001"), Some(1));
    }

    #[test]
    fn rejects_invalid_file_names() {
        assert_eq!(parse_binlog_file_number("invalid"), None);
        assert_eq!(parse_binlog_file_number(""), None);
        assert_eq!(parse_binlog_file_number("file.abc"), None);
        assert_eq!(parse_binlog_file_number(".000123"), None);
    }
}
