use std::borrow::Cow;
use std::{error, fmt, result};

/// Type alias for convenience when using the Result type with our Error.
pub type MoltResult<T> = result::Result<T, MoltError>;

/// Internal error representation with kind, optional context and optional
/// source error.
///
/// Boxed to keep the public error type one word wide on the success path.
struct ErrorInner {
    kind: ErrorKind,
    description: Option<Cow<'static, str>>,
    detail: Option<String>,
    source: Option<Box<dyn error::Error + Send + Sync>>,
}

/// Error classification for the migration engine.
///
/// Kinds map onto the recovery taxonomy: pre-flight validation failures,
/// transient infrastructure errors, runtime divergence, cut-over timeouts,
/// user-commanded aborts and load-based aborts each behave differently.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bad or inconsistent configuration detected before any work started.
    ConfigurationError { parameter: String, reason: String },
    /// The migrated table does not exist on the inspected server.
    TableNotFound { database: String, table: String },
    /// No unique key usable as the row-copy iteration axis.
    NoUsableUniqueKey { table: String },
    /// The table participates in foreign key constraints.
    ForeignKeysFound { table: String, count: u64 },
    /// The ALTER renames columns but renames were not approved.
    RenamedColumnsNotApproved { renames: String },
    /// The server's reported port does not match the configured port.
    ConnectionValidationFailed { role: String, reason: String },

    /// Database connection could not be established.
    ConnectionFailed { host: String, port: u16 },
    /// Connection lost during ongoing operations.
    ConnectionLost,
    /// SQL statement execution failure.
    QueryExecutionFailed { query: String },
    /// Transaction begin/commit/rollback failure.
    TransactionFailed,
    /// An operation exceeded its deadline.
    Timeout { operation: String, duration_ms: u64 },
    /// A bounded retry budget was exhausted.
    RetriesExceeded { operation: String, attempts: u32 },

    /// Binlog stream read or decode failure.
    BinlogStreamFailed,
    /// The server purged the log past our starting coordinates.
    BinlogPositionPurged { coordinates: String },
    /// An inter-task channel closed unexpectedly.
    ChannelClosed { channel: String },

    /// A watched server changed identity mid-migration.
    UnexpectedServerChange { role: String, change: String },
    /// DNS resolution failed persistently for a watched server.
    DnsFailuresExceeded { role: String, failures: i64 },

    /// Table lock was not acquired within the cut-over lock budget.
    CutOverLockTimeout { timeout_secs: u64 },
    /// All cut-over attempts failed.
    CutOverRetriesExceeded { attempts: u32 },
    /// The final rename did not take effect.
    RenameFailed,

    /// Operator issued the interactive `panic` command.
    UserPanic,
    /// A critical-load threshold was confirmed exceeded.
    CriticalLoadExceeded {
        metric: String,
        value: i64,
        threshold: i64,
    },

    /// A worker task panicked.
    WorkerPanicked { worker: String },
    /// I/O failure outside the database driver.
    IoError,
    /// Error that doesn't fit other categories.
    Other { description: String },
}

/// Recovery strategy hint for automated error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Permanent failure; do not retry.
    NoRetry,
    /// Retry with exponential backoff up to the configured budget.
    RetryWithBackoff,
    /// Retry the surrounding unit of work (e.g. a whole cut-over attempt).
    RetryUnit,
    /// Abort the migration immediately.
    Abort,
}

/// A stable error type for the migration engine.
pub struct MoltError(Box<ErrorInner>);

impl MoltError {
    pub fn new(kind: ErrorKind) -> Self {
        MoltError(Box::new(ErrorInner {
            kind,
            description: None,
            detail: None,
            source: None,
        }))
    }

    pub fn with_source<E>(kind: ErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        MoltError(Box::new(ErrorInner {
            kind,
            description: None,
            detail: None,
            source: Some(source.into()),
        }))
    }

    pub fn other(description: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other {
            description: description.into(),
        })
    }

    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::new(ErrorKind::ChannelClosed {
            channel: channel.into(),
        })
    }

    pub fn timeout(operation: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(ErrorKind::Timeout {
            operation: operation.into(),
            duration_ms,
        })
    }

    pub fn retries_exceeded(operation: impl Into<String>, attempts: u32) -> Self {
        Self::new(ErrorKind::RetriesExceeded {
            operation: operation.into(),
            attempts,
        })
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Returns the recommended recovery strategy for this error.
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        use ErrorKind::*;
        match &self.0.kind {
            ConfigurationError { .. }
            | TableNotFound { .. }
            | NoUsableUniqueKey { .. }
            | ForeignKeysFound { .. }
            | RenamedColumnsNotApproved { .. }
            | ConnectionValidationFailed { .. } => RecoveryStrategy::NoRetry,

            ConnectionFailed { .. }
            | ConnectionLost
            | QueryExecutionFailed { .. }
            | TransactionFailed
            | BinlogStreamFailed
            | IoError => RecoveryStrategy::RetryWithBackoff,

            Timeout { .. } | CutOverLockTimeout { .. } | RenameFailed => {
                RecoveryStrategy::RetryUnit
            }

            RetriesExceeded { .. }
            | BinlogPositionPurged { .. }
            | ChannelClosed { .. }
            | UnexpectedServerChange { .. }
            | DnsFailuresExceeded { .. }
            | CutOverRetriesExceeded { .. }
            | UserPanic
            | CriticalLoadExceeded { .. }
            | WorkerPanicked { .. } => RecoveryStrategy::Abort,

            Other { .. } => RecoveryStrategy::Abort,
        }
    }

    /// Returns true if this error is likely transient and retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.recovery_strategy(),
            RecoveryStrategy::RetryWithBackoff | RecoveryStrategy::RetryUnit
        )
    }

    /// True for the user-commanded panic, which skips table cleanup.
    pub fn is_user_panic(&self) -> bool {
        matches!(self.0.kind, ErrorKind::UserPanic)
    }
}

impl fmt::Debug for MoltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoltError")
            .field("kind", &self.0.kind)
            .field("description", &self.0.description)
            .field("detail", &self.0.detail)
            .field("source", &self.0.source)
            .finish()
    }
}

impl fmt::Display for MoltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ErrorKind::*;

        match &self.0.kind {
            ConfigurationError { parameter, reason } => {
                write!(f, "configuration error for `{parameter}`: {reason}")
            }
            TableNotFound { database, table } => {
                write!(f, "table `{database}`.`{table}` not found")
            }
            NoUsableUniqueKey { table } => {
                write!(f, "no usable unique key on `{table}`")
            }
            ForeignKeysFound { table, count } => {
                write!(f, "table `{table}` participates in {count} foreign key(s)")
            }
            RenamedColumnsNotApproved { renames } => {
                write!(
                    f,
                    "alter renames columns ({renames}) but renames were not approved"
                )
            }
            ConnectionValidationFailed { role, reason } => {
                write!(f, "{role} connection validation failed: {reason}")
            }

            ConnectionFailed { host, port } => {
                write!(f, "failed to connect to {host}:{port}")
            }
            ConnectionLost => write!(f, "database connection lost"),
            QueryExecutionFailed { query } => {
                write!(f, "query execution failed: {query}")
            }
            TransactionFailed => write!(f, "database transaction failed"),
            Timeout {
                operation,
                duration_ms,
            } => {
                write!(f, "operation `{operation}` timed out after {duration_ms}ms")
            }
            RetriesExceeded {
                operation,
                attempts,
            } => {
                write!(f, "`{operation}` failed after {attempts} attempts")
            }

            BinlogStreamFailed => write!(f, "binlog stream failed"),
            BinlogPositionPurged { coordinates } => {
                write!(f, "binlog purged past starting coordinates {coordinates}")
            }
            ChannelClosed { channel } => {
                write!(f, "channel `{channel}` closed unexpectedly")
            }

            UnexpectedServerChange { role, change } => {
                write!(f, "{role} server changed identity mid-migration: {change}")
            }
            DnsFailuresExceeded { role, failures } => {
                write!(f, "{role} server DNS resolution failed {failures} times")
            }

            CutOverLockTimeout { timeout_secs } => {
                write!(f, "cut-over lock not acquired within {timeout_secs}s")
            }
            CutOverRetriesExceeded { attempts } => {
                write!(f, "cut-over failed after {attempts} attempts")
            }
            RenameFailed => write!(f, "atomic rename did not take effect"),

            UserPanic => write!(
                f,
                "user commanded panic; aborting without cleanup, please drop the ghost tables before retrying"
            ),
            CriticalLoadExceeded {
                metric,
                value,
                threshold,
            } => {
                write!(
                    f,
                    "critical load exceeded: {metric}={value} over threshold {threshold}"
                )
            }

            WorkerPanicked { worker } => write!(f, "{worker} worker panicked"),
            IoError => write!(f, "i/o operation failed"),
            Other { description } => write!(f, "{description}"),
        }?;

        if let Some(description) = &self.0.description {
            write!(f, ": {description}")?;
        }
        if let Some(detail) = &self.0.detail {
            write!(f, " ({detail})")?;
        }

        Ok(())
    }
}

impl error::Error for MoltError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn error::Error + 'static))
    }
}

impl From<(ErrorKind, &'static str)> for MoltError {
    fn from((kind, description): (ErrorKind, &'static str)) -> Self {
        MoltError(Box::new(ErrorInner {
            kind,
            description: Some(Cow::Borrowed(description)),
            detail: None,
            source: None,
        }))
    }
}

impl From<(ErrorKind, &'static str, String)> for MoltError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> Self {
        MoltError(Box::new(ErrorInner {
            kind,
            description: Some(Cow::Borrowed(description)),
            detail: Some(detail),
            source: None,
        }))
    }
}

impl From<sqlx::Error> for MoltError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Configuration(reason) => Self::with_source(
                ErrorKind::ConfigurationError {
                    parameter: "database".to_string(),
                    reason: reason.to_string(),
                },
                err,
            ),
            sqlx::Error::Database(db_err) => {
                // MySQL vendor codes 1205 (lock wait timeout exceeded) and
                // 1213 (deadlock found) are transient and must reach the
                // retry path. The SQLSTATE is no use here: both map to the
                // generic HY000/40001 classes shared with fatal errors.
                let transient = db_err
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .is_some_and(|mysql_err| matches!(mysql_err.number(), 1205 | 1213));
                if transient {
                    Self::with_source(ErrorKind::TransactionFailed, err)
                } else {
                    Self::with_source(
                        ErrorKind::QueryExecutionFailed {
                            query: db_err.message().to_string(),
                        },
                        err,
                    )
                }
            }
            sqlx::Error::Io(_) => Self::with_source(ErrorKind::ConnectionLost, err),
            sqlx::Error::PoolTimedOut => Self::with_source(
                ErrorKind::Timeout {
                    operation: "acquire connection".to_string(),
                    duration_ms: 0,
                },
                err,
            ),
            sqlx::Error::PoolClosed => Self::with_source(ErrorKind::ConnectionLost, err),
            _ => Self::with_source(
                ErrorKind::Other {
                    description: err.to_string(),
                },
                err,
            ),
        }
    }
}

impl From<std::io::Error> for MoltError {
    fn from(err: std::io::Error) -> Self {
        Self::with_source(ErrorKind::IoError, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = MoltError::new(ErrorKind::NoUsableUniqueKey {
            table: "orders".into(),
        });
        assert_eq!(err.recovery_strategy(), RecoveryStrategy::NoRetry);
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_errors_retry_with_backoff() {
        let err = MoltError::new(ErrorKind::ConnectionLost);
        assert_eq!(err.recovery_strategy(), RecoveryStrategy::RetryWithBackoff);
        assert!(err.is_retryable());
    }

    #[test]
    fn cut_over_lock_timeout_retries_the_attempt() {
        let err = MoltError::new(ErrorKind::CutOverLockTimeout { timeout_secs: 3 });
        assert_eq!(err.recovery_strategy(), RecoveryStrategy::RetryUnit);
    }

    #[test]
    fn user_panic_aborts() {
        let err = MoltError::new(ErrorKind::UserPanic);
        assert_eq!(err.recovery_strategy(), RecoveryStrategy::Abort);
        assert!(err.is_user_panic());
    }

    #[test]
    fn display_appends_description_and_detail() {
        let err = MoltError::from((
            ErrorKind::BinlogStreamFailed,
            "decode error",
            "event at mysql-bin.000001:44".to_string(),
        ));
        let rendered = err.to_string();
        assert!(rendered.contains("binlog stream failed"));
        assert!(rendered.contains("decode error"));
        assert!(rendered.contains("mysql-bin.000001:44"));
    }
}
