use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use molt_mysql::BinlogCoordinates;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::binlog::entry::{BinlogEntry, DmlEvent, DmlKind};
use crate::binlog::reader::{BinlogReader, RowsEvent};
use crate::concurrency::ShutdownRx;
use crate::context::MigrationContext;
use crate::error::{ErrorKind, MoltError, MoltResult};
use crate::metrics::MOLT_BINLOG_EVENTS_READ_TOTAL;
use crate::molt_error;

/// Changelog hint column value for heartbeat rows.
pub const HINT_HEARTBEAT: &str = "heartbeat";
/// Changelog hint column value for state rows.
pub const HINT_STATE: &str = "state";

/// Index of the `hint` column in the changelog table.
const CHANGELOG_HINT_INDEX: usize = 2;
/// Index of the `value` column in the changelog table.
const CHANGELOG_VALUE_INDEX: usize = 3;

const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(16);

/// One element of the ordered stream the event-apply pipeline consumes.
///
/// Changelog state rows travel through the same channel as DML so that a
/// state write is observed only after every preceding modification has been
/// applied, which the cut-over rendezvous depends on.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Dml(BinlogEntry),
    ChangelogState {
        value: String,
        coordinates: BinlogCoordinates,
    },
}

/// Tails the binary log and feeds the ordered event channel.
///
/// Consumes a [`BinlogReader`], filters events down to the migrated table
/// and the changelog table, and reconnects with jittered exponential backoff
/// from the last acknowledged coordinates. Entries may replay across a
/// reconnect; the applier's rewrite rules are idempotent under that.
pub struct BinlogStreamer<R> {
    context: Arc<MigrationContext>,
    reader: R,
    events_tx: mpsc::Sender<StreamEvent>,
    shutdown_rx: ShutdownRx,
}

impl<R: BinlogReader> BinlogStreamer<R> {
    pub fn new(
        context: Arc<MigrationContext>,
        reader: R,
        events_tx: mpsc::Sender<StreamEvent>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        BinlogStreamer {
            context,
            reader,
            events_tx,
            shutdown_rx,
        }
    }

    /// Connects at the given coordinates and streams until shutdown, end of
    /// stream, or a fatal error.
    pub async fn run(mut self, start: BinlogCoordinates) -> MoltResult<()> {
        info!(coordinates = %start, "binlog streamer connecting");
        self.reader.connect(&start).await?;
        self.context.set_recent_binlog_coordinates(start.clone());

        let mut backoff = INITIAL_RECONNECT_BACKOFF;
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.shutdown_rx.is_shutdown() {
                info!("binlog streamer shutting down");
                return Ok(());
            }

            let mut shutdown_rx = self.shutdown_rx.clone();
            let event = tokio::select! {
                event = self.reader.next_event() => event,
                _ = shutdown_rx.wait_for_shutdown() => {
                    info!("binlog streamer shutting down");
                    return Ok(());
                }
            };

            match event {
                Ok(Some(rows_event)) => {
                    consecutive_failures = 0;
                    backoff = INITIAL_RECONNECT_BACKOFF;
                    self.handle_rows_event(rows_event).await?;
                }
                Ok(None) => {
                    debug!("binlog stream ended");
                    return Ok(());
                }
                Err(err) if err.is_retryable() => {
                    consecutive_failures += 1;
                    if consecutive_failures > self.context.config.migration.default_retries {
                        return Err(MoltError::retries_exceeded(
                            "binlog reconnect",
                            consecutive_failures,
                        ));
                    }

                    let resume_at = self.reader.current_coordinates();
                    warn!(
                        error = %err,
                        coordinates = %resume_at,
                        attempt = consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "binlog stream error, reconnecting"
                    );
                    tokio::time::sleep(jitter(backoff)).await;
                    backoff = (backoff * 2).min(MAX_RECONNECT_BACKOFF);

                    if let Err(err) = self.reader.connect(&resume_at).await {
                        warn!(error = %err, "binlog reconnect failed");
                    }
                }
                Err(err) => {
                    if let Some(purged) = classify_purged_position(&start, &err.to_string()) {
                        return Err(purged);
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn handle_rows_event(&mut self, event: RowsEvent) -> MoltResult<()> {
        if event.database != self.context.database {
            return Ok(());
        }

        if event.table == self.context.original_table {
            self.emit_dml_entries(event).await
        } else if event.table == self.context.changelog_table {
            self.handle_changelog_event(event).await
        } else {
            Ok(())
        }
    }

    async fn emit_dml_entries(&mut self, event: RowsEvent) -> MoltResult<()> {
        let row_count = event.rows.len() as u64;
        for row in event.rows {
            let entry = BinlogEntry::new(
                event.coordinates.clone(),
                event.end_log_pos,
                DmlEvent {
                    database: event.database.clone(),
                    table: event.table.clone(),
                    kind: event.kind,
                    where_values: row.where_values,
                    new_values: row.new_values,
                },
            );

            self.events_tx
                .send(StreamEvent::Dml(entry))
                .await
                .map_err(|_| MoltError::channel_closed("binlog events"))?;
        }

        self.context.add_binlog_events_read(row_count);
        counter!(MOLT_BINLOG_EVENTS_READ_TOTAL).increment(row_count);
        self.context
            .set_recent_binlog_coordinates(event.coordinates);

        Ok(())
    }

    async fn handle_changelog_event(&mut self, event: RowsEvent) -> MoltResult<()> {
        // Deletes on the changelog table carry no signal.
        if event.kind == DmlKind::Delete {
            return Ok(());
        }

        for row in &event.rows {
            let Some(values) = &row.new_values else {
                continue;
            };
            let hint = changelog_text(values, CHANGELOG_HINT_INDEX);
            let value = changelog_text(values, CHANGELOG_VALUE_INDEX);

            match hint.as_deref() {
                Some(HINT_HEARTBEAT) => {
                    if let Some(value) = value {
                        self.observe_heartbeat(&value);
                    }
                }
                Some(HINT_STATE) => {
                    if let Some(value) = value {
                        debug!(state = %value, "changelog state event");
                        self.events_tx
                            .send(StreamEvent::ChangelogState {
                                value,
                                coordinates: event.coordinates.clone(),
                            })
                            .await
                            .map_err(|_| MoltError::channel_closed("binlog events"))?;
                    }
                }
                _ => {}
            }
        }

        self.context
            .set_recent_binlog_coordinates(event.coordinates);
        Ok(())
    }

    /// Heartbeat rows carry the coordinator's write timestamp; the distance
    /// to now, measured at read time, is the replication lag of the
    /// inspected server.
    fn observe_heartbeat(&self, value: &str) {
        match DateTime::parse_from_rfc3339(value) {
            Ok(written_at) => {
                self.context
                    .set_last_heartbeat(written_at.with_timezone(&Utc));
            }
            Err(err) => {
                warn!(value, error = %err, "unparseable heartbeat value");
            }
        }
    }
}

fn changelog_text(values: &[crate::sql::ColumnValue], index: usize) -> Option<String> {
    match values.get(index) {
        Some(crate::sql::ColumnValue::Text(text)) => Some(text.clone()),
        Some(crate::sql::ColumnValue::Bytes(bytes)) => {
            String::from_utf8(bytes.clone()).ok()
        }
        _ => None,
    }
}

/// Validates that a fatal streamer error carries purge information when the
/// server discarded our starting position.
pub fn classify_purged_position(start: &BinlogCoordinates, message: &str) -> Option<MoltError> {
    if message.contains("Could not find first log file name") || message.contains("1236") {
        return Some(molt_error!(
            ErrorKind::BinlogPositionPurged {
                coordinates: start.to_string(),
            },
            "server purged the requested binlog"
        ));
    }
    None
}

fn jitter(base: Duration) -> Duration {
    let mut rng = rand::rng();
    let factor = rng.random_range(0.8..1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::ColumnValue;

    #[test]
    fn changelog_text_decodes_text_and_bytes() {
        let values = vec![
            ColumnValue::Int(1),
            ColumnValue::Null,
            ColumnValue::Text("heartbeat".into()),
            ColumnValue::Bytes(b"2024-01-01T00:00:00Z".to_vec()),
        ];
        assert_eq!(
            changelog_text(&values, CHANGELOG_HINT_INDEX).as_deref(),
            Some("heartbeat")
        );
        assert_eq!(
            changelog_text(&values, CHANGELOG_VALUE_INDEX).as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(changelog_text(&values, 1), None);
    }

    #[test]
    fn purged_position_is_classified() {
        let start = BinlogCoordinates::file("mysql-bin.000001", 4);
        assert!(
            classify_purged_position(&start, "ERROR 1236: Could not find first log file name")
                .is_some()
        );
        assert!(classify_purged_position(&start, "connection reset").is_none());
    }
}
