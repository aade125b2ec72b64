use std::collections::VecDeque;

use async_trait::async_trait;
use molt_mysql::BinlogCoordinates;

use crate::binlog::entry::DmlKind;
use crate::binlog::reader::{BinlogReader, RowImage, RowsEvent};
use crate::error::{MoltError, MoltResult};
use crate::sql::ColumnValue;

/// A finite, pre-scripted binlog. Each scripted element is either an event
/// or an error to surface, letting tests exercise the streamer's reconnect
/// path.
pub struct ScriptedBinlogReader {
    script: VecDeque<MoltResult<RowsEvent>>,
    coordinates: BinlogCoordinates,
    pub connect_count: usize,
}

impl ScriptedBinlogReader {
    pub fn new(script: Vec<MoltResult<RowsEvent>>) -> Self {
        ScriptedBinlogReader {
            script: script.into_iter().collect(),
            coordinates: BinlogCoordinates::empty(),
            connect_count: 0,
        }
    }
}

#[async_trait]
impl BinlogReader for ScriptedBinlogReader {
    async fn connect(&mut self, coordinates: &BinlogCoordinates) -> MoltResult<()> {
        self.coordinates = coordinates.clone();
        self.connect_count += 1;
        Ok(())
    }

    async fn next_event(&mut self) -> MoltResult<Option<RowsEvent>> {
        match self.script.pop_front() {
            Some(Ok(event)) => {
                self.coordinates = event.coordinates.clone();
                Ok(Some(event))
            }
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    fn current_coordinates(&self) -> BinlogCoordinates {
        self.coordinates.clone()
    }
}

/// A live reader fed through a channel, for tests that interleave workload
/// and streaming.
pub struct ChannelBinlogReader {
    rx: tokio::sync::mpsc::UnboundedReceiver<RowsEvent>,
    coordinates: BinlogCoordinates,
}

impl ChannelBinlogReader {
    pub fn new() -> (tokio::sync::mpsc::UnboundedSender<RowsEvent>, Self) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            tx,
            ChannelBinlogReader {
                rx,
                coordinates: BinlogCoordinates::empty(),
            },
        )
    }
}

#[async_trait]
impl BinlogReader for ChannelBinlogReader {
    async fn connect(&mut self, coordinates: &BinlogCoordinates) -> MoltResult<()> {
        self.coordinates = coordinates.clone();
        Ok(())
    }

    async fn next_event(&mut self) -> MoltResult<Option<RowsEvent>> {
        match self.rx.recv().await {
            Some(event) => {
                self.coordinates = event.coordinates.clone();
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    fn current_coordinates(&self) -> BinlogCoordinates {
        self.coordinates.clone()
    }
}

/// Builds a single-row rows event at the given file position.
pub fn rows_event(
    database: &str,
    table: &str,
    kind: DmlKind,
    where_values: Option<Vec<ColumnValue>>,
    new_values: Option<Vec<ColumnValue>>,
    log_pos: u64,
) -> RowsEvent {
    RowsEvent {
        database: database.to_string(),
        table: table.to_string(),
        kind,
        rows: vec![RowImage {
            where_values,
            new_values,
        }],
        coordinates: BinlogCoordinates::file("mysql-bin.000001", log_pos),
        end_log_pos: log_pos + 1,
    }
}

/// A transient error for scripting reconnects.
pub fn transient_error() -> MoltError {
    MoltError::new(crate::error::ErrorKind::ConnectionLost)
}
