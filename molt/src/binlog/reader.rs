use async_trait::async_trait;
use molt_mysql::BinlogCoordinates;

use crate::binlog::entry::DmlKind;
use crate::error::MoltResult;
use crate::sql::ColumnValue;

/// One row within a rows event.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage {
    /// Pre-image, present for update and delete.
    pub where_values: Option<Vec<ColumnValue>>,
    /// Post-image, present for insert and update.
    pub new_values: Option<Vec<ColumnValue>>,
}

/// A decoded WRITE_ROWS/UPDATE_ROWS/DELETE_ROWS event.
#[derive(Debug, Clone, PartialEq)]
pub struct RowsEvent {
    pub database: String,
    pub table: String,
    pub kind: DmlKind,
    pub rows: Vec<RowImage>,
    pub coordinates: BinlogCoordinates,
    pub end_log_pos: u64,
}

/// The engine's seam to the replication wire protocol.
///
/// Implementations register as a replica and decode ROTATE, TABLE_MAP and
/// rows events into [`RowsEvent`] values; the engine requires row-based
/// logging with full row images on the consumed server. The streamer worker
/// handles filtering, ordering and reconnection on top of this trait.
#[async_trait]
pub trait BinlogReader: Send {
    /// Connects (or reconnects) the reader at the given coordinates.
    async fn connect(&mut self, coordinates: &BinlogCoordinates) -> MoltResult<()>;

    /// Reads the next rows event, blocking until one is available.
    ///
    /// `Ok(None)` marks the end of the stream for finite readers; a live
    /// server reader never returns it.
    async fn next_event(&mut self) -> MoltResult<Option<RowsEvent>>;

    /// Last coordinates successfully read; reconnection resumes here.
    fn current_coordinates(&self) -> BinlogCoordinates;
}
