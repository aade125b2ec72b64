use std::time::Duration;

use async_trait::async_trait;

use crate::binlog::BinlogEntry;
use crate::error::MoltResult;
use crate::sql::ColumnValue;
use crate::sql::value::{compare_key_tuples, display_key_tuple};

/// Outcome of one applied unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub rows_affected: u64,
    pub duration: Duration,
}

/// The unique-key tuples bounding the whole row-copy.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationRange {
    pub min_values: Vec<ColumnValue>,
    pub max_values: Vec<ColumnValue>,
}

/// One chunk's bounds. `include_from` is true only for the first chunk,
/// which starts at the range minimum itself; every later chunk starts just
/// past its predecessor's `to_values`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkBoundary {
    pub from_values: Vec<ColumnValue>,
    pub to_values: Vec<ColumnValue>,
    pub include_from: bool,
}

impl ChunkBoundary {
    /// True when the boundary is well formed: from precedes (or, for a
    /// single-row chunk, equals) to.
    pub fn is_ordered(&self) -> bool {
        compare_key_tuples(&self.from_values, &self.to_values) != std::cmp::Ordering::Greater
    }
}

impl std::fmt::Display for ChunkBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}..{}",
            if self.include_from { "=" } else { "" },
            display_key_tuple(&self.from_values),
            display_key_tuple(&self.to_values),
        )
    }
}

/// Write surface for the row-copy pipeline.
///
/// The production implementation runs chunk transactions against the ghost
/// table; the in-memory implementation backs the convergence tests. Both
/// must make `copy_chunk` an insert-ignore: rows already written by DML
/// replay win over the copied image.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// The unique-key extremes of the original table, or `None` when it is
    /// empty.
    async fn migration_range(&self) -> MoltResult<Option<MigrationRange>>;

    /// The unique-key tuple of the chunk-size-th row past `from_values`, or
    /// `None` when fewer rows remain.
    async fn next_chunk_boundary(
        &self,
        from_values: &[ColumnValue],
        include_from: bool,
        chunk_size: i64,
    ) -> MoltResult<Option<Vec<ColumnValue>>>;

    /// Copies one chunk from the original table to the ghost in a single
    /// transaction.
    async fn copy_chunk(&self, boundary: &ChunkBoundary) -> MoltResult<ApplyStats>;
}

/// Write surface for the DML replay pipeline.
///
/// A batch is one transaction; entries are applied in slice order and the
/// rewrite rules (replace / update-by-key / delete-by-key) make replay of
/// the same entry idempotent.
#[async_trait]
pub trait DmlSink: Send + Sync {
    async fn apply_dml_batch(&self, entries: &[BinlogEntry]) -> MoltResult<ApplyStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_ordering_check() {
        let ordered = ChunkBoundary {
            from_values: vec![ColumnValue::Int(1)],
            to_values: vec![ColumnValue::Int(10)],
            include_from: true,
        };
        assert!(ordered.is_ordered());

        let single_row = ChunkBoundary {
            from_values: vec![ColumnValue::Int(5)],
            to_values: vec![ColumnValue::Int(5)],
            include_from: true,
        };
        assert!(single_row.is_ordered());

        let inverted = ChunkBoundary {
            from_values: vec![ColumnValue::Int(10)],
            to_values: vec![ColumnValue::Int(1)],
            include_from: false,
        };
        assert!(!inverted.is_ordered());
    }
}
