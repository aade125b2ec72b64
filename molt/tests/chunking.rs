//! Chunk iteration properties: boundaries advance monotonically with no
//! overlap and no gap, and edge-shaped tables terminate correctly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use molt::concurrency::{create_shutdown_channel, create_throttle_gate};
use molt::error::MoltResult;
use molt::schema::{Column, ColumnKind, ColumnList, ColumnMapping, UniqueKey};
use molt::sink::{ApplyStats, ChunkBoundary, ChunkStore, MigrationRange};
use molt::sql::ColumnValue;
use molt::sql::value::compare_key_tuples;
use molt::test_utils::memory::{MemoryGhost, TableModel};
use molt::test_utils::test_context;
use molt::workers::row_copy::RowCopyWorker;

fn key_columns() -> ColumnList {
    ColumnList::new(vec![
        Column::new("a", ColumnKind::SignedInteger, false),
        Column::new("b", ColumnKind::SignedInteger, false),
        Column::new("payload", ColumnKind::Text, true),
    ])
}

fn composite_key() -> UniqueKey {
    UniqueKey::new(
        "PRIMARY",
        ColumnList::new(vec![
            Column::new("a", ColumnKind::SignedInteger, false),
            Column::new("b", ColumnKind::SignedInteger, false),
        ]),
    )
}

/// Delegating store that records every chunk boundary it copies.
struct RecordingStore {
    inner: Arc<MemoryGhost>,
    boundaries: Mutex<Vec<ChunkBoundary>>,
}

#[async_trait]
impl ChunkStore for RecordingStore {
    async fn migration_range(&self) -> MoltResult<Option<MigrationRange>> {
        self.inner.migration_range().await
    }

    async fn next_chunk_boundary(
        &self,
        from_values: &[ColumnValue],
        include_from: bool,
        chunk_size: i64,
    ) -> MoltResult<Option<Vec<ColumnValue>>> {
        self.inner
            .next_chunk_boundary(from_values, include_from, chunk_size)
            .await
    }

    async fn copy_chunk(&self, boundary: &ChunkBoundary) -> MoltResult<ApplyStats> {
        self.boundaries.lock().unwrap().push(boundary.clone());
        self.inner.copy_chunk(boundary).await
    }
}

async fn run_copy(rows: usize, chunk_size: i64) -> (Arc<RecordingStore>, u64) {
    let columns = key_columns();
    let source = Arc::new(Mutex::new(TableModel::new(columns.clone(), composite_key())));
    for i in 0..rows {
        source.lock().unwrap().insert(vec![
            ColumnValue::Int((i / 7) as i64),
            ColumnValue::Int((i % 7) as i64),
            ColumnValue::Text(format!("row-{i}")),
        ]);
    }

    let mapping = ColumnMapping::derive(&columns, &columns, &HashMap::new());
    let ghost = Arc::new(MemoryGhost::new(source, mapping));
    let store = Arc::new(RecordingStore {
        inner: ghost,
        boundaries: Mutex::new(Vec::new()),
    });

    let context = test_context();
    context.set_chunk_size(chunk_size);

    let (_gate, watch) = create_throttle_gate();
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    RowCopyWorker::new(context.clone(), store.clone(), watch, shutdown_rx)
        .spawn()
        .wait()
        .await
        .unwrap();

    (store, context.rows_copied())
}

#[tokio::test]
async fn boundaries_are_monotonic_without_overlap_or_gap() {
    let (store, copied) = run_copy(203, 10).await;
    let boundaries = store.boundaries.lock().unwrap();

    assert!(!boundaries.is_empty());
    assert!(boundaries[0].include_from);
    assert_eq!(copied, 203);

    for window in boundaries.windows(2) {
        let (previous, next) = (&window[0], &window[1]);
        // No gap, no overlap: the next chunk starts exactly at the previous
        // upper bound, exclusive.
        assert_eq!(previous.to_values, next.from_values);
        assert!(!next.include_from);
        assert!(
            compare_key_tuples(&previous.from_values, &previous.to_values)
                != std::cmp::Ordering::Greater
        );
    }

    let total_chunks = boundaries.len();
    assert_eq!(total_chunks, 203usize.div_ceil(10));
}

#[tokio::test]
async fn chunk_size_larger_than_table_copies_in_one_chunk() {
    let (store, copied) = run_copy(35, 1000).await;
    let boundaries = store.boundaries.lock().unwrap();
    assert_eq!(boundaries.len(), 1);
    assert_eq!(copied, 35);
}

#[tokio::test]
async fn single_row_table_copies_one_chunk() {
    let (store, copied) = run_copy(1, 10).await;
    let boundaries = store.boundaries.lock().unwrap();
    assert_eq!(boundaries.len(), 1);
    assert_eq!(copied, 1);
    assert_eq!(boundaries[0].from_values, boundaries[0].to_values);
}

#[tokio::test]
async fn empty_table_completes_without_chunks() {
    let (store, copied) = run_copy(0, 10).await;
    assert!(store.boundaries.lock().unwrap().is_empty());
    assert_eq!(copied, 0);
}
