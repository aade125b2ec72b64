use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::binlog::entry::{BinlogEntry, DmlKind};
use crate::error::{MoltError, MoltResult};
use crate::schema::{ColumnList, ColumnMapping, UniqueKey};
use crate::sink::{ApplyStats, ChunkBoundary, ChunkStore, DmlSink, MigrationRange};
use crate::sql::ColumnValue;

/// An in-memory model of the original table, keyed by its unique key.
///
/// Tests mutate it to simulate the production workload; the mutations
/// double as the binlog the scripted reader replays.
#[derive(Debug)]
pub struct TableModel {
    pub columns: ColumnList,
    pub unique_key: UniqueKey,
    key_indexes: Vec<usize>,
    rows: BTreeMap<Vec<ColumnValue>, Vec<ColumnValue>>,
}

impl TableModel {
    pub fn new(columns: ColumnList, unique_key: UniqueKey) -> Self {
        let key_indexes = unique_key
            .columns
            .names()
            .iter()
            .filter_map(|name| columns.index_of(name))
            .collect();
        TableModel {
            columns,
            unique_key,
            key_indexes,
            rows: BTreeMap::new(),
        }
    }

    pub fn key_of(&self, row: &[ColumnValue]) -> Vec<ColumnValue> {
        self.key_indexes
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(ColumnValue::Null))
            .collect()
    }

    pub fn insert(&mut self, row: Vec<ColumnValue>) {
        let key = self.key_of(&row);
        self.rows.insert(key, row);
    }

    /// Replaces the row stored under the old row's key; the new row may
    /// carry a different key.
    pub fn update(&mut self, old_row: &[ColumnValue], new_row: Vec<ColumnValue>) {
        let old_key = self.key_of(old_row);
        self.rows.remove(&old_key);
        let new_key = self.key_of(&new_row);
        self.rows.insert(new_key, new_row);
    }

    pub fn delete(&mut self, row: &[ColumnValue]) {
        let key = self.key_of(row);
        self.rows.remove(&key);
    }

    pub fn get(&self, key: &[ColumnValue]) -> Option<&Vec<ColumnValue>> {
        self.rows.get(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> impl Iterator<Item = (&Vec<ColumnValue>, &Vec<ColumnValue>)> {
        self.rows.iter()
    }
}

fn project(mapping: &ColumnMapping, row: &[ColumnValue]) -> Vec<ColumnValue> {
    mapping
        .shared()
        .iter()
        .map(|shared| {
            row.get(shared.original_index)
                .cloned()
                .unwrap_or(ColumnValue::Null)
        })
        .collect()
}

/// An in-memory ghost table implementing both pipeline write surfaces with
/// the production rewrite semantics: chunk copies are insert-ignore, binlog
/// inserts are replaces, updates and deletes are keyed on the pre-image's
/// unique-key values.
pub struct MemoryGhost {
    source: Arc<Mutex<TableModel>>,
    mapping: ColumnMapping,
    key_indexes: Vec<usize>,
    ghost: Mutex<BTreeMap<Vec<ColumnValue>, Vec<ColumnValue>>>,
    /// Artificial per-operation delay, for stall and timeout scenarios.
    pub apply_delay: Mutex<Option<Duration>>,
}

impl MemoryGhost {
    pub fn new(source: Arc<Mutex<TableModel>>, mapping: ColumnMapping) -> Self {
        let key_indexes = {
            let table = source.lock().unwrap();
            table
                .unique_key
                .columns
                .names()
                .iter()
                .filter_map(|name| table.columns.index_of(name))
                .collect()
        };
        MemoryGhost {
            source,
            mapping,
            key_indexes,
            ghost: Mutex::new(BTreeMap::new()),
            apply_delay: Mutex::new(None),
        }
    }

    fn key_of(&self, row: &[ColumnValue]) -> Vec<ColumnValue> {
        self.key_indexes
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(ColumnValue::Null))
            .collect()
    }

    async fn maybe_delay(&self) {
        let delay = *self.apply_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Snapshot of the ghost's rows, keyed by unique key.
    pub fn ghost_rows(&self) -> BTreeMap<Vec<ColumnValue>, Vec<ColumnValue>> {
        self.ghost.lock().unwrap().clone()
    }

    /// What the ghost must equal at convergence: the source's current rows
    /// projected through the column mapping.
    pub fn expected_rows(&self) -> BTreeMap<Vec<ColumnValue>, Vec<ColumnValue>> {
        let source = self.source.lock().unwrap();
        source
            .rows()
            .map(|(key, row)| (key.clone(), project(&self.mapping, row)))
            .collect()
    }
}

#[async_trait]
impl ChunkStore for MemoryGhost {
    async fn migration_range(&self) -> MoltResult<Option<MigrationRange>> {
        let source = self.source.lock().unwrap();
        let mut keys = source.rows().map(|(key, _)| key);
        let Some(first) = keys.next() else {
            return Ok(None);
        };
        let last = keys.last().unwrap_or(first);
        Ok(Some(MigrationRange {
            min_values: first.clone(),
            max_values: last.clone(),
        }))
    }

    async fn next_chunk_boundary(
        &self,
        from_values: &[ColumnValue],
        include_from: bool,
        chunk_size: i64,
    ) -> MoltResult<Option<Vec<ColumnValue>>> {
        if chunk_size <= 0 {
            return Err(MoltError::other("chunk size must be positive"));
        }
        let source = self.source.lock().unwrap();
        let boundary = source
            .rows()
            .map(|(key, _)| key)
            .filter(|key| {
                let cmp = crate::sql::value::compare_key_tuples(key, from_values);
                if include_from {
                    cmp != std::cmp::Ordering::Less
                } else {
                    cmp == std::cmp::Ordering::Greater
                }
            })
            .nth(chunk_size as usize - 1)
            .cloned();
        Ok(boundary)
    }

    async fn copy_chunk(&self, boundary: &ChunkBoundary) -> MoltResult<ApplyStats> {
        self.maybe_delay().await;
        let started = Instant::now();

        // The production chunk copy reads the range under a share lock and
        // inserts within one transaction; holding the source lock across
        // the merge models that atomicity. Lock order is source then ghost
        // everywhere.
        let source = self.source.lock().unwrap();
        let mut ghost = self.ghost.lock().unwrap();
        let mut rows_affected = 0;
        for (key, row) in source.rows().filter(|(key, _)| {
            let lower = crate::sql::value::compare_key_tuples(key, &boundary.from_values);
            let lower_ok = if boundary.include_from {
                lower != std::cmp::Ordering::Less
            } else {
                lower == std::cmp::Ordering::Greater
            };
            let upper = crate::sql::value::compare_key_tuples(key, &boundary.to_values);
            lower_ok && upper != std::cmp::Ordering::Greater
        }) {
            if !ghost.contains_key(key) {
                ghost.insert(key.clone(), project(&self.mapping, row));
                rows_affected += 1;
            }
        }

        Ok(ApplyStats {
            rows_affected,
            duration: started.elapsed(),
        })
    }
}

#[async_trait]
impl DmlSink for MemoryGhost {
    async fn apply_dml_batch(&self, entries: &[BinlogEntry]) -> MoltResult<ApplyStats> {
        self.maybe_delay().await;
        let started = Instant::now();
        let mut ghost = self.ghost.lock().unwrap();
        let mut rows_affected = 0;

        for entry in entries {
            match entry.dml_event.kind {
                DmlKind::Insert => {
                    let new_values = entry
                        .dml_event
                        .new_values
                        .as_deref()
                        .ok_or_else(|| MoltError::other("insert without new image"))?;
                    let key = self.key_of(new_values);
                    ghost.insert(key, project(&self.mapping, new_values));
                    rows_affected += 1;
                }
                DmlKind::Update => {
                    let new_values = entry
                        .dml_event
                        .new_values
                        .as_deref()
                        .ok_or_else(|| MoltError::other("update without new image"))?;
                    let where_values = entry
                        .dml_event
                        .where_values
                        .as_deref()
                        .ok_or_else(|| MoltError::other("update without where image"))?;
                    let old_key = self.key_of(where_values);
                    let new_key = self.key_of(new_values);
                    if old_key == new_key {
                        // Plain update: only touches an already-copied row.
                        if ghost.remove(&old_key).is_some() {
                            ghost.insert(new_key, project(&self.mapping, new_values));
                            rows_affected += 1;
                        }
                    } else {
                        // Key-moving update replays as delete + replace, as
                        // the production rewrite does.
                        ghost.remove(&old_key);
                        ghost.insert(new_key, project(&self.mapping, new_values));
                        rows_affected += 1;
                    }
                }
                DmlKind::Delete => {
                    let where_values = entry
                        .dml_event
                        .where_values
                        .as_deref()
                        .ok_or_else(|| MoltError::other("delete without where image"))?;
                    let key = self.key_of(where_values);
                    if ghost.remove(&key).is_some() {
                        rows_affected += 1;
                    }
                }
            }
        }

        Ok(ApplyStats {
            rows_affected,
            duration: started.elapsed(),
        })
    }
}
