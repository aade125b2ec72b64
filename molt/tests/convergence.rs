//! Convergence of the two write streams: for any interleaving of chunk
//! copies and replayed DML, the ghost ends up equal to the original's final
//! row set projected through the column mapping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use molt::binlog::entry::DmlKind;
use molt::binlog::streamer::BinlogStreamer;
use molt::concurrency::{create_shutdown_channel, create_throttle_gate};
use molt::schema::{Column, ColumnKind, ColumnList, ColumnMapping, UniqueKey};
use molt::sql::ColumnValue;
use molt::test_utils::memory::{MemoryGhost, TableModel};
use molt::test_utils::scripted_reader::{ChannelBinlogReader, rows_event};
use molt::test_utils::test_context;
use molt::workers::event_apply::EventApplyWorker;
use molt::workers::row_copy::RowCopyWorker;
use molt_mysql::BinlogCoordinates;
use tokio::sync::mpsc;

fn orders_columns() -> ColumnList {
    ColumnList::new(vec![
        Column::new("id", ColumnKind::SignedInteger, false),
        Column::new("amount", ColumnKind::SignedInteger, false),
        Column::new("note", ColumnKind::Text, true),
    ])
}

fn orders_key() -> UniqueKey {
    UniqueKey::new(
        "PRIMARY",
        ColumnList::new(vec![Column::new("id", ColumnKind::SignedInteger, false)]),
    )
}

fn row(id: i64, amount: i64, note: &str) -> Vec<ColumnValue> {
    vec![
        ColumnValue::Int(id),
        ColumnValue::Int(amount),
        ColumnValue::Text(note.to_string()),
    ]
}

fn identity_mapping(columns: &ColumnList) -> ColumnMapping {
    ColumnMapping::derive(columns, columns, &HashMap::new())
}

/// Deterministic pseudo-random sequence, good enough to scatter a workload.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

#[tokio::test]
async fn row_copy_alone_copies_everything() {
    let columns = orders_columns();
    let source = Arc::new(Mutex::new(TableModel::new(columns.clone(), orders_key())));
    for id in 1..=500 {
        source.lock().unwrap().insert(row(id, id * 10, "x"));
    }

    let ghost = Arc::new(MemoryGhost::new(source.clone(), identity_mapping(&columns)));
    let context = test_context();
    context.set_chunk_size(10);

    let (_gate, watch) = create_throttle_gate();
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let handle = RowCopyWorker::new(context.clone(), ghost.clone(), watch, shutdown_rx).spawn();
    handle.wait().await.unwrap();
    shutdown_tx.shutdown();

    assert!(context.is_row_copy_complete());
    assert_eq!(ghost.ghost_rows().len(), 500);
    assert_eq!(ghost.ghost_rows(), ghost.expected_rows());
    assert_eq!(context.rows_copied(), 500);
}

#[tokio::test]
async fn concurrent_dml_and_row_copy_converge() {
    let columns = orders_columns();
    let source = Arc::new(Mutex::new(TableModel::new(columns.clone(), orders_key())));
    for id in 1..=2000 {
        source.lock().unwrap().insert(row(id, id, "seed"));
    }

    let ghost = Arc::new(MemoryGhost::new(source.clone(), identity_mapping(&columns)));
    let context = test_context();
    context.set_chunk_size(25);
    context.set_dml_batch_size(7);

    let (_gate, watch) = create_throttle_gate();
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let (events_tx, events_rx) = mpsc::channel(100);
    let (state_tx, _state_rx) = mpsc::channel(16);

    let (binlog_tx, reader) = ChannelBinlogReader::new();
    let streamer_handle = {
        let streamer =
            BinlogStreamer::new(context.clone(), reader, events_tx, shutdown_rx.clone());
        tokio::spawn(streamer.run(BinlogCoordinates::file("mysql-bin.000001", 4)))
    };

    let apply_handle = EventApplyWorker::new(
        context.clone(),
        ghost.clone(),
        events_rx,
        state_tx,
        watch.clone(),
        shutdown_rx.clone(),
    )
    .spawn();

    let copy_handle =
        RowCopyWorker::new(context.clone(), ghost.clone(), watch, shutdown_rx).spawn();

    // Concurrent workload: mutate the source, then stream the matching
    // binlog event, the way a captured production write would arrive.
    let mut rng = Lcg(42);
    let mut log_pos = 100;
    for _ in 0..1500 {
        let id = (rng.next() % 2500 + 1) as i64;
        let choice = rng.next() % 10;
        log_pos += 10;

        let existing = source.lock().unwrap().get(&[ColumnValue::Int(id)]).cloned();
        match (choice, existing) {
            // Delete one row in ten.
            (0, Some(old_row)) => {
                source.lock().unwrap().delete(&old_row);
                binlog_tx
                    .send(rows_event(
                        "shop",
                        "orders",
                        DmlKind::Delete,
                        Some(old_row),
                        None,
                        log_pos,
                    ))
                    .unwrap();
            }
            // Insert when the key is free.
            (_, None) => {
                let new_row = row(id, id * 2, "inserted");
                source.lock().unwrap().insert(new_row.clone());
                binlog_tx
                    .send(rows_event(
                        "shop",
                        "orders",
                        DmlKind::Insert,
                        None,
                        Some(new_row),
                        log_pos,
                    ))
                    .unwrap();
            }
            // Update otherwise.
            (_, Some(old_row)) => {
                let new_row = row(id, id * 3, "updated");
                source.lock().unwrap().update(&old_row, new_row.clone());
                binlog_tx
                    .send(rows_event(
                        "shop",
                        "orders",
                        DmlKind::Update,
                        Some(old_row),
                        Some(new_row),
                        log_pos,
                    ))
                    .unwrap();
            }
        }

        if rng.next() % 50 == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    copy_handle.wait().await.unwrap();
    assert!(context.is_row_copy_complete());

    // Close the binlog: the streamer drains, then the applier drains.
    drop(binlog_tx);
    streamer_handle.await.unwrap().unwrap();
    apply_handle.wait().await.unwrap();
    shutdown_tx.shutdown();

    assert_eq!(ghost.ghost_rows(), ghost.expected_rows());
    assert_eq!(
        context.binlog_events_read(),
        context.binlog_events_applied()
    );
}

#[tokio::test]
async fn nullable_unique_key_with_null_row_copies_fully() {
    use molt::sink::DmlSink;

    let columns = ColumnList::new(vec![
        Column::new("code", ColumnKind::Text, true),
        Column::new("amount", ColumnKind::SignedInteger, false),
    ]);
    let key = UniqueKey::new(
        "code_uidx",
        ColumnList::new(vec![Column::new("code", ColumnKind::Text, true)]),
    );

    let source = Arc::new(Mutex::new(TableModel::new(columns.clone(), key)));
    // NULL sorts first, so this row is the range minimum and seeds the
    // very first chunk cursor.
    source
        .lock()
        .unwrap()
        .insert(vec![ColumnValue::Null, ColumnValue::Int(0)]);
    for i in 1..=60 {
        source.lock().unwrap().insert(vec![
            ColumnValue::Text(format!("k{i:02}")),
            ColumnValue::Int(i),
        ]);
    }

    let ghost = Arc::new(MemoryGhost::new(source.clone(), identity_mapping(&columns)));
    let context = test_context();
    context.set_chunk_size(10);

    let (_gate, watch) = create_throttle_gate();
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handle = RowCopyWorker::new(context.clone(), ghost.clone(), watch, shutdown_rx).spawn();
    handle.wait().await.unwrap();
    shutdown_tx.shutdown();

    assert!(context.is_row_copy_complete());
    assert_eq!(context.rows_copied(), 61);
    assert_eq!(ghost.ghost_rows(), ghost.expected_rows());
    assert!(ghost.ghost_rows().contains_key(&vec![ColumnValue::Null]));

    // DML keyed on the NULL value replays too.
    use molt::binlog::entry::{BinlogEntry, DmlEvent};
    let delete = BinlogEntry::new(
        BinlogCoordinates::file("mysql-bin.000001", 70),
        71,
        DmlEvent {
            database: "shop".into(),
            table: "orders".into(),
            kind: DmlKind::Delete,
            where_values: Some(vec![ColumnValue::Null, ColumnValue::Int(0)]),
            new_values: None,
        },
    );
    ghost.apply_dml_batch(&[delete]).await.unwrap();
    assert!(!ghost.ghost_rows().contains_key(&vec![ColumnValue::Null]));
}

#[tokio::test]
async fn key_moving_update_lands_even_when_pre_image_was_never_copied() {
    use molt::binlog::entry::{BinlogEntry, DmlEvent};
    use molt::sink::DmlSink;

    let columns = orders_columns();
    let source = Arc::new(Mutex::new(TableModel::new(columns.clone(), orders_key())));
    let ghost = MemoryGhost::new(source, identity_mapping(&columns));

    // The row at id=5 exists on the original but row copy has not reached
    // it; a concurrent update moves it to id=9000.
    let entry = BinlogEntry::new(
        BinlogCoordinates::file("mysql-bin.000001", 50),
        51,
        DmlEvent {
            database: "shop".into(),
            table: "orders".into(),
            kind: DmlKind::Update,
            where_values: Some(row(5, 1, "old")),
            new_values: Some(row(9000, 1, "moved")),
        },
    );
    ghost.apply_dml_batch(&[entry]).await.unwrap();

    let rows = ghost.ghost_rows();
    assert!(rows.contains_key(&vec![ColumnValue::Int(9000)]));
    assert!(!rows.contains_key(&vec![ColumnValue::Int(5)]));
}

#[tokio::test]
async fn replaying_the_same_events_is_idempotent() {
    use molt::binlog::entry::{BinlogEntry, DmlEvent};
    use molt::sink::DmlSink;

    let columns = orders_columns();
    let source = Arc::new(Mutex::new(TableModel::new(columns.clone(), orders_key())));
    let ghost = MemoryGhost::new(source, identity_mapping(&columns));

    let entries: Vec<BinlogEntry> = vec![
        BinlogEntry::new(
            BinlogCoordinates::file("mysql-bin.000001", 10),
            11,
            DmlEvent {
                database: "shop".into(),
                table: "orders".into(),
                kind: DmlKind::Insert,
                where_values: None,
                new_values: Some(row(1, 100, "a")),
            },
        ),
        BinlogEntry::new(
            BinlogCoordinates::file("mysql-bin.000001", 20),
            21,
            DmlEvent {
                database: "shop".into(),
                table: "orders".into(),
                kind: DmlKind::Update,
                where_values: Some(row(1, 100, "a")),
                new_values: Some(row(1, 200, "b")),
            },
        ),
        BinlogEntry::new(
            BinlogCoordinates::file("mysql-bin.000001", 30),
            31,
            DmlEvent {
                database: "shop".into(),
                table: "orders".into(),
                kind: DmlKind::Insert,
                where_values: None,
                new_values: Some(row(2, 300, "c")),
            },
        ),
        BinlogEntry::new(
            BinlogCoordinates::file("mysql-bin.000001", 40),
            41,
            DmlEvent {
                database: "shop".into(),
                table: "orders".into(),
                kind: DmlKind::Delete,
                where_values: Some(row(2, 300, "c")),
                new_values: None,
            },
        ),
    ];

    ghost.apply_dml_batch(&entries).await.unwrap();
    let first_pass = ghost.ghost_rows();

    // At-least-once delivery: the same entries may arrive again after a
    // streamer reconnect.
    let duplicates: Vec<BinlogEntry> = entries.iter().map(|e| e.duplicate()).collect();
    ghost.apply_dml_batch(&duplicates).await.unwrap();

    assert_eq!(ghost.ghost_rows(), first_pass);
    assert_eq!(first_pass.len(), 1);
    assert_eq!(
        first_pass.get(&vec![ColumnValue::Int(1)]).unwrap()[1],
        ColumnValue::Int(200)
    );
}
