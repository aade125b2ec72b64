//! The changelog rendezvous: a state row travels through the same ordered
//! channel as DML and its applied signal fires only after every preceding
//! modification has been committed to the sink.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use molt::binlog::entry::{BinlogEntry, DmlKind};
use molt::binlog::streamer::{BinlogStreamer, HINT_HEARTBEAT, HINT_STATE};
use molt::concurrency::{create_shutdown_channel, create_throttle_gate};
use molt::error::MoltResult;
use molt::sink::{ApplyStats, DmlSink};
use molt::sql::ColumnValue;
use molt::test_utils::scripted_reader::{ScriptedBinlogReader, rows_event};
use molt::test_utils::test_context;
use molt::workers::event_apply::EventApplyWorker;
use molt_mysql::BinlogCoordinates;
use tokio::sync::mpsc;

/// Records the order entries are committed in.
#[derive(Default)]
struct RecordingSink {
    applied: Mutex<Vec<BinlogEntry>>,
}

#[async_trait]
impl DmlSink for RecordingSink {
    async fn apply_dml_batch(&self, entries: &[BinlogEntry]) -> MoltResult<ApplyStats> {
        self.applied.lock().unwrap().extend(entries.iter().cloned());
        Ok(ApplyStats::default())
    }
}

fn changelog_row(hint: &str, value: &str) -> Vec<ColumnValue> {
    vec![
        ColumnValue::Int(1),
        ColumnValue::Null,
        ColumnValue::Text(hint.to_string()),
        ColumnValue::Text(value.to_string()),
    ]
}

fn order_row(id: i64) -> Vec<ColumnValue> {
    vec![ColumnValue::Int(id), ColumnValue::Int(id), ColumnValue::Null]
}

#[tokio::test]
async fn state_signal_fires_after_preceding_dml_is_applied() {
    let context = test_context();
    let sink = Arc::new(RecordingSink::default());

    let (gate, watch) = create_throttle_gate();
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let (events_tx, events_rx) = mpsc::channel(100);
    let (state_tx, mut state_rx) = mpsc::channel(16);
    let _ = gate;

    // Script: three DML events on the migrated table, a foreign-table event
    // that must be filtered, the lock sentinel, then one more DML event
    // that must not be applied before the signal.
    let script = vec![
        Ok(rows_event(
            "shop",
            "orders",
            DmlKind::Insert,
            None,
            Some(order_row(1)),
            110,
        )),
        Ok(rows_event(
            "shop",
            "orders",
            DmlKind::Insert,
            None,
            Some(order_row(2)),
            120,
        )),
        Ok(rows_event(
            "shop",
            "unrelated_table",
            DmlKind::Insert,
            None,
            Some(order_row(99)),
            125,
        )),
        Ok(rows_event(
            "shop",
            "orders",
            DmlKind::Delete,
            Some(order_row(1)),
            None,
            130,
        )),
        Ok(rows_event(
            "shop",
            "_orders_ghc",
            DmlKind::Insert,
            None,
            Some(changelog_row(HINT_STATE, "AllEventsUpToLockProcessed:42")),
            140,
        )),
        Ok(rows_event(
            "shop",
            "orders",
            DmlKind::Insert,
            None,
            Some(order_row(3)),
            150,
        )),
    ];

    let reader = ScriptedBinlogReader::new(script);
    let streamer = BinlogStreamer::new(context.clone(), reader, events_tx, shutdown_rx.clone());
    let streamer_handle = tokio::spawn(streamer.run(BinlogCoordinates::file("mysql-bin.000001", 4)));

    let apply_handle = EventApplyWorker::new(
        context.clone(),
        sink.clone(),
        events_rx,
        state_tx,
        watch,
        shutdown_rx,
    )
    .spawn();

    let state = tokio::time::timeout(std::time::Duration::from_secs(5), state_rx.recv())
        .await
        .expect("state signal within timeout")
        .expect("state channel open");
    assert_eq!(state, "AllEventsUpToLockProcessed:42");

    // At signal time every event preceding the sentinel was committed, in
    // binlog order, and the foreign-table event never reached the sink.
    {
        let applied = sink.applied.lock().unwrap();
        assert!(applied.len() >= 3);
        let positions: Vec<u64> = applied
            .iter()
            .map(|e| match &e.coordinates {
                BinlogCoordinates::File { log_pos, .. } => *log_pos,
                _ => 0,
            })
            .collect();
        assert_eq!(&positions[..3], &[110, 120, 130]);
        assert!(applied.iter().all(|e| e.dml_event.table == "orders"));
    }

    streamer_handle.await.unwrap().unwrap();
    apply_handle.wait().await.unwrap();
    shutdown_tx.shutdown();

    // Everything drained: the trailing event applied too, in order.
    let applied = sink.applied.lock().unwrap();
    let positions: Vec<u64> = applied
        .iter()
        .map(|e| match &e.coordinates {
            BinlogCoordinates::File { log_pos, .. } => *log_pos,
            _ => 0,
        })
        .collect();
    assert_eq!(positions, vec![110, 120, 130, 150]);
    assert_eq!(context.binlog_events_read(), 4);
    assert_eq!(context.binlog_events_applied(), 4);
}

#[tokio::test]
async fn heartbeat_rows_update_lag_instead_of_applying() {
    let context = test_context();
    let sink = Arc::new(RecordingSink::default());

    let (_gate, watch) = create_throttle_gate();
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let (events_tx, events_rx) = mpsc::channel(16);
    let (state_tx, _state_rx) = mpsc::channel(16);

    let written_at = chrono::Utc::now() - chrono::Duration::seconds(3);
    let script = vec![Ok(rows_event(
        "shop",
        "_orders_ghc",
        DmlKind::Insert,
        None,
        Some(changelog_row(
            HINT_HEARTBEAT,
            &written_at.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
        )),
        200,
    ))];

    let reader = ScriptedBinlogReader::new(script);
    let streamer = BinlogStreamer::new(context.clone(), reader, events_tx, shutdown_rx.clone());
    streamer
        .run(BinlogCoordinates::file("mysql-bin.000001", 4))
        .await
        .unwrap();

    let apply_handle = EventApplyWorker::new(
        context.clone(),
        sink.clone(),
        events_rx,
        state_tx,
        watch,
        shutdown_rx,
    )
    .spawn();
    apply_handle.wait().await.unwrap();
    shutdown_tx.shutdown();

    // The heartbeat surfaced as lag, not as DML.
    let lag = context.heartbeat_lag().expect("heartbeat was observed");
    assert!(lag >= std::time::Duration::from_secs(2));
    assert!(sink.applied.lock().unwrap().is_empty());
    assert_eq!(context.binlog_events_read(), 0);
}
