//! Throttle responsiveness: the user-commanded flag stops both pipelines
//! from starting new units within a tick, and clearing it resumes them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use molt::concurrency::{create_shutdown_channel, create_throttle_gate};
use molt::context::ThrottleReason;
use molt::schema::{Column, ColumnKind, ColumnList, ColumnMapping, UniqueKey};
use molt::sql::ColumnValue;
use molt::test_utils::memory::{MemoryGhost, TableModel};
use molt::test_utils::test_context;
use molt::workers::row_copy::RowCopyWorker;
use molt::workers::throttler::Throttler;
use sqlx::mysql::MySqlPoolOptions;

fn columns() -> ColumnList {
    ColumnList::new(vec![
        Column::new("id", ColumnKind::SignedInteger, false),
        Column::new("v", ColumnKind::SignedInteger, false),
    ])
}

fn unique_key() -> UniqueKey {
    UniqueKey::new(
        "PRIMARY",
        ColumnList::new(vec![Column::new("id", ColumnKind::SignedInteger, false)]),
    )
}

/// A pool that never connects; the throttler's user-commanded check needs
/// no database round trip.
fn lazy_pool() -> sqlx::MySqlPool {
    MySqlPoolOptions::new().connect_lazy("mysql://molt@localhost:1/unused")
        .expect("lazy pool construction is infallible")
}

#[tokio::test]
async fn throttler_publishes_user_command_within_ticks() {
    let context = test_context();
    let (gate, watch) = create_throttle_gate();
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let tick = Duration::from_millis(context.config.throttle.tick_interval_millis);

    let handle = Throttler::new(
        context.clone(),
        gate,
        lazy_pool(),
        lazy_pool(),
        shutdown_rx,
    )
    .spawn();

    context.set_throttle_commanded_by_user(true);
    tokio::time::sleep(tick * 2).await;
    assert_eq!(
        watch.current_reason(),
        Some(ThrottleReason::CommandedByUser)
    );
    assert_eq!(
        context.throttle_reason(),
        Some(ThrottleReason::CommandedByUser)
    );

    context.set_throttle_commanded_by_user(false);
    tokio::time::sleep(tick * 2).await;
    assert_eq!(watch.current_reason(), None);

    shutdown_tx.shutdown();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn row_copy_pauses_and_resumes_on_the_gate() {
    let source = Arc::new(Mutex::new(TableModel::new(columns(), unique_key())));
    for id in 1..=5000 {
        source
            .lock()
            .unwrap()
            .insert(vec![ColumnValue::Int(id), ColumnValue::Int(id)]);
    }
    let mapping = ColumnMapping::derive(&columns(), &columns(), &HashMap::new());
    let ghost = Arc::new(MemoryGhost::new(source, mapping));
    *ghost.apply_delay.lock().unwrap() = Some(Duration::from_millis(2));

    let context = test_context();
    context.set_chunk_size(10);

    let (gate, watch) = create_throttle_gate();
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handle = RowCopyWorker::new(context.clone(), ghost.clone(), watch, shutdown_rx).spawn();

    // Let some chunks through, then close the gate.
    tokio::time::sleep(Duration::from_millis(30)).await;
    gate.publish(Some(ThrottleReason::CommandedByUser));

    // One in-flight chunk may still land; after that the counter must hold.
    tokio::time::sleep(Duration::from_millis(30)).await;
    let frozen = context.rows_copied();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(context.rows_copied(), frozen, "chunks advanced while throttled");

    // Reopen the gate: copying resumes.
    gate.publish(None);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(context.rows_copied() > frozen, "chunks did not resume");

    shutdown_tx.shutdown();
    handle.wait().await.unwrap();
}
