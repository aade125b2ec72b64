use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

static REGISTER_METRICS: Once = Once::new();

pub const MOLT_ROWS_COPIED_TOTAL: &str = "molt_rows_copied_total";
pub const MOLT_CHUNKS_COPIED_TOTAL: &str = "molt_chunks_copied_total";
pub const MOLT_BINLOG_EVENTS_READ_TOTAL: &str = "molt_binlog_events_read_total";
pub const MOLT_BINLOG_EVENTS_APPLIED_TOTAL: &str = "molt_binlog_events_applied_total";
pub const MOLT_DML_BATCH_SIZE: &str = "molt_dml_batch_size";
pub const MOLT_CHUNK_DURATION_MILLISECONDS: &str = "molt_chunk_duration_milliseconds";
pub const MOLT_REPLICATION_LAG_MILLISECONDS: &str = "molt_replication_lag_milliseconds";
pub const MOLT_THROTTLED: &str = "molt_throttled";
pub const MOLT_CUT_OVER_ATTEMPTS_TOTAL: &str = "molt_cut_over_attempts_total";

/// Label key for the migrated table.
pub const TABLE_LABEL: &str = "table";
/// Label key for the throttle reason.
pub const REASON_LABEL: &str = "reason";

/// Registers metric descriptions. Safe to call multiple times; only the
/// first call registers.
pub(crate) fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_counter!(
            MOLT_ROWS_COPIED_TOTAL,
            Unit::Count,
            "Rows copied from the original table into the ghost table"
        );

        describe_counter!(
            MOLT_CHUNKS_COPIED_TOTAL,
            Unit::Count,
            "Chunk transactions applied to the ghost table"
        );

        describe_counter!(
            MOLT_BINLOG_EVENTS_READ_TOTAL,
            Unit::Count,
            "DML events decoded from the binary log"
        );

        describe_counter!(
            MOLT_BINLOG_EVENTS_APPLIED_TOTAL,
            Unit::Count,
            "DML events replayed onto the ghost table"
        );

        describe_gauge!(
            MOLT_DML_BATCH_SIZE,
            Unit::Count,
            "Size of the last applied DML batch"
        );

        describe_histogram!(
            MOLT_CHUNK_DURATION_MILLISECONDS,
            Unit::Milliseconds,
            "Duration of a chunk copy transaction"
        );

        describe_gauge!(
            MOLT_REPLICATION_LAG_MILLISECONDS,
            Unit::Milliseconds,
            "Heartbeat-measured replication lag of the inspected server"
        );

        describe_gauge!(
            MOLT_THROTTLED,
            Unit::Count,
            "1 while the migration is throttled, 0 otherwise"
        );

        describe_counter!(
            MOLT_CUT_OVER_ATTEMPTS_TOTAL,
            Unit::Count,
            "Cut-over attempts, including aborted ones"
        );
    });
}
