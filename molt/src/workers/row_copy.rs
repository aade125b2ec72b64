use std::cmp::Ordering;
use std::sync::Arc;

use metrics::{counter, histogram};
use tracing::{debug, info};

use crate::concurrency::{ShutdownRx, ThrottleWatch};
use crate::context::MigrationContext;
use crate::error::MoltResult;
use crate::metrics::{
    MOLT_CHUNKS_COPIED_TOTAL, MOLT_CHUNK_DURATION_MILLISECONDS, MOLT_ROWS_COPIED_TOTAL,
};
use crate::sink::{ChunkBoundary, ChunkStore};
use crate::sql::value::compare_key_tuples;
use crate::workers::base::WorkerHandle;
use crate::workers::retry_with_backoff;

/// Back-fills the ghost table chunk by chunk, in ascending unique-key
/// order, serialised on the applier.
///
/// The iterator invariant: each chunk's `from_values` is the previous
/// chunk's `to_values`, exclusive; only the first chunk includes its lower
/// bound. Between chunks the worker honours the throttle gate and the
/// nice-ratio sleep; it never interrupts an in-flight chunk transaction.
pub struct RowCopyWorker<S> {
    context: Arc<MigrationContext>,
    store: Arc<S>,
    throttle: ThrottleWatch,
    shutdown_rx: ShutdownRx,
}

impl<S: ChunkStore + 'static> RowCopyWorker<S> {
    pub fn new(
        context: Arc<MigrationContext>,
        store: Arc<S>,
        throttle: ThrottleWatch,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        RowCopyWorker {
            context,
            store,
            throttle,
            shutdown_rx,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let context = self.context.clone();
        crate::workers::spawn_supervised("row-copy", context, self.run())
    }

    async fn run(mut self) -> MoltResult<()> {
        let retries = self.context.config.migration.default_retries;

        let store = self.store.clone();
        let range = retry_with_backoff(retries, "migration range", || {
            let store = store.clone();
            async move { store.migration_range().await }
        })
        .await?;

        let Some(range) = range else {
            info!("original table is empty, row copy complete");
            self.context.mark_row_copy_complete();
            return Ok(());
        };

        info!(
            min = %crate::sql::value::display_key_tuple(&range.min_values),
            max = %crate::sql::value::display_key_tuple(&range.max_values),
            "starting row copy"
        );

        let mut from_values = range.min_values.clone();
        let mut include_from = true;

        loop {
            if self.shutdown_rx.is_shutdown() {
                info!("row copy interrupted by shutdown");
                return Ok(());
            }

            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = self.throttle.wait_until_clear() => {}
                _ = shutdown_rx.wait_for_shutdown() => {
                    info!("row copy interrupted by shutdown");
                    return Ok(());
                }
            }

            let chunk_size = self.context.chunk_size();
            let store = self.store.clone();
            let from = from_values.clone();
            let boundary_to = retry_with_backoff(retries, "chunk boundary", || {
                let store = store.clone();
                let from = from.clone();
                async move {
                    store
                        .next_chunk_boundary(&from, include_from, chunk_size)
                        .await
                }
            })
            .await?;

            // No boundary means fewer than chunk-size rows remain; the range
            // maximum closes the final chunk.
            let (to_values, is_final) = match boundary_to {
                Some(to) => {
                    let at_max =
                        compare_key_tuples(&to, &range.max_values) != Ordering::Less;
                    (to, at_max)
                }
                None => (range.max_values.clone(), true),
            };

            let boundary = ChunkBoundary {
                from_values: from_values.clone(),
                to_values,
                include_from,
            };
            debug_assert!(boundary.is_ordered());

            let store = self.store.clone();
            let chunk = boundary.clone();
            let stats = retry_with_backoff(retries, "chunk copy", || {
                let store = store.clone();
                let chunk = chunk.clone();
                async move { store.copy_chunk(&chunk).await }
            })
            .await?;

            self.context.add_rows_copied(stats.rows_affected);
            counter!(MOLT_ROWS_COPIED_TOTAL).increment(stats.rows_affected);
            counter!(MOLT_CHUNKS_COPIED_TOTAL).increment(1);
            histogram!(MOLT_CHUNK_DURATION_MILLISECONDS)
                .record(stats.duration.as_secs_f64() * 1000.0);

            debug!(
                chunk = %boundary,
                rows = stats.rows_affected,
                duration_ms = stats.duration.as_millis() as u64,
                "chunk copied"
            );

            let nice_ratio = self.context.nice_ratio();
            if nice_ratio > 0.0 {
                tokio::time::sleep(stats.duration.mul_f64(nice_ratio)).await;
            }

            if is_final {
                break;
            }

            from_values = boundary.to_values;
            include_from = false;
        }

        info!(rows = self.context.rows_copied(), "row copy complete");
        self.context.mark_row_copy_complete();
        Ok(())
    }
}
