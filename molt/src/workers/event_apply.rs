use std::sync::Arc;

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::binlog::streamer::StreamEvent;
use crate::concurrency::{ShutdownRx, ThrottleWatch};
use crate::context::MigrationContext;
use crate::error::MoltResult;
use crate::metrics::{MOLT_BINLOG_EVENTS_APPLIED_TOTAL, MOLT_DML_BATCH_SIZE};
use crate::sink::DmlSink;
use crate::workers::base::WorkerHandle;
use crate::workers::retry_with_backoff;

/// Applied changelog state values, reported to the coordinator in stream
/// order, strictly after every preceding DML entry was committed.
pub type StateAppliedTx = mpsc::Sender<String>;
pub type StateAppliedRx = mpsc::Receiver<String>;

/// Drains the streamer's ordered event channel into batched transactions
/// against the ghost table.
///
/// Batching groups up to `dml_batch_size` consecutive DML entries without
/// reordering; a changelog state event closes the open batch so its
/// rendezvous signal fires only once the ghost has caught up to the
/// corresponding binlog position.
pub struct EventApplyWorker<S> {
    context: Arc<MigrationContext>,
    sink: Arc<S>,
    events_rx: mpsc::Receiver<StreamEvent>,
    state_applied_tx: StateAppliedTx,
    throttle: ThrottleWatch,
    shutdown_rx: ShutdownRx,
}

impl<S: DmlSink + 'static> EventApplyWorker<S> {
    pub fn new(
        context: Arc<MigrationContext>,
        sink: Arc<S>,
        events_rx: mpsc::Receiver<StreamEvent>,
        state_applied_tx: StateAppliedTx,
        throttle: ThrottleWatch,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        EventApplyWorker {
            context,
            sink,
            events_rx,
            state_applied_tx,
            throttle,
            shutdown_rx,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let context = self.context.clone();
        crate::workers::spawn_supervised("event-apply", context, self.run())
    }

    async fn run(mut self) -> MoltResult<()> {
        loop {
            let mut shutdown_rx = self.shutdown_rx.clone();
            let event = tokio::select! {
                event = self.events_rx.recv() => event,
                _ = shutdown_rx.wait_for_shutdown() => {
                    self.drain_on_shutdown().await?;
                    return Ok(());
                }
            };

            let Some(event) = event else {
                info!("event channel closed, event apply complete");
                return Ok(());
            };

            self.handle_event(event).await?;
        }
    }

    async fn handle_event(&mut self, event: StreamEvent) -> MoltResult<()> {
        match event {
            StreamEvent::ChangelogState { value, coordinates } => {
                self.context.set_applied_binlog_coordinates(coordinates);
                self.signal_state_applied(value).await;
                Ok(())
            }
            StreamEvent::Dml(first) => {
                let mut batch = vec![first];
                let max = self.context.dml_batch_size().max(1) as usize;
                let mut pending_state: Option<(String, molt_mysql::BinlogCoordinates)> = None;

                // Greedily group whatever is already queued, stopping at a
                // state event so ordering with the rendezvous is preserved.
                while batch.len() < max {
                    match self.events_rx.try_recv() {
                        Ok(StreamEvent::Dml(entry)) => batch.push(entry),
                        Ok(StreamEvent::ChangelogState { value, coordinates }) => {
                            pending_state = Some((value, coordinates));
                            break;
                        }
                        Err(_) => break,
                    }
                }

                self.apply_batch(&batch).await?;

                if let Some((value, coordinates)) = pending_state {
                    self.context.set_applied_binlog_coordinates(coordinates);
                    self.signal_state_applied(value).await;
                }
                Ok(())
            }
        }
    }

    async fn apply_batch(&mut self, batch: &[crate::binlog::BinlogEntry]) -> MoltResult<()> {
        // The throttle gate is honoured between batches only, and not at
        // all inside the cut-over critical section: the drain to the lock
        // sentinel must finish regardless of lag or load.
        if !self.context.is_in_cut_over_critical_section() {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = self.throttle.wait_until_clear() => {}
                _ = shutdown_rx.wait_for_shutdown() => {}
            }
        }

        let retries = self.context.config.migration.default_retries;
        let sink = self.sink.clone();
        let entries = batch.to_vec();
        let stats = retry_with_backoff(retries, "dml batch", || {
            let sink = sink.clone();
            let entries = entries.clone();
            async move { sink.apply_dml_batch(&entries).await }
        })
        .await?;

        self.context.add_binlog_events_applied(batch.len() as u64);
        counter!(MOLT_BINLOG_EVENTS_APPLIED_TOTAL).increment(batch.len() as u64);
        gauge!(MOLT_DML_BATCH_SIZE).set(batch.len() as f64);

        debug!(
            entries = batch.len(),
            rows = stats.rows_affected,
            duration_ms = stats.duration.as_millis() as u64,
            "dml batch applied"
        );
        Ok(())
    }

    async fn signal_state_applied(&self, value: String) {
        debug!(state = %value, "changelog state applied");
        // The coordinator may not be listening (e.g. states applied during
        // normal streaming); a full or closed channel is not an error.
        let _ = self.state_applied_tx.try_send(value);
    }

    /// On shutdown the already-queued events are applied so the stream is
    /// left at a consistent position, then the worker exits.
    async fn drain_on_shutdown(&mut self) -> MoltResult<()> {
        info!("event apply draining on shutdown");
        let mut batch = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                StreamEvent::Dml(entry) => batch.push(entry),
                StreamEvent::ChangelogState { coordinates, .. } => {
                    self.context.set_applied_binlog_coordinates(coordinates);
                }
            }
        }
        if !batch.is_empty() {
            let max = self.context.dml_batch_size().max(1) as usize;
            for chunk in batch.chunks(max) {
                self.apply_batch(chunk).await?;
            }
        }
        Ok(())
    }
}
