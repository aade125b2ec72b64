use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use molt_config::shared::CutOverKind;
use molt_mysql::connection;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::applier::Applier;
use crate::binlog::reader::BinlogReader;
use crate::binlog::streamer::BinlogStreamer;
use crate::bail;
use crate::concurrency::{ShutdownTx, create_shutdown_channel, create_throttle_gate};
use crate::context::MigrationContext;
use crate::error::{ErrorKind, MoltError, MoltResult};
use crate::hooks::execute_on_failure_hook;
use crate::inspector::{Inspector, validate_connection};
use crate::metrics::{MOLT_CUT_OVER_ATTEMPTS_TOTAL, register_metrics};
use crate::schema::ColumnMapping;
use crate::sql::parser::parse_alter_statement;
use crate::workers::base::WorkerHandle;
use crate::workers::event_apply::{EventApplyWorker, StateAppliedRx};
use crate::workers::row_copy::RowCopyWorker;
use crate::workers::spawn_supervised;
use crate::workers::throttler::Throttler;
use crate::workers::watchdog::{WatchedServer, Watchdog};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);
const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const POSTPONE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RENAME_BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CUT_OVER_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// The cut-over state machine's observable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutOverStep {
    Idle,
    Postponing,
    RequestingLock,
    LockAcquired,
    DrainEvents,
    Rename,
    Committed,
    Aborted,
}

/// Drives the migration as a linear sequence of phases with a reversible
/// abort path.
///
/// Phase order: initialize, validate, read streamer coordinates, create
/// ghost, create changelog, apply the ALTER on the ghost, choose the unique
/// key, start the streamer, start row copy and event apply in parallel,
/// wait for row copy, postpone if configured, cut over, clean up.
pub struct Migrator<R> {
    context: Arc<MigrationContext>,
    reader: Option<R>,
}

struct RunningWorkers {
    applier: Arc<Applier>,
    shutdown_tx: ShutdownTx,
    state_applied_rx: StateAppliedRx,
    handles: Vec<WorkerHandle>,
}

impl<R: BinlogReader + 'static> Migrator<R> {
    pub fn new(context: Arc<MigrationContext>, reader: R) -> Self {
        register_metrics();
        Migrator {
            context,
            reader: Some(reader),
        }
    }

    /// Runs the full migration. On failure the on-failure hook runs and the
    /// first classified error is returned.
    pub async fn migrate(self) -> MoltResult<()> {
        let context = self.context.clone();
        let result = self.migrate_inner().await;

        if let Err(err) = &result {
            error!(error = %err, "migration failed");
            execute_on_failure_hook(&context, &err.to_string()).await;
        }
        result
    }

    async fn migrate_inner(mut self) -> MoltResult<()> {
        let context = self.context.clone();
        info!(
            database = %context.database,
            table = %context.original_table,
            alter = %context.config.migration.alter,
            "starting migration"
        );

        // initialize: connections, identity snapshots, pre-flight checks.
        let inspector_pool = connection::connect_pool(&context.config.inspector, 4)
            .await
            .map_err(connect_error(&context.config.inspector))?;
        let applier_config = context.config.applier_connection().clone();
        let applier_pool = connection::connect_pool(&applier_config, 8)
            .await
            .map_err(connect_error(&applier_config))?;

        let inspector = Arc::new(Inspector::new(context.clone(), inspector_pool.clone()));
        inspector.init().await?;

        let applier = Arc::new(Applier::new(context.clone(), applier_pool.clone()));
        applier.init().await?;
        if let Some(info) = applier.server_info() {
            let migration = &context.config.migration;
            let allow_null_port =
                migration.aliyun_rds || migration.azure_mysql || migration.gcp_mysql;
            validate_connection(&info, applier_config.port, allow_null_port, "applier")?;
        }

        // validate: the ALTER text and the original table.
        let alter = parse_alter_statement(&context.config.migration.alter);
        if alter.renames_table {
            bail!(
                ErrorKind::ConfigurationError {
                    parameter: "migration.alter".to_string(),
                    reason: "RENAME TO is not supported; the engine owns the table names"
                        .to_string(),
                },
                "alter attempts a table rename"
            );
        }
        let renames = if alter.renames.is_empty() {
            Default::default()
        } else if context.config.migration.approve_renamed_columns {
            info!(renames = ?alter.renames, "applying approved column renames");
            alter.renames.clone()
        } else {
            warn!(
                renames = ?alter.renames,
                "alter renames columns but renames are not approved; treating them as drop+add"
            );
            Default::default()
        };

        let (original_columns, unique_keys, rows_estimate) =
            inspector.inspect_original_table().await?;
        context.set_original_columns(original_columns.clone());
        context.set_rows_estimate(rows_estimate);

        // The streamer must start from coordinates that precede every write
        // the ghost will miss, so read them before any setup DDL.
        let start_coordinates =
            molt_mysql::lag::current_binlog_coordinates(inspector.pool())
                .await
                .map_err(|err| {
                    MoltError::with_source(ErrorKind::BinlogStreamFailed, err)
                })?;
        info!(coordinates = %start_coordinates, "streamer will start here");

        // create-ghost, create-changelog, apply-alter-on-ghost.
        applier.create_changelog_table().await?;
        applier.create_ghost_table().await?;
        applier.alter_ghost_table().await?;

        // choose-unique-key and column mapping.
        let ghost_columns = inspector.inspect_ghost_columns().await?;
        let unique_key = inspector.choose_unique_key(&unique_keys, &ghost_columns, &renames)?;
        info!(unique_key = %unique_key, "chosen row-copy iteration key");
        context.set_unique_key(unique_key);

        let mapping = ColumnMapping::derive(&original_columns, &ghost_columns, &renames);
        for dropped in mapping.dropped() {
            warn!(column = %dropped, "column exists on original but not on ghost; its data will not migrate");
        }
        context.set_column_mapping(mapping);

        if context.config.migration.exact_rowcount {
            inspector.spawn_exact_row_count();
        }

        // start-streamer, start-row-copy, start-event-applier, throttler,
        // watchdog, heartbeat.
        let workers =
            self.start_workers(applier.clone(), inspector_pool, applier_pool, start_coordinates)?;

        let mut abort_rx = context
            .take_abort_receiver()
            .ok_or_else(|| MoltError::other("abort receiver already taken"))?;

        let outcome = self
            .drive_migration(&context, workers, &mut abort_rx)
            .await;

        match outcome {
            Ok(()) => {
                info!(
                    rows = context.rows_copied(),
                    events = context.binlog_events_applied(),
                    elapsed_secs = context.elapsed().as_secs(),
                    "migration complete"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn start_workers(
        &mut self,
        applier: Arc<Applier>,
        inspector_pool: sqlx::MySqlPool,
        applier_pool: sqlx::MySqlPool,
        start_coordinates: molt_mysql::BinlogCoordinates,
    ) -> MoltResult<RunningWorkers> {
        let context = self.context.clone();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let (gate, throttle_watch) = create_throttle_gate();

        let (events_tx, events_rx) =
            mpsc::channel(context.config.migration.event_queue_capacity.max(1));
        let (state_applied_tx, state_applied_rx) = mpsc::channel(16);

        let mut handles = Vec::new();

        // The reader is moved into the streamer; `self` only carried it
        // until now.
        let reader = self
            .reader
            .take()
            .ok_or_else(|| MoltError::other("binlog reader already moved into the streamer"))?;
        let streamer = BinlogStreamer::new(
            context.clone(),
            reader,
            events_tx,
            shutdown_rx.clone(),
        );
        handles.push(spawn_supervised(
            "binlog-streamer",
            context.clone(),
            streamer.run(start_coordinates),
        ));

        handles.push(
            EventApplyWorker::new(
                context.clone(),
                applier.clone(),
                events_rx,
                state_applied_tx,
                throttle_watch.clone(),
                shutdown_rx.clone(),
            )
            .spawn(),
        );

        handles.push(
            RowCopyWorker::new(
                context.clone(),
                applier.clone(),
                throttle_watch.clone(),
                shutdown_rx.clone(),
            )
            .spawn(),
        );

        handles.push(
            Throttler::new(
                context.clone(),
                gate,
                inspector_pool.clone(),
                applier_pool.clone(),
                shutdown_rx.clone(),
            )
            .spawn(),
        );

        let watched = vec![
            WatchedServer {
                role: "inspector",
                pool: inspector_pool,
                snapshot: context.inspector_server_info().unwrap_or_default(),
            },
            WatchedServer {
                role: "applier",
                pool: applier_pool,
                snapshot: context.applier_server_info().unwrap_or_default(),
            },
        ];
        handles.push(Watchdog::new(context.clone(), watched, shutdown_rx.clone()).spawn());

        // Heartbeat writer: sub-second changelog upserts whose round trip
        // through the binlog measures replication lag.
        let heartbeat_applier = applier.clone();
        let heartbeat_context = context.clone();
        let mut heartbeat_shutdown = shutdown_rx.clone();
        let heartbeat_interval =
            Duration::from_millis(context.config.migration.heartbeat_interval_ms.max(10));
        handles.push(spawn_supervised(
            "heartbeat",
            context.clone(),
            async move {
                let mut interval = tokio::time::interval(heartbeat_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                let retries = heartbeat_context.config.migration.default_retries;
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = heartbeat_shutdown.wait_for_shutdown() => return Ok(()),
                    }
                    let applier = heartbeat_applier.clone();
                    crate::workers::retry_with_backoff(retries, "heartbeat", || {
                        let applier = applier.clone();
                        async move { applier.write_heartbeat().await }
                    })
                    .await?;
                }
            },
        ));

        Ok(RunningWorkers {
            applier,
            shutdown_tx,
            state_applied_rx,
            handles,
        })
    }

    async fn drive_migration(
        &self,
        context: &Arc<MigrationContext>,
        mut workers: RunningWorkers,
        abort_rx: &mut mpsc::Receiver<MoltError>,
    ) -> MoltResult<()> {
        let result = self
            .wait_and_cut_over(context, &mut workers, abort_rx)
            .await;

        // Teardown: stop new units of work, let in-flight transactions end.
        workers.shutdown_tx.shutdown();
        for handle in workers.handles.drain(..) {
            let name = handle.name();
            match tokio::time::timeout(Duration::from_secs(10), handle.wait()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(worker = name, error = %err, "worker exited with error"),
                Err(_) => warn!(worker = name, "worker did not stop in time"),
            }
        }

        match &result {
            Ok(()) => {
                // cleanup: the changelog is transient to this migration; the
                // renamed-away original is left for the operator to drop.
                if let Err(err) = workers.applier.drop_auxiliary_tables(false).await {
                    warn!(error = %err, "failed to drop changelog table during cleanup");
                }
            }
            Err(err) if err.is_user_panic() => {
                info!("user panic: ghost and changelog tables left behind deliberately");
            }
            Err(_) => {
                if context.config.migration.drop_tables_on_abort {
                    if let Err(drop_err) = workers.applier.drop_auxiliary_tables(true).await {
                        warn!(error = %drop_err, "failed to drop tables during abort cleanup");
                    }
                } else {
                    info!(
                        ghost = %context.ghost_table,
                        changelog = %context.changelog_table,
                        "tables left behind for inspection"
                    );
                }
            }
        }

        result
    }

    async fn wait_and_cut_over(
        &self,
        context: &Arc<MigrationContext>,
        workers: &mut RunningWorkers,
        abort_rx: &mut mpsc::Receiver<MoltError>,
    ) -> MoltResult<()> {
        // wait-for-row-copy-complete, with periodic status output.
        let mut status_interval = tokio::time::interval(STATUS_INTERVAL);
        loop {
            tokio::select! {
                Some(err) = abort_rx.recv() => return Err(err),
                _ = status_interval.tick() => {
                    info!("{}", render_status(context));
                }
                _ = tokio::time::sleep(PROGRESS_POLL_INTERVAL) => {
                    if context.is_row_copy_complete() {
                        break;
                    }
                }
            }
        }
        info!("{}", render_status(context));

        // postpone-if-configured.
        self.wait_for_cut_over_green_light(context, abort_rx).await?;

        // cut-over.
        self.cut_over(context, workers, abort_rx).await
    }

    async fn wait_for_cut_over_green_light(
        &self,
        context: &Arc<MigrationContext>,
        abort_rx: &mut mpsc::Receiver<MoltError>,
    ) -> MoltResult<()> {
        loop {
            if context.is_user_commanded_unpostpone() {
                info!("cut-over unpostponed by user");
                break;
            }

            let flag_file_present = context
                .config
                .cut_over
                .postpone_flag_file
                .as_deref()
                .map(|path| Path::new(path).exists())
                .unwrap_or(false);
            let postpone = context.config.cut_over.postpone || flag_file_present;

            if !postpone {
                break;
            }

            if !context.is_postponing_cut_over() {
                info!("postponing cut-over as configured");
                context.set_postponing_cut_over(true);
            }

            tokio::select! {
                Some(err) = abort_rx.recv() => return Err(err),
                _ = tokio::time::sleep(POSTPONE_POLL_INTERVAL) => {}
            }
        }

        context.set_postponing_cut_over(false);
        Ok(())
    }

    /// The cut-over state machine: each attempt runs
    /// requesting-lock -> lock-acquired -> drain-events -> rename; any
    /// timeout aborts the whole attempt, which is retried with backoff up to
    /// the configured budget.
    async fn cut_over(
        &self,
        context: &Arc<MigrationContext>,
        workers: &mut RunningWorkers,
        abort_rx: &mut mpsc::Receiver<MoltError>,
    ) -> MoltResult<()> {
        let max_retries = context.config.cut_over.max_retries;

        loop {
            let attempt = context.add_cut_over_attempt();
            if attempt > max_retries {
                return Err(MoltError::new(ErrorKind::CutOverRetriesExceeded {
                    attempts: attempt - 1,
                }));
            }
            counter!(MOLT_CUT_OVER_ATTEMPTS_TOTAL).increment(1);
            info!(attempt, max_retries, "cut-over attempt");

            context.set_in_cut_over_critical_section(true);
            let result = tokio::select! {
                result = self.attempt_cut_over(context, workers) => result,
                Some(err) = abort_rx.recv() => Err(err),
            };
            context.set_in_cut_over_critical_section(false);

            match result {
                Ok(()) => {
                    info!(attempt, "cut-over committed");
                    return Ok(());
                }
                Err(err) if matches!(
                    err.recovery_strategy(),
                    crate::error::RecoveryStrategy::RetryUnit
                ) =>
                {
                    warn!(attempt, error = %err, "cut-over attempt aborted, retrying");
                    workers.applier.cut_over_abort().await;
                    tokio::time::sleep(CUT_OVER_RETRY_BACKOFF * attempt).await;
                }
                Err(err) => {
                    workers.applier.cut_over_abort().await;
                    return Err(err);
                }
            }
        }
    }

    async fn attempt_cut_over(
        &self,
        context: &Arc<MigrationContext>,
        workers: &mut RunningWorkers,
    ) -> MoltResult<()> {
        let applier = workers.applier.clone();
        let lock_timeout = Duration::from_secs(context.config.cut_over.lock_timeout_secs);
        let mut step = CutOverStep::RequestingLock;
        debug!(?step, "cut-over");

        // Session one takes the write locks; from here no client can write
        // the original table.
        applier.cut_over_lock_tables().await?;
        step = CutOverStep::LockAcquired;
        debug!(?step, "cut-over");

        // The sentinel write is the last possible event on the changelog
        // before the locks were taken... strictly speaking it is written
        // after them, which is exactly the point: once the event applier
        // reports it applied, every DML event preceding the lock has been
        // committed to the ghost.
        let token = format!(
            "AllEventsUpToLockProcessed:{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        applier.write_changelog_state(&token).await?;
        step = CutOverStep::DrainEvents;
        debug!(?step, token = %token, "cut-over");

        self.wait_for_state_applied(workers, &token, lock_timeout)
            .await?;

        step = CutOverStep::Rename;
        debug!(?step, "cut-over");

        match context.config.cut_over.kind {
            CutOverKind::Atomic => {
                // Session two queues the rename behind the locks; session
                // three confirms it is visibly blocked before the locks are
                // released, so the swap executes ahead of any client DML.
                applier.cut_over_start_rename().await?;

                let blocked_deadline = tokio::time::Instant::now() + lock_timeout;
                loop {
                    if applier.cut_over_rename_is_blocked().await? {
                        break;
                    }
                    if tokio::time::Instant::now() >= blocked_deadline {
                        return Err(MoltError::timeout(
                            "waiting for rename to queue behind lock",
                            lock_timeout.as_millis() as u64,
                        ));
                    }
                    tokio::time::sleep(RENAME_BLOCKED_POLL_INTERVAL).await;
                }

                applier.cut_over_unlock().await?;
                applier.cut_over_await_rename(lock_timeout).await?;
            }
            CutOverKind::TwoStep => {
                // Simple variant: release the locks and rename immediately
                // after. Clients see a brief window with no table under the
                // original name.
                applier.cut_over_unlock().await?;
                applier.swap_tables_now().await?;
            }
        }

        applier.cut_over_verify().await?;
        debug!(step = ?CutOverStep::Committed, "cut-over");
        Ok(())
    }

    async fn wait_for_state_applied(
        &self,
        workers: &mut RunningWorkers,
        token: &str,
        timeout: Duration,
    ) -> MoltResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_default();
            if remaining.is_zero() {
                return Err(MoltError::timeout(
                    "waiting for lock sentinel to be applied",
                    timeout.as_millis() as u64,
                ));
            }

            match tokio::time::timeout(remaining, workers.state_applied_rx.recv()).await {
                Ok(Some(value)) if value == token => return Ok(()),
                // States from earlier attempts drain through harmlessly.
                Ok(Some(stale)) => debug!(state = %stale, "skipping stale changelog state"),
                Ok(None) => {
                    return Err(MoltError::channel_closed("state applied"));
                }
                Err(_) => {
                    return Err(MoltError::timeout(
                        "waiting for lock sentinel to be applied",
                        timeout.as_millis() as u64,
                    ));
                }
            }
        }
    }
}

fn connect_error(
    config: &molt_mysql::MySqlConnectionConfig,
) -> impl FnOnce(sqlx::Error) -> MoltError + '_ {
    move |err| {
        MoltError::with_source(
            ErrorKind::ConnectionFailed {
                host: config.host.clone(),
                port: config.port,
            },
            err,
        )
    }
}

/// Renders the one-line progress status used by the log ticker and the
/// interactive `status` command.
pub fn render_status(context: &MigrationContext) -> String {
    let copied = context.rows_copied();
    let estimate = context.rows_estimate();
    let backlog = context
        .binlog_events_read()
        .saturating_sub(context.binlog_events_applied());

    let state = if let Some(reason) = context.throttle_reason() {
        format!("throttled ({reason})")
    } else if context.is_postponing_cut_over() {
        "postponing cut-over".to_string()
    } else if context.is_row_copy_complete() {
        "copy complete".to_string()
    } else {
        "migrating".to_string()
    };

    let eta = estimate_eta(context.elapsed(), copied, estimate);
    let coordinates = context
        .recent_binlog_coordinates()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "N/A".to_string());
    let lag = context
        .heartbeat_lag()
        .map(|lag| format!("{:.3}s", lag.as_secs_f64()))
        .unwrap_or_else(|| "N/A".to_string());

    format!(
        "Copy: {copied}/{estimate} {:.1}%; Applied: {}; Backlog: {backlog}; \
         Time: {}s(total); streamer: {coordinates}; Lag: {lag}; State: {state}; ETA: {eta}",
        context.progress_pct(),
        context.binlog_events_applied(),
        context.elapsed().as_secs(),
    )
}

fn estimate_eta(elapsed: Duration, copied: u64, estimate: u64) -> String {
    if copied == 0 || estimate == 0 {
        return "N/A".to_string();
    }
    if copied >= estimate {
        return "due".to_string();
    }
    let per_row = elapsed.as_secs_f64() / copied as f64;
    let remaining = (estimate - copied) as f64 * per_row;
    let remaining = remaining as u64;
    format!("{}m{}s", remaining / 60, remaining % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eta_handles_edge_cases() {
        assert_eq!(estimate_eta(Duration::from_secs(10), 0, 100), "N/A");
        assert_eq!(estimate_eta(Duration::from_secs(10), 100, 100), "due");
        assert_eq!(estimate_eta(Duration::from_secs(10), 120, 100), "due");
    }

    #[test]
    fn eta_is_proportional() {
        // 100s elapsed for half the rows: another 100s to go.
        let eta = estimate_eta(Duration::from_secs(100), 500, 1000);
        assert_eq!(eta, "1m40s");
    }
}
