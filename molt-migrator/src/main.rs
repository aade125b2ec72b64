//! Online schema migration service binary.
//!
//! Loads configuration, initializes telemetry, and runs one migration to
//! completion. Exit code 0 means the cut-over committed; anything else is a
//! classified failure.

use std::process::ExitCode;
use std::sync::Arc;

use molt::context::MigrationContext;
use molt::migrator::Migrator;
use molt::server::Server;
use molt_config::load_config;
use molt_config::shared::MigratorConfig;
use tracing::info;

use crate::error::{MigratorError, MigratorResult};
use crate::reader::MySqlBinlogReader;

mod error;
mod reader;

/// Replication server ids must be unique per replica; this offset keeps the
/// migrator clear of typical hand-assigned ranges.
const SERVER_ID_BASE: u32 = 99_000;

fn main() -> ExitCode {
    let result = run();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Tracing may not be initialized yet when config loading fails.
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> MigratorResult<()> {
    let config: MigratorConfig = load_config().map_err(MigratorError::config)?;
    config.validate().map_err(MigratorError::config)?;

    molt_telemetry::tracing::init_tracing(env!("CARGO_BIN_NAME"))
        .map_err(MigratorError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: MigratorConfig) -> MigratorResult<()> {
    molt_telemetry::metrics::init_metrics(None).map_err(MigratorError::config)?;

    let reader_config = config.inspector.clone();
    let server_id = SERVER_ID_BASE + (std::process::id() % 1000);

    let context = Arc::new(MigrationContext::new(config)?);
    info!(
        database = %context.database,
        table = %context.original_table,
        "migrator starting"
    );

    // The interactive command server lives for the whole run; its shutdown
    // is tied to process exit rather than migration teardown so operators
    // can query a failing migration to the end.
    let (shutdown_tx, shutdown_rx) = molt::concurrency::create_shutdown_channel();
    let server_handles = Server::new(
        context.clone(),
        env!("CARGO_PKG_VERSION"),
        shutdown_rx,
    )
    .spawn()?;

    let reader = MySqlBinlogReader::new(reader_config, server_id);
    let result = Migrator::new(context, reader).migrate().await;

    shutdown_tx.shutdown();
    for handle in server_handles {
        let _ = handle.wait().await;
    }

    result.map_err(MigratorError::from)
}
