use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use crate::context::MigrationContext;

/// Runs the configured on-failure hook, exporting migration facts through
/// the environment the way external tooling expects them.
///
/// Hook failures are logged, never propagated: the migration is already
/// failing and the hook is advisory.
pub async fn execute_on_failure_hook(context: &MigrationContext, error_message: &str) {
    let Some(hook) = &context.config.migration.on_failure_hook else {
        return;
    };

    info!(hook = %hook, "executing on-failure hook");

    let result = Command::new(hook)
        .env("MOLT_DATABASE_NAME", &context.database)
        .env("MOLT_TABLE_NAME", &context.original_table)
        .env("MOLT_GHOST_TABLE_NAME", &context.ghost_table)
        .env("MOLT_OLD_TABLE_NAME", &context.old_table)
        .env("MOLT_ELAPSED_SECONDS", context.elapsed().as_secs().to_string())
        .env("MOLT_ROWS_COPIED", context.rows_copied().to_string())
        .env("MOLT_FAILURE_MESSAGE", error_message)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(hook = %hook, %status, "on-failure hook exited non-zero"),
        Err(err) => warn!(hook = %hook, error = %err, "on-failure hook failed to run"),
    }
}
