use std::error::Error;

use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber.
///
/// The filter honours `RUST_LOG`, defaulting to `info` for the whole process.
/// Log lines carry the structured fields emitted at call sites; timestamps
/// and target module are printed in the compact single-line format.
pub fn init_tracing(binary_name: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()?;

    ::tracing::info!(binary = binary_name, "tracing initialized");

    Ok(())
}
