use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::trace;

// Cache for the Prometheus handle. A Mutex rather than Once/OnceLock because
// initialization is fallible, and tests initialize repeatedly in-process.
static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = Mutex::new(None);

/// Default port the metrics endpoint listens on.
pub const DEFAULT_METRICS_PORT: u16 = 9100;

/// Installs the global metrics recorder and returns a render handle without
/// starting an HTTP listener.
///
/// Safe to call multiple times; later calls return a clone of the cached
/// handle.
pub fn init_metrics_handle() -> Result<PrometheusHandle, BuildError> {
    let mut prometheus_handle = PROMETHEUS_HANDLE.lock().unwrap();

    if let Some(handle) = &*prometheus_handle {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    *prometheus_handle = Some(handle.clone());

    let handle_clone = handle.clone();

    // Periodic upkeep bounds the recorder's memory.
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trace!("running metrics upkeep");
            handle_clone.run_upkeep();
        }
    });

    Ok(handle)
}

/// Installs the global metrics recorder with an HTTP listener on
/// `[::]:<port>/metrics` for Prometheus scraping.
pub fn init_metrics(port: Option<u16>) -> Result<(), BuildError> {
    let addr = SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        port.unwrap_or(DEFAULT_METRICS_PORT),
    );

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    Ok(())
}
