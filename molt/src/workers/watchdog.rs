use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use molt_mysql::ServerInfo;
use sqlx::MySqlPool;
use tracing::{error, info, warn};

use crate::concurrency::ShutdownRx;
use crate::context::MigrationContext;
use crate::error::{ErrorKind, MoltError, MoltResult};
use crate::workers::base::WorkerHandle;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(15);
const MAX_TEMP_DNS_FAILURES: i64 = 25;

/// How a failed identity re-check should be handled.
#[derive(Debug, PartialEq, Eq)]
enum CheckFailure {
    /// Transient resolver hiccup; tolerated up to a streak limit.
    TemporaryDns,
    /// The host is authoritatively gone.
    HostGone,
    /// Network-level blip; some other component will notice if it persists.
    TransientNetwork,
    /// Anything else is an unexpected check failure.
    Other,
}

fn classify_check_failure(message: &str) -> CheckFailure {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no such host") || lower.contains("name or service not known") {
        return CheckFailure::HostGone;
    }
    if lower.contains("failed to lookup address") || lower.contains("dns") {
        return CheckFailure::TemporaryDns;
    }
    if lower.contains("connection") || lower.contains("timed out") || lower.contains("broken pipe")
    {
        return CheckFailure::TransientNetwork;
    }
    CheckFailure::Other
}

/// A server under identity watch.
pub struct WatchedServer {
    pub role: &'static str,
    pub pool: MySqlPool,
    pub snapshot: ServerInfo,
}

/// Periodically verifies that the inspected and applier servers are still
/// the servers the migration started against.
///
/// Any divergence from the startup snapshot (version, ports, binlog
/// configuration, sql_mode, time zone) aborts the migration: a silently
/// swapped server invalidates every assumption the copy and replay streams
/// rest on.
pub struct Watchdog {
    context: Arc<MigrationContext>,
    servers: Vec<WatchedServer>,
    dns_failures: HashMap<&'static str, i64>,
    shutdown_rx: ShutdownRx,
}

impl Watchdog {
    pub fn new(
        context: Arc<MigrationContext>,
        servers: Vec<WatchedServer>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Watchdog {
            context,
            servers,
            dns_failures: HashMap::new(),
            shutdown_rx,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        WorkerHandle::spawn("watchdog", self.run())
    }

    async fn run(mut self) -> MoltResult<()> {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would re-check the snapshot we just took.
        interval.tick().await;

        info!(
            interval_secs = WATCHDOG_INTERVAL.as_secs(),
            servers = self.servers.len(),
            "watchdog started"
        );

        loop {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.wait_for_shutdown() => {
                    info!("watchdog shutting down");
                    return Ok(());
                }
            }

            for i in 0..self.servers.len() {
                if let Err(err) = self.check_server(i).await {
                    error!(error = %err, "watchdog detected fatal condition");
                    self.context.panic_abort(err);
                    return Ok(());
                }
            }
        }
    }

    async fn check_server(&mut self, index: usize) -> MoltResult<()> {
        let (role, current) = {
            let server = &self.servers[index];
            (server.role, ServerInfo::load(&server.pool).await)
        };

        match current {
            Ok(current) => {
                let server = &self.servers[index];
                if !server.snapshot.equals(&current) {
                    return Err(MoltError::new(ErrorKind::UnexpectedServerChange {
                        role: role.to_string(),
                        change: format!("{} -> {}", server.snapshot, current),
                    }));
                }
                self.dns_failures.insert(role, 0);
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                match classify_check_failure(&message) {
                    CheckFailure::HostGone => {
                        Err(MoltError::new(ErrorKind::UnexpectedServerChange {
                            role: role.to_string(),
                            change: format!("host gone: {message}"),
                        }))
                    }
                    CheckFailure::TemporaryDns => {
                        let failures = self.dns_failures.entry(role).or_insert(0);
                        *failures += 1;
                        if *failures > MAX_TEMP_DNS_FAILURES {
                            return Err(MoltError::new(ErrorKind::DnsFailuresExceeded {
                                role: role.to_string(),
                                failures: *failures,
                            }));
                        }
                        warn!(role, failures = *failures, "watchdog ignoring temporary DNS failure");
                        Ok(())
                    }
                    CheckFailure::TransientNetwork => {
                        warn!(role, error = %message, "watchdog ignoring possibly-transient network error");
                        Ok(())
                    }
                    CheckFailure::Other => {
                        Err(MoltError::new(ErrorKind::UnexpectedServerChange {
                            role: role.to_string(),
                            change: format!("check failed: {message}"),
                        }))
                    }
                }
            }
        }
    }
}
