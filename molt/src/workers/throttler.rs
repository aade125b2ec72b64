use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::gauge;
use molt_mysql::{InstanceKey, MySqlConnectionConfig, connection};
use sqlx::MySqlPool;
use tracing::{info, warn};

use crate::concurrency::{ShutdownRx, ThrottleGate};
use crate::context::{MigrationContext, ThrottleReason};
use crate::error::{ErrorKind, MoltError, MoltResult};
use crate::inspector::{heartbeat_lag, show_status_variable};
use crate::metrics::{MOLT_REPLICATION_LAG_MILLISECONDS, MOLT_THROTTLED};
use crate::workers::base::WorkerHandle;

const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// The central control loop deciding pause/resume.
///
/// On every tick the checks run in precedence order: user command,
/// inspected-server lag, control-replica lag, max-load, critical-load,
/// throttle-query, throttle-http. The decision is published through the
/// throttle gate; pipelines block between units of work while a reason is
/// present.
pub struct Throttler {
    context: Arc<MigrationContext>,
    gate: ThrottleGate,
    inspector_pool: MySqlPool,
    applier_pool: MySqlPool,
    http: reqwest::Client,
    replica_pools: HashMap<InstanceKey, MySqlPool>,
    critical_first_seen: Option<(String, Instant)>,
    shutdown_rx: ShutdownRx,
}

impl Throttler {
    pub fn new(
        context: Arc<MigrationContext>,
        gate: ThrottleGate,
        inspector_pool: MySqlPool,
        applier_pool: MySqlPool,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Throttler {
            context,
            gate,
            inspector_pool,
            applier_pool,
            http: reqwest::Client::new(),
            replica_pools: HashMap::new(),
            critical_first_seen: None,
            shutdown_rx,
        }
    }

    pub fn spawn(self) -> WorkerHandle {
        let context = self.context.clone();
        crate::workers::spawn_supervised("throttler", context, self.run())
    }

    async fn run(mut self) -> MoltResult<()> {
        let tick = Duration::from_millis(self.context.config.throttle.tick_interval_millis);
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(tick_ms = tick.as_millis() as u64, "throttler started");

        loop {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.wait_for_shutdown() => {
                    // Leave the gate clear so draining pipelines can finish.
                    self.gate.publish(None);
                    info!("throttler shutting down");
                    return Ok(());
                }
            }

            let reason = self.evaluate().await;
            gauge!(MOLT_THROTTLED).set(if reason.is_some() { 1.0 } else { 0.0 });
            self.context.set_throttle_reason(reason.clone());
            self.gate.publish(reason);
        }
    }

    /// Runs the precedence-ordered checks and returns the first firing
    /// reason.
    async fn evaluate(&mut self) -> Option<ThrottleReason> {
        if self.context.is_throttle_commanded_by_user() {
            return Some(ThrottleReason::CommandedByUser);
        }

        let max_lag = Duration::from_millis(self.context.max_lag_millis().max(0) as u64);

        if let Some(lag) = self.context.heartbeat_lag() {
            gauge!(MOLT_REPLICATION_LAG_MILLISECONDS).set(lag.as_secs_f64() * 1000.0);
            if lag > max_lag {
                return Some(ThrottleReason::ReplicationLag {
                    lag_millis: lag.as_millis() as i64,
                });
            }
        }

        if let Some(reason) = self.check_control_replicas(max_lag).await {
            return Some(reason);
        }

        if let Some(reason) = self.check_max_load().await {
            return Some(reason);
        }

        if let Some(reason) = self.check_critical_load().await {
            return Some(reason);
        }

        if let Some(query) = self.context.throttle_query() {
            match sqlx::query_scalar::<_, i64>(&query)
                .fetch_one(&self.inspector_pool)
                .await
            {
                Ok(value) if value > 0 => return Some(ThrottleReason::ThrottleQuery),
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "throttle query failed; throttling");
                    return Some(ThrottleReason::ThrottleQuery);
                }
            }
        }

        if let Some(url) = self.context.throttle_http() {
            if let Some(reason) = self.check_throttle_http(&url).await {
                return Some(reason);
            }
        }

        None
    }

    async fn check_control_replicas(&mut self, max_lag: Duration) -> Option<ThrottleReason> {
        let replicas = self.context.throttle_control_replicas();
        for key in replicas.iter() {
            let pool = match self.replica_pool(key).await {
                Ok(pool) => pool,
                Err(err) => {
                    warn!(replica = %key, error = %err, "control replica unreachable; throttling");
                    return Some(ThrottleReason::ControlReplicaLag {
                        key: key.clone(),
                        lag_millis: -1,
                    });
                }
            };

            match heartbeat_lag(&pool, &self.context.database, &self.context.changelog_table)
                .await
            {
                Ok(Some(lag)) if lag > max_lag => {
                    return Some(ThrottleReason::ControlReplicaLag {
                        key: key.clone(),
                        lag_millis: lag.as_millis() as i64,
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(replica = %key, error = %err, "control replica lag check failed; throttling");
                    return Some(ThrottleReason::ControlReplicaLag {
                        key: key.clone(),
                        lag_millis: -1,
                    });
                }
            }
        }
        None
    }

    /// Pools to control replicas are created lazily and cached; replicas
    /// share the inspector's credentials.
    async fn replica_pool(&mut self, key: &InstanceKey) -> MoltResult<MySqlPool> {
        if let Some(pool) = self.replica_pools.get(key) {
            return Ok(pool.clone());
        }

        let config = MySqlConnectionConfig {
            host: key.hostname.clone(),
            port: key.port,
            ..self.context.config.inspector.clone()
        };
        let pool = connection::connect_pool(&config, 1).await?;
        self.replica_pools.insert(key.clone(), pool.clone());
        Ok(pool)
    }

    async fn check_max_load(&self) -> Option<ThrottleReason> {
        let max_load = self.context.max_load();
        for (metric, threshold) in max_load.iter() {
            match show_status_variable(&self.applier_pool, metric).await {
                Ok(Some(value)) if value >= threshold => {
                    return Some(ThrottleReason::MaxLoad {
                        metric: metric.to_string(),
                        value,
                        threshold,
                    });
                }
                Ok(_) => {}
                Err(err) => warn!(metric, error = %err, "max-load check failed"),
            }
        }
        None
    }

    /// Critical load aborts the migration once confirmed. A non-zero
    /// confirmation interval re-checks one interval later before acting;
    /// `critical_load_fatal = false` downgrades the abort to a throttle.
    async fn check_critical_load(&mut self) -> Option<ThrottleReason> {
        let critical_load = self.context.critical_load();
        let config = &self.context.config.throttle;

        let mut exceeded: Option<(String, i64, i64)> = None;
        for (metric, threshold) in critical_load.iter() {
            match show_status_variable(&self.applier_pool, metric).await {
                Ok(Some(value)) if value >= threshold => {
                    exceeded = Some((metric.to_string(), value, threshold));
                    break;
                }
                Ok(_) => {}
                Err(err) => warn!(metric, error = %err, "critical-load check failed"),
            }
        }

        let Some((metric, value, threshold)) = exceeded else {
            self.critical_first_seen = None;
            return None;
        };

        let confirmation = Duration::from_millis(config.critical_load_interval_millis);
        let confirmed = if confirmation.is_zero() {
            true
        } else {
            match &self.critical_first_seen {
                Some((seen_metric, seen_at)) if *seen_metric == metric => {
                    seen_at.elapsed() >= confirmation
                }
                _ => {
                    info!(
                        metric = %metric,
                        value,
                        threshold,
                        recheck_ms = confirmation.as_millis() as u64,
                        "critical load observed, re-checking before acting"
                    );
                    self.critical_first_seen = Some((metric.clone(), Instant::now()));
                    false
                }
            }
        };

        if confirmed && config.critical_load_fatal {
            self.context
                .panic_abort(MoltError::new(ErrorKind::CriticalLoadExceeded {
                    metric: metric.clone(),
                    value,
                    threshold,
                }));
        }

        Some(ThrottleReason::CriticalLoad {
            metric,
            value,
            threshold,
        })
    }

    async fn check_throttle_http(&self, url: &str) -> Option<ThrottleReason> {
        let response = self
            .http
            .get(url)
            .timeout(HTTP_PROBE_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) if response.status().as_u16() == 200 => None,
            Ok(response) => Some(ThrottleReason::ThrottleHttp {
                status: response.status().as_u16(),
            }),
            Err(err) => {
                if self.context.config.throttle.ignore_http_errors {
                    warn!(error = %err, "throttle-http probe failed, ignored by configuration");
                    None
                } else {
                    Some(ThrottleReason::ThrottleHttp { status: 0 })
                }
            }
        }
    }
}
