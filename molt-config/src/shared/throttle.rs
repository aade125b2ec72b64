use serde::Deserialize;

use crate::shared::ValidationError;

/// Load- and lag-based throttling thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Replication lag above which both pipelines pause, in milliseconds.
    #[serde(default = "default_max_lag_millis")]
    pub max_lag_millis: i64,
    /// Additional replicas whose lag participates in the throttle decision,
    /// as `host[:port]` entries.
    #[serde(default)]
    pub control_replicas: Vec<String>,
    /// Status thresholds that throttle when exceeded, e.g.
    /// `Threads_running=80,Threads_connected=1000`.
    #[serde(default)]
    pub max_load: Option<String>,
    /// Status thresholds that abort (or throttle, see
    /// `critical_load_fatal`) when exceeded.
    #[serde(default)]
    pub critical_load: Option<String>,
    /// Re-check interval before a critical-load reading is acted on,
    /// in milliseconds. Zero acts immediately.
    #[serde(default = "default_critical_load_interval_millis")]
    pub critical_load_interval_millis: u64,
    /// When true (the default) a confirmed critical-load reading aborts the
    /// migration; when false it is coerced into a throttle.
    #[serde(default = "default_true")]
    pub critical_load_fatal: bool,
    /// Query evaluated on the inspected server; a positive scalar result
    /// throttles.
    #[serde(default)]
    pub throttle_query: Option<String>,
    /// URL probed on each tick; any non-200 response throttles.
    #[serde(default)]
    pub throttle_http: Option<String>,
    /// Ignore connection errors from the throttle-http endpoint instead of
    /// treating them as a throttle condition.
    #[serde(default)]
    pub ignore_http_errors: bool,
    /// Control loop tick interval, in milliseconds.
    #[serde(default = "default_tick_interval_millis")]
    pub tick_interval_millis: u64,
}

impl ThrottleConfig {
    pub const DEFAULT_MAX_LAG_MILLIS: i64 = 1500;
    pub const DEFAULT_CRITICAL_LOAD_INTERVAL_MILLIS: u64 = 0;
    pub const DEFAULT_TICK_INTERVAL_MILLIS: u64 = 250;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_lag_millis < 100 {
            return Err(ValidationError::invalid(
                "throttle.max_lag_millis",
                "must be at least 100",
            ));
        }
        if self.tick_interval_millis == 0 || self.tick_interval_millis >= 1000 {
            return Err(ValidationError::invalid(
                "throttle.tick_interval_millis",
                "must be within 1..1000",
            ));
        }
        Ok(())
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            max_lag_millis: default_max_lag_millis(),
            control_replicas: Vec::new(),
            max_load: None,
            critical_load: None,
            critical_load_interval_millis: default_critical_load_interval_millis(),
            critical_load_fatal: true,
            throttle_query: None,
            throttle_http: None,
            ignore_http_errors: false,
            tick_interval_millis: default_tick_interval_millis(),
        }
    }
}

fn default_max_lag_millis() -> i64 {
    ThrottleConfig::DEFAULT_MAX_LAG_MILLIS
}

fn default_critical_load_interval_millis() -> u64 {
    ThrottleConfig::DEFAULT_CRITICAL_LOAD_INTERVAL_MILLIS
}

fn default_tick_interval_millis() -> u64 {
    ThrottleConfig::DEFAULT_TICK_INTERVAL_MILLIS
}

fn default_true() -> bool {
    true
}
