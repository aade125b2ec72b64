use std::time::Duration;

use serde::Deserialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};

use crate::instance_key::InstanceKey;

/// Connection configuration for a MySQL server.
///
/// One instance exists per role (inspected server, applier server); the
/// migration engine never shares pools across roles.
#[derive(Debug, Clone, Deserialize)]
pub struct MySqlConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Connect/read/write timeout applied to every round trip, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    MySqlConnectionConfig::DEFAULT_TIMEOUT_SECS
}

impl MySqlConnectionConfig {
    pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

    /// Returns the host:port key identifying the configured instance.
    pub fn instance_key(&self) -> InstanceKey {
        InstanceKey::new(&self.host, self.port)
    }

    /// Creates connect options targeting the configured database.
    pub fn with_db(&self) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.database);

        if let Some(password) = &self.password {
            options = options.password(password);
        }

        options
    }
}

/// Connects a pool to the configured server.
///
/// Sessions acquired from the pool keep their server-side state (locks,
/// user variables) for as long as the caller holds the connection, which the
/// cut-over protocol relies on.
pub async fn connect_pool(
    config: &MySqlConnectionConfig,
    max_connections: u32,
) -> Result<MySqlPool, sqlx::Error> {
    MySqlPoolOptions::new()
        .min_connections(1)
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(config.timeout_secs))
        .connect_with(config.with_db())
        .await
}
