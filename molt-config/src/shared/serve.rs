use serde::Deserialize;

/// Interactive command server endpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServeConfig {
    /// Path of the UNIX socket to listen on. Disabled when absent.
    #[serde(default)]
    pub socket_file: Option<String>,
    /// TCP port to listen on. Disabled when absent.
    #[serde(default)]
    pub tcp_port: Option<u16>,
    /// Remove a stale socket file before binding.
    #[serde(default)]
    pub drop_stale_socket: bool,
}

impl ServeConfig {
    pub fn is_enabled(&self) -> bool {
        self.socket_file.is_some() || self.tcp_port.is_some()
    }
}
