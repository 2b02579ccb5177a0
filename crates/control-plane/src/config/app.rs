//! Application configuration for the NoETL Control Plane server.

use serde::Deserialize;

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `NOETL_`:
/// - `NOETL_HOST`: Server bind address (default: "0.0.0.0")
/// - `NOETL_PORT`: Server port (default: 8082)
/// - `NOETL_DEBUG`: Enable debug mode (default: false)
/// - `NOETL_SERVER_NAME`: Server name for identification
/// - `NOETL_NODE_ID`: Snowflake node id, 0..=1023 (default: 0)
/// - `NOETL_QUEUE_REAP_INTERVAL`: Seconds between reaper sweeps (default: 30)
/// - `NOETL_KEYCHAIN_SWEEP_INTERVAL`: Seconds between keychain expiry sweeps (default: 60)
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Snowflake node id (10 bits)
    #[serde(default)]
    pub node_id: u16,

    /// Default worker lease duration in seconds
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,

    /// Seconds between queue reaper sweeps
    #[serde(default = "default_reap_interval")]
    pub queue_reap_interval: u64,

    /// Seconds between keychain expiry/renewal sweeps
    #[serde(default = "default_keychain_sweep_interval")]
    pub keychain_sweep_interval: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_server_name() -> String {
    "noetl-control-plane".to_string()
}

fn default_lease_seconds() -> i64 {
    60
}

fn default_reap_interval() -> u64 {
    30
}

fn default_keychain_sweep_interval() -> u64 {
    60
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `NOETL_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("NOETL_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            server_name: default_server_name(),
            node_id: 0,
            lease_seconds: default_lease_seconds(),
            queue_reap_interval: default_reap_interval(),
            keychain_sweep_interval: default_keychain_sweep_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8082);
        assert_eq!(config.lease_seconds, 60);
        assert_eq!(config.queue_reap_interval, 30);
        assert!(!config.debug);
    }

    #[test]
    fn test_bind_address() {
        let config = AppConfig::default();
        assert_eq!(config.bind_address(), "0.0.0.0:8082");
    }
}
