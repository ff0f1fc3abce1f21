//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: Hardcoded in struct `Default` implementations
//! 2. **Config file**: TOML file specified by `FULCRUM_HTTP_CONFIG` env var
//! 3. **Environment variables**: `FULCRUM_HTTP__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`ServerConfig`]: HTTP listener settings
//! - [`UpstreamConfig`]: Default Electrum server, pool idle window and call deadlines
//! - [`P2pConfig`]: The single P2P node used as the block source
//! - [`LoggingConfig`]: Log level and format
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind_port = 8000
//!
//! [upstream]
//! default_server = "wss://electrum.imaginary.cash:50004"
//! idle_timeout_seconds = 300
//!
//! [p2p]
//! host = "3.142.98.179"
//! port = 8333
//! network_magic = "e3e1f3e8"
//! ```

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use url::Url;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind the server to. Defaults to `0.0.0.0`.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port number to listen on. Must be greater than 0. Defaults to `8000`.
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Maximum number of in-flight HTTP requests. Defaults to `1024`.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Largest accepted request body in bytes. Defaults to 1 MiB.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    8000
}

fn default_max_concurrent_requests() -> usize {
    1024
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

/// Electrum upstream settings shared by every pooled connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Server used when a request carries no `server` header.
    #[serde(default = "default_server")]
    pub default_server: String,

    /// Client name announced in the `server.version` handshake.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Protocol version requested in the `server.version` handshake.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,

    /// Seconds without a successful call before a pooled connection is dropped.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,

    /// Deadline for opening a connection, handshake included.
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,

    /// Deadline for a single upstream call.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_server() -> String {
    "wss://electrum.imaginary.cash:50004".to_string()
}

fn default_client_name() -> String {
    "Electrum-HTTP".to_string()
}

fn default_protocol_version() -> String {
    "1.5".to_string()
}

fn default_idle_timeout_seconds() -> u64 {
    300
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

fn default_request_timeout_seconds() -> u64 {
    30
}

/// P2P node used to download full blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    /// Whether to connect to the node at all. Block requests fail fast when disabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Label used in log lines.
    #[serde(default = "default_p2p_name")]
    pub name: String,

    #[serde(default = "default_p2p_host")]
    pub host: String,

    #[serde(default = "default_p2p_port")]
    pub port: u16,

    /// Network magic as 8 hex characters, in wire order.
    #[serde(default = "default_network_magic")]
    pub network_magic: String,

    #[serde(default = "default_p2p_protocol_version")]
    pub protocol_version: u32,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Fixed delay between reconnect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_handshake_timeout_seconds")]
    pub handshake_timeout_seconds: u64,

    /// Deadline for a single block fetch, waiting for a live session included.
    #[serde(default = "default_block_timeout_seconds")]
    pub block_timeout_seconds: u64,

    /// Upper bound on a single P2P message payload.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_p2p_name() -> String {
    "p2p client peer".to_string()
}

fn default_p2p_host() -> String {
    "3.142.98.179".to_string()
}

fn default_p2p_port() -> u16 {
    8333
}

fn default_network_magic() -> String {
    "e3e1f3e8".to_string()
}

fn default_p2p_protocol_version() -> u32 {
    70012
}

fn default_user_agent() -> String {
    "/fulcrum-http/".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_handshake_timeout_seconds() -> u64 {
    10
}

fn default_block_timeout_seconds() -> u64 {
    30
}

fn default_max_message_bytes() -> usize {
    64 * 1024 * 1024
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Root application configuration containing all subsystem settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub p2p: P2pConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            max_concurrent_requests: default_max_concurrent_requests(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_server: default_server(),
            client_name: default_client_name(),
            protocol_version: default_protocol_version(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: default_p2p_name(),
            host: default_p2p_host(),
            port: default_p2p_port(),
            network_magic: default_network_magic(),
            protocol_version: default_p2p_protocol_version(),
            user_agent: default_user_agent(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            handshake_timeout_seconds: default_handshake_timeout_seconds(),
            block_timeout_seconds: default_block_timeout_seconds(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

/// URL schemes the Electrum client can connect with.
pub const SUPPORTED_SCHEMES: &[&str] = &["ws", "wss", "tcp"];

impl UpstreamConfig {
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl P2pConfig {
    /// Decodes `network_magic` into the four wire bytes.
    ///
    /// # Errors
    ///
    /// Returns an error string unless the value is exactly four hex-encoded bytes.
    pub fn magic_bytes(&self) -> Result<[u8; 4], String> {
        let bytes = hex::decode(&self.network_magic)
            .map_err(|e| format!("Invalid network magic '{}': {e}", self.network_magic))?;
        bytes
            .try_into()
            .map_err(|_| format!("Network magic must be 4 bytes: {}", self.network_magic))
    }

    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    #[must_use]
    pub fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_seconds)
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `FULCRUM_HTTP__` prefix can override any value.
    /// Use `__` as a separator for nested fields (e.g., `FULCRUM_HTTP__SERVER__BIND_PORT=9000`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let config_builder = Config::builder()
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(
                Environment::with_prefix("FULCRUM_HTTP").prefix_separator("__").separator("__"),
            )
            .build()?;

        config_builder.try_deserialize()
    }

    /// Loads configuration from `config/config.toml` with fallback to defaults.
    ///
    /// The config file path can be overridden using the `FULCRUM_HTTP_CONFIG` environment
    /// variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var("FULCRUM_HTTP_CONFIG")
            .unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Returns the parsed socket address for the HTTP server.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed into a valid [`SocketAddr`].
    ///
    /// [`SocketAddr`]: std::net::SocketAddr
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port)
            .parse()
            .map_err(|_| {
                format!(
                    "Invalid socket address: {}:{}",
                    self.server.bind_address, self.server.bind_port
                )
            })
    }

    /// Validates the configuration for correctness and consistency.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error string if validation fails.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_port == 0 {
            return Err("Bind port must be greater than 0".to_string());
        }

        if self.server.max_concurrent_requests == 0 {
            return Err("Max concurrent requests must be greater than 0".to_string());
        }

        let default_server = Url::parse(&self.upstream.default_server).map_err(|e| {
            format!("Invalid default server URL '{}': {e}", self.upstream.default_server)
        })?;
        if !SUPPORTED_SCHEMES.contains(&default_server.scheme()) {
            return Err(format!(
                "Unsupported scheme for default server: {}",
                default_server.scheme()
            ));
        }

        if self.upstream.idle_timeout_seconds == 0 {
            return Err("Idle timeout must be greater than 0".to_string());
        }

        if self.upstream.connect_timeout_seconds == 0 || self.upstream.request_timeout_seconds == 0
        {
            return Err("Upstream timeouts must be greater than 0".to_string());
        }

        if self.p2p.enabled {
            self.p2p.magic_bytes()?;

            if self.p2p.host.trim().is_empty() || self.p2p.port == 0 {
                return Err("P2P node address must have a host and a non-zero port".to_string());
            }

            if self.p2p.block_timeout_seconds == 0 || self.p2p.handshake_timeout_seconds == 0 {
                return Err("P2P timeouts must be greater than 0".to_string());
            }
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err("Logging format must be 'json' or 'pretty'".to_string());
        }

        Ok(())
    }
}
