//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - built-in defaults
//! - `halley.toml`, `/etc/halley/halley.toml`, `~/.config/halley/halley.toml`
//! - environment variables (`HALLEY__PORT`, `HALLEY__ENGINE__MAX_QUEUE_SIZE`, ...)

use anyhow::{Context, Result};
use halley_core::{EngineConfig, TransportKind};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Config files probed by [`Config::load`], lowest priority first.
const CONFIG_PATHS: [&str; 3] = [
    "~/.config/halley/halley.toml",
    "/etc/halley/halley.toml",
    "halley.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Protocol extensions offered to clients.
    #[serde(default)]
    pub extensions: ExtensionsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable the HTTP long-polling transport.
    #[serde(default = "default_true")]
    pub long_polling: bool,

    /// Path for long-polling POSTs.
    #[serde(default = "default_long_polling_path")]
    pub long_polling_path: String,

    /// Enable the WebSocket transport.
    #[serde(default = "default_true")]
    pub websocket: bool,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum request body or WebSocket frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Protocol extension configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    /// Offer acknowledged delivery (`ext.ack`).
    #[serde(default = "default_true")]
    pub ack: bool,

    /// Messages held per session awaiting acknowledgement.
    #[serde(default = "default_ack_queue_size")]
    pub ack_queue_size: usize,

    /// Answer clock synchronisation samples (`ext.timesync`).
    #[serde(default = "default_true")]
    pub timesync: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_long_polling_path() -> String {
    "/cometd".to_string()
}

fn default_ws_path() -> String {
    "/cometd/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_ack_queue_size() -> usize {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            engine: EngineConfig::default(),
            metrics: MetricsConfig::default(),
            extensions: ExtensionsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            long_polling: true,
            long_polling_path: default_long_polling_path(),
            websocket: true,
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            ack: true,
            ack_queue_size: default_ack_queue_size(),
            timesync: true,
        }
    }
}

impl TransportConfig {
    /// The transports this server accepts, in preference order.
    #[must_use]
    pub fn enabled(&self) -> Vec<TransportKind> {
        let mut transports = Vec::with_capacity(2);
        if self.websocket {
            transports.push(TransportKind::WebSocket);
        }
        if self.long_polling {
            transports.push(TransportKind::LongPolling);
        }
        transports
    }
}

impl Config {
    /// Load configuration from the default files and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let mut builder = ::config::Config::builder();
        for path in CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            builder = builder.add_source(
                ::config::File::new(expanded.as_ref(), ::config::FileFormat::Toml).required(false),
            );
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("HALLEY")
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("engine.reflecting_paths")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert!(config.transport.websocket);
        assert!(config.transport.long_polling);
        assert_eq!(config.engine.max_queue_size, 1000);
        assert_eq!(
            config.transport.enabled(),
            vec![TransportKind::WebSocket, TransportKind::LongPolling]
        );
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let broken = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(broken.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [transport]
            websocket = false

            [limits]
            max_message_size = 1024

            [engine]
            max_queue_size = 50
            reflecting_paths = ["/echo/**"]

            [extensions]
            ack = false
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_message_size, 1024);
        assert_eq!(config.engine.max_queue_size, 50);
        assert_eq!(config.engine.reflecting_paths, vec!["/echo/**".to_string()]);
        assert_eq!(config.engine.long_poll_timeout_ms, 30_000);
        assert_eq!(config.transport.enabled(), vec![TransportKind::LongPolling]);
        assert!(!config.extensions.ack);
        assert!(config.extensions.timesync);
        assert_eq!(config.extensions.ack_queue_size, 1_000);
    }
}
