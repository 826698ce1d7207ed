//! Configuration management for the chat relay.
//!
//! This module handles loading, validation, and conversion of relay
//! configuration from TOML files, environment variables and command-line
//! arguments.

use chat_relay::config::validate_ws_path;
use chat_relay::{BrokerConfig, BrokerKind, RelayConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

/// Application configuration loaded from TOML file.
///
/// Encompasses the listener, broker and logging settings. Missing keys fall
/// back to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Listener and connection settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Broker connection settings
    #[serde(default)]
    pub broker: BrokerSettings,
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind the relay to (e.g., "0.0.0.0:8080")
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Path accepted for WebSocket upgrades
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds between heartbeat sweeps
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Per-connection outbound queue capacity
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// Name reported by the status endpoint
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

/// Broker configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Backend: `amqp` or `memory`
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,
    /// AMQP connection URL
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Fan-out exchange name
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Queue bound to the exchange
    #[serde(default = "default_queue")]
    pub queue: String,
    /// Routing key used when publishing
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    /// Connection attempts before the relay gives up
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Delay between connection attempts, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Logging configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

fn default_bind_address() -> String {
    RelayConfig::default().bind_address.to_string()
}
fn default_ws_path() -> String {
    RelayConfig::default().ws_path
}
fn default_max_connections() -> usize {
    RelayConfig::default().max_connections
}
fn default_heartbeat_interval() -> u64 {
    RelayConfig::default().heartbeat_interval_secs
}
fn default_outbound_queue_size() -> usize {
    RelayConfig::default().outbound_queue_size
}
fn default_service_name() -> String {
    RelayConfig::default().service_name
}

fn default_broker_kind() -> BrokerKind { BrokerConfig::default().kind }
fn default_broker_url() -> String { BrokerConfig::default().url }
fn default_exchange() -> String { BrokerConfig::default().exchange }
fn default_queue() -> String { BrokerConfig::default().queue }
fn default_routing_key() -> String { BrokerConfig::default().routing_key }
fn default_max_connect_attempts() -> u32 { BrokerConfig::default().max_connect_attempts }
fn default_retry_delay_ms() -> u64 { BrokerConfig::default().retry_delay_ms }

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            ws_path: default_ws_path(),
            max_connections: default_max_connections(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            outbound_queue_size: default_outbound_queue_size(),
            service_name: default_service_name(),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            url: default_broker_url(),
            exchange: default_exchange(),
            queue: default_queue(),
            routing_key: default_routing_key(),
            max_connect_attempts: default_max_connect_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

/// Parses a broker backend name as accepted on the command line.
pub fn parse_broker_kind(name: &str) -> Result<BrokerKind, String> {
    match name.to_ascii_lowercase().as_str() {
        "amqp" => Ok(BrokerKind::Amqp),
        "memory" => Ok(BrokerKind::Memory),
        other => Err(format!("Unknown broker kind: {other}. Must be one of: amqp, memory")),
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, a default configuration is written to
    /// `path` and returned.
    pub async fn load_from_file(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Create default config file
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies the `AMQP_URL` and `PORT` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), String> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies environment-style overrides read through `lookup`.
    ///
    /// `PORT` replaces only the port of the bind address.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("AMQP_URL").filter(|url| !url.is_empty()) {
            self.broker.url = url;
        }

        if let Some(port) = lookup("PORT").filter(|port| !port.is_empty()) {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| format!("Invalid PORT value: {port}"))?;
            let mut addr: SocketAddr = self
                .server
                .bind_address
                .parse()
                .map_err(|_| format!("Invalid bind address: {}", self.server.bind_address))?;
            addr.set_port(port);
            self.server.bind_address = addr.to_string();
        }

        Ok(())
    }

    /// Converts the application configuration to a relay configuration.
    pub fn to_relay_config(&self) -> Result<RelayConfig, Box<dyn std::error::Error>> {
        Ok(RelayConfig {
            bind_address: self.server.bind_address.parse()?,
            ws_path: self.server.ws_path.clone(),
            max_connections: self.server.max_connections,
            heartbeat_interval_secs: self.server.heartbeat_interval_secs,
            outbound_queue_size: self.server.outbound_queue_size,
            service_name: self.server.service_name.clone(),
            broker: BrokerConfig {
                kind: self.broker.kind,
                url: self.broker.url.clone(),
                exchange: self.broker.exchange.clone(),
                queue: self.broker.queue.clone(),
                routing_key: self.broker.routing_key.clone(),
                max_connect_attempts: self.broker.max_connect_attempts,
                retry_delay_ms: self.broker.retry_delay_ms,
            },
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        // Validate bind address
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            return Err(format!(
                "Invalid bind address: {}",
                &self.server.bind_address
            ));
        }

        validate_ws_path(&self.server.ws_path)?;

        if self.server.max_connections == 0 {
            return Err("server.max_connections must be greater than 0".to_string());
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err("server.heartbeat_interval_secs must be greater than 0".to_string());
        }
        if self.server.outbound_queue_size == 0 {
            return Err("server.outbound_queue_size must be greater than 0".to_string());
        }

        if self.broker.kind == BrokerKind::Amqp
            && !(self.broker.url.starts_with("amqp://") || self.broker.url.starts_with("amqps://"))
        {
            return Err(format!("Invalid AMQP URL: {}", self.broker.url));
        }
        if self.broker.exchange.is_empty() || self.broker.queue.is_empty() {
            return Err("broker.exchange and broker.queue cannot be empty".to_string());
        }
        if self.broker.max_connect_attempts == 0 {
            return Err("broker.max_connect_attempts must be greater than 0".to_string());
        }

        // Validate log level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        Ok(())
    }
}
