//! Relay configuration types and defaults.
//!
//! This module contains the configuration structures used to initialize the
//! relay server, its heartbeat supervisor and its broker bridge.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration structure for the chat relay.
///
/// Contains the network settings for the WebSocket listener, connection
/// limits, heartbeat timing and the broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// The socket address to bind the listener to
    pub bind_address: SocketAddr,

    /// HTTP path accepted for WebSocket upgrades
    pub ws_path: String,

    /// Maximum number of concurrent WebSocket connections allowed
    pub max_connections: usize,

    /// Interval between heartbeat sweeps, in seconds
    pub heartbeat_interval_secs: u64,

    /// Capacity of each connection's outbound frame queue
    pub outbound_queue_size: usize,

    /// Service name reported by the status endpoint
    pub service_name: String,

    /// Broker connection settings
    pub broker: BrokerConfig,
}

/// Which broker implementation the bridge talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// AMQP 0-9-1 broker such as RabbitMQ
    Amqp,
    /// In-process fan-out, single instance only
    Memory,
}

/// Broker topology and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Backend selection
    pub kind: BrokerKind,

    /// Connection URL (AMQP only)
    pub url: String,

    /// Fan-out exchange every frame is published to
    pub exchange: String,

    /// Queue bound to the exchange and consumed by this instance
    pub queue: String,

    /// Routing key used when publishing
    pub routing_key: String,

    /// Maximum number of connection attempts before giving up
    pub max_connect_attempts: u32,

    /// Fixed delay between connection attempts, in milliseconds
    pub retry_delay_ms: u64,
}

impl RelayConfig {
    /// Heartbeat sweep period as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl BrokerConfig {
    /// Delay between connection attempts as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Paths the relay serves itself; the WebSocket path must not shadow them.
pub const RESERVED_PATHS: [&str; 2] = ["/", "/healthz"];

/// Checks that `path` can be routed as the WebSocket endpoint.
///
/// It must be absolute, must not be one of [`RESERVED_PATHS`] and must be a
/// literal path: no `{capture}`, wildcard or `:segment` syntax.
pub fn validate_ws_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err(format!("WebSocket path must start with '/': {path}"));
    }
    if RESERVED_PATHS.contains(&path) {
        return Err(format!("WebSocket path collides with a health endpoint: {path}"));
    }
    if path.contains(['{', '}', '*']) || path.split('/').any(|segment| segment.starts_with(':')) {
        return Err(format!("WebSocket path must be a literal path: {path}"));
    }
    Ok(())
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            ws_path: "/chat/ws".to_string(),
            max_connections: 1000,
            // Well under the several-minute idle timeout of typical load balancers
            heartbeat_interval_secs: 30,
            outbound_queue_size: 256,
            service_name: "chat-relay".to_string(),
            broker: BrokerConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Amqp,
            url: "amqp://rabbitmq:5672".to_string(),
            exchange: "chat.exchange".to_string(),
            queue: "chat.messages".to_string(),
            routing_key: "chat.msg".to_string(),
            max_connect_attempts: 10,
            retry_delay_ms: 5000,
        }
    }
}
