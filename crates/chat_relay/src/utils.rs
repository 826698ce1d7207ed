//! Utility functions and helper methods for the chat relay.
//!
//! This module provides convenient factory functions for creating relay
//! instances and the shared wall-clock helper.

use crate::{config::RelayConfig, server::RelayServer};

/// Creates a new relay with default configuration.
///
/// # Example
///
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use chat_relay::create_relay;
///
/// let relay = create_relay();
/// # }
/// ```
pub fn create_relay() -> RelayServer {
    RelayServer::new(RelayConfig::default())
}

/// Creates a new relay with custom configuration.
///
/// The broker backend is chosen from `config.broker.kind`.
///
/// # Example
///
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use chat_relay::{create_relay_with_config, BrokerKind, RelayConfig};
///
/// let mut config = RelayConfig {
///     bind_address: "0.0.0.0:9000".parse().unwrap(),
///     max_connections: 5000,
///     ..Default::default()
/// };
/// config.broker.kind = BrokerKind::Memory;
///
/// let relay = create_relay_with_config(config);
/// # }
/// ```
pub fn create_relay_with_config(config: RelayConfig) -> RelayServer {
    RelayServer::new(config)
}

/// Current wall-clock time in epoch milliseconds.
pub fn current_timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
