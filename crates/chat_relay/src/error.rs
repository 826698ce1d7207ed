//! Error types and handling for the chat relay.
//!
//! Failures are split by how far they are allowed to travel: frame and
//! broker-delivery errors stay local to one message, connection errors stay
//! local to one socket, and only an exhausted broker budget reaches the
//! process boundary.

/// Top-level relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Network-related errors such as binding failures or handshake issues
    #[error("Network error: {0}")]
    Network(String),

    /// A broker operation failed
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Every broker connection attempt failed; the relay cannot operate
    #[error("Broker unreachable after {attempts} connection attempts")]
    BrokerExhausted {
        /// Number of attempts that were made
        attempts: u32,
    },

    /// The relay configuration cannot be served
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal relay errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised at the broker seam.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Establishing the connection or declaring the topology failed
    #[error("connect failed: {0}")]
    Connect(String),

    /// Publishing a frame failed
    #[error("publish failed: {0}")]
    Publish(String),

    /// Starting or running the consumer failed
    #[error("consume failed: {0}")]
    Consume(String),

    /// Acknowledging or rejecting a delivery failed
    #[error("acknowledgement failed: {0}")]
    Ack(String),

    /// No broker session is currently established
    #[error("broker is not connected")]
    NotConnected,
}

/// Errors raised while parsing frames received from clients or the broker.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload was not valid JSON for the expected shape
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
