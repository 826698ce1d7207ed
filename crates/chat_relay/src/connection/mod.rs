//! Connection management for client sockets.
//!
//! This module handles the lifecycle of client connections, including
//! session tracking, presence bookkeeping and best-effort outbound delivery.

pub mod client;
pub mod outbound;
pub mod registry;

pub use client::{ClientConnection, ConnectionState};
pub use outbound::{deliver_to_all, Outbound, OutboundSender};
pub use registry::{ConnectionRegistry, HeartbeatSweep, PresenceEntry};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for one accepted WebSocket connection.
///
/// Generated at accept time and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Creates a new random connection ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ws_{}", self.0.simple())
    }
}
