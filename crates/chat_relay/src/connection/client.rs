//! Client connection representation.
//!
//! This module defines the per-socket record kept by the registry.

use super::{ConnectionId, OutboundSender};
use std::net::SocketAddr;
use std::time::SystemTime;

/// Lifecycle of one connection: `Open → Closing → Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, frames flow both ways
    Open,
    /// A close frame was sent or received; no more deliveries
    Closing,
    /// Socket released and removed from the registry
    Closed,
}

/// Represents an individual client connection to the relay.
///
/// * `id` - Identifier generated at accept time
/// * `remote_addr` - The network address of the connected client
/// * `connected_at` - When the socket was accepted
/// * `is_alive` - Cleared by each heartbeat sweep, set again by a pong
/// * `state` - Lifecycle state
/// * `outbound` - Handle to the socket's writer task
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub connected_at: SystemTime,
    pub is_alive: bool,
    pub state: ConnectionState,
    pub outbound: OutboundSender,
    /// Last chat timestamp issued on this connection, in epoch milliseconds
    pub(crate) last_chat_ts: i64,
}

impl ClientConnection {
    /// Creates an open, live connection record.
    pub fn new(id: ConnectionId, remote_addr: SocketAddr, outbound: OutboundSender) -> Self {
        Self {
            id,
            remote_addr,
            connected_at: SystemTime::now(),
            is_alive: true,
            state: ConnectionState::Open,
            outbound,
            last_chat_ts: 0,
        }
    }

    /// Whether frames may still be delivered to this connection.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}
