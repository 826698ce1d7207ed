//! Connection registry: open sessions and per-connection presence.
//!
//! The registry is the single owner of connection state. Sessions and
//! presence entries live behind one lock, so every mutation (open, join,
//! close, heartbeat prune) is atomic with respect to every other and no
//! reader can observe a half-applied change. The registry performs no I/O;
//! callers receive [`OutboundSender`] handles and write outside the lock.

use super::{ClientConnection, ConnectionId, ConnectionState, OutboundSender};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Presence of one identified connection.
///
/// Several connections may carry the same `user_id`; each gets its own entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub joined_at: DateTime<Utc>,
    order: u64,
}

impl PresenceEntry {
    /// Join time formatted for the wire, e.g. `2024-05-01T10:00:00.000Z`.
    pub fn connection_time(&self) -> String {
        self.joined_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Outcome of one heartbeat sweep, computed atomically.
#[derive(Debug, Default)]
pub struct HeartbeatSweep {
    /// Connections that missed the previous probe; already removed
    pub expired: Vec<(ConnectionId, OutboundSender, Option<PresenceEntry>)>,
    /// Connections whose liveness flag was cleared and need a new probe
    pub probe: Vec<(ConnectionId, OutboundSender)>,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, ClientConnection>,
    presence: HashMap<ConnectionId, PresenceEntry>,
    next_order: u64,
}

/// Central registry for all client connections of this relay instance.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly accepted connection and returns its ID.
    pub async fn open(&self, remote_addr: SocketAddr, outbound: OutboundSender) -> ConnectionId {
        let connection_id = ConnectionId::new();
        let connection = ClientConnection::new(connection_id, remote_addr, outbound);
        let mut state = self.state.write().await;
        state.connections.insert(connection_id, connection);
        info!(
            connection_id = %connection_id,
            client_ip = %remote_addr,
            total_connections = state.connections.len(),
            "New WebSocket connection"
        );
        connection_id
    }

    /// Records `user_id` as the identity of an open connection.
    ///
    /// Returns `true` only for the first registration of that connection;
    /// repeated joins, and joins for connections that are no longer open,
    /// return `false` and change nothing.
    pub async fn register(&self, connection_id: ConnectionId, user_id: &str) -> bool {
        let mut state = self.state.write().await;
        let is_open = state
            .connections
            .get(&connection_id)
            .is_some_and(ClientConnection::is_open);
        if !is_open {
            debug!(connection_id = %connection_id, "Ignoring join for unknown or closing connection");
            return false;
        }
        if state.presence.contains_key(&connection_id) {
            return false;
        }

        let order = state.next_order;
        state.next_order += 1;
        state.presence.insert(
            connection_id,
            PresenceEntry {
                user_id: user_id.to_string(),
                connection_id,
                joined_at: Utc::now(),
                order,
            },
        );
        true
    }

    /// Returns the user registered on a connection, if any.
    pub async fn user_of(&self, connection_id: ConnectionId) -> Option<String> {
        let state = self.state.read().await;
        state.presence.get(&connection_id).map(|entry| entry.user_id.clone())
    }

    /// Deletes the presence entry of a connection and returns it.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<PresenceEntry> {
        self.state.write().await.presence.remove(&connection_id)
    }

    /// Removes a connection together with its presence entry.
    ///
    /// Returns the removed presence entry, if the connection had one. Closing
    /// an already closed connection is a no-op that returns `None`.
    pub async fn close(&self, connection_id: ConnectionId) -> Option<PresenceEntry> {
        let mut state = self.state.write().await;
        let mut connection = state.connections.remove(&connection_id)?;
        connection.state = ConnectionState::Closed;
        let entry = state.presence.remove(&connection_id);
        let connected_secs = connection.connected_at.elapsed().map(|d| d.as_secs()).unwrap_or_default();
        debug!(
            connection_id = %connection_id,
            connected_secs,
            remaining_connections = state.connections.len(),
            "Connection removed from registry"
        );
        entry
    }

    /// Marks a connection as closing so it no longer receives fan-out.
    pub async fn begin_close(&self, connection_id: ConnectionId) {
        let mut state = self.state.write().await;
        if let Some(connection) = state.connections.get_mut(&connection_id) {
            connection.state = ConnectionState::Closing;
        }
    }

    /// Re-arms the liveness flag after a heartbeat reply.
    pub async fn mark_alive(&self, connection_id: ConnectionId) {
        let mut state = self.state.write().await;
        if let Some(connection) = state.connections.get_mut(&connection_id) {
            connection.is_alive = true;
        }
    }

    /// Issues a chat timestamp that never goes backwards on one connection.
    pub async fn stamp_chat(&self, connection_id: ConnectionId, now_ms: i64) -> i64 {
        let mut state = self.state.write().await;
        match state.connections.get_mut(&connection_id) {
            Some(connection) => {
                connection.last_chat_ts = connection.last_chat_ts.max(now_ms);
                connection.last_chat_ts
            }
            None => now_ms,
        }
    }

    /// Presence entries in join order.
    pub async fn snapshot(&self) -> Vec<PresenceEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<PresenceEntry> = state.presence.values().cloned().collect();
        entries.sort_by_key(|entry| entry.order);
        entries
    }

    /// Number of presence entries.
    pub async fn size(&self) -> usize {
        self.state.read().await.presence.len()
    }

    /// Number of tracked connections, identified or not.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Outbound handles of every connection still in the open state.
    pub async fn open_connections(&self) -> Vec<(ConnectionId, OutboundSender)> {
        let state = self.state.read().await;
        state
            .connections
            .values()
            .filter(|connection| connection.is_open())
            .map(|connection| (connection.id, connection.outbound.clone()))
            .collect()
    }

    /// Runs one liveness pass over all open connections.
    ///
    /// Connections whose flag is still cleared from the previous pass are
    /// removed along with their presence entry; every other open connection
    /// has its flag cleared and is returned for probing.
    pub async fn heartbeat_sweep(&self) -> HeartbeatSweep {
        let mut state = self.state.write().await;
        let mut sweep = HeartbeatSweep::default();

        let expired_ids: Vec<ConnectionId> = state
            .connections
            .values()
            .filter(|connection| connection.is_open() && !connection.is_alive)
            .map(|connection| connection.id)
            .collect();

        for connection_id in expired_ids {
            if let Some(mut connection) = state.connections.remove(&connection_id) {
                connection.state = ConnectionState::Closed;
                let entry = state.presence.remove(&connection_id);
                sweep.expired.push((connection_id, connection.outbound, entry));
            }
        }

        for connection in state.connections.values_mut().filter(|c| c.is_open()) {
            connection.is_alive = false;
            sweep.probe.push((connection.id, connection.outbound.clone()));
        }

        sweep
    }

    /// Moves every connection to the closing state and returns their handles.
    ///
    /// Used at shutdown so each socket can be sent a close frame.
    pub async fn drain(&self) -> Vec<(ConnectionId, OutboundSender)> {
        let mut state = self.state.write().await;
        state
            .connections
            .values_mut()
            .map(|connection| {
                connection.state = ConnectionState::Closing;
                (connection.id, connection.outbound.clone())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbound;
    use tokio::sync::mpsc;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    async fn open(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (outbound, receiver) = OutboundSender::channel(16);
        (registry.open(addr(), outbound).await, receiver)
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_connection() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = open(&registry).await;

        assert!(registry.register(id, "alice").await);
        assert!(!registry.register(id, "alice").await);
        assert!(!registry.register(id, "mallory").await);

        assert_eq!(registry.size().await, 1);
        assert_eq!(registry.user_of(id).await.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_same_user_on_two_connections_is_not_deduplicated() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = open(&registry).await;
        let (b, _rx_b) = open(&registry).await;

        assert!(registry.register(a, "alice").await);
        assert!(registry.register(b, "alice").await);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].connection_id, a);
        assert_eq!(snapshot[1].connection_id, b);
    }

    #[tokio::test]
    async fn test_register_requires_open_connection() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.register(ConnectionId::new(), "ghost").await);

        let (id, _rx) = open(&registry).await;
        registry.close(id).await;
        assert!(!registry.register(id, "late").await);
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_snapshot_is_in_join_order() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = open(&registry).await;
        let (b, _rx_b) = open(&registry).await;
        let (c, _rx_c) = open(&registry).await;

        registry.register(c, "carol").await;
        registry.register(a, "alice").await;
        registry.register(b, "bob").await;

        let users: Vec<String> = registry.snapshot().await.into_iter().map(|e| e.user_id).collect();
        assert_eq!(users, vec!["carol", "alice", "bob"]);
    }

    #[tokio::test]
    async fn test_close_returns_presence_once() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = open(&registry).await;
        registry.register(id, "bob").await;

        let removed = registry.close(id).await.expect("presence entry");
        assert_eq!(removed.user_id, "bob");
        assert!(registry.close(id).await.is_none());
        assert_eq!(registry.connection_count().await, 0);
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_remove_keeps_session_open() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = open(&registry).await;
        registry.register(id, "bob").await;

        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
        assert_eq!(registry.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_closing_connections_are_not_delivered_to() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = open(&registry).await;
        let (b, _rx_b) = open(&registry).await;

        registry.begin_close(a).await;
        let open_ids: Vec<ConnectionId> =
            registry.open_connections().await.into_iter().map(|(id, _)| id).collect();
        assert_eq!(open_ids, vec![b]);
    }

    #[tokio::test]
    async fn test_heartbeat_sweep_tolerates_one_missed_cycle() {
        let registry = ConnectionRegistry::new();
        let (quiet, _rx_q) = open(&registry).await;
        let (chatty, _rx_c) = open(&registry).await;
        registry.register(quiet, "quiet").await;

        // First pass: everyone was alive, all get probed
        let sweep = registry.heartbeat_sweep().await;
        assert!(sweep.expired.is_empty());
        assert_eq!(sweep.probe.len(), 2);

        // Only one replies
        registry.mark_alive(chatty).await;

        let sweep = registry.heartbeat_sweep().await;
        assert_eq!(sweep.expired.len(), 1);
        let (expired_id, _, entry) = &sweep.expired[0];
        assert_eq!(*expired_id, quiet);
        assert_eq!(entry.as_ref().map(|e| e.user_id.as_str()), Some("quiet"));
        assert_eq!(sweep.probe.len(), 1);
        assert_eq!(registry.connection_count().await, 1);
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_stamp_chat_is_monotonic_per_connection() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = open(&registry).await;

        assert_eq!(registry.stamp_chat(id, 1_000).await, 1_000);
        // Clock stepped backwards
        assert_eq!(registry.stamp_chat(id, 900).await, 1_000);
        assert_eq!(registry.stamp_chat(id, 1_200).await, 1_200);
    }

    #[tokio::test]
    async fn test_connection_time_format() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = open(&registry).await;
        registry.register(id, "alice").await;

        let entry = registry.snapshot().await.remove(0);
        let formatted = entry.connection_time();
        assert!(formatted.ends_with('Z'));
        assert!(DateTime::parse_from_rfc3339(&formatted).is_ok());
    }

    #[tokio::test]
    async fn test_drain_marks_everything_closing() {
        let registry = ConnectionRegistry::new();
        let (_a, _rx_a) = open(&registry).await;
        let (_b, _rx_b) = open(&registry).await;

        assert_eq!(registry.drain().await.len(), 2);
        assert!(registry.open_connections().await.is_empty());
    }
}
