//! Presence broadcaster.
//!
//! Publishes the full membership snapshot of this relay instance whenever it
//! changes. Snapshots travel through the broker exactly like chat frames, so
//! every socket of every instance receives them.

use crate::broker::BrokerBridge;
use crate::connection::ConnectionRegistry;
use crate::messaging::{PresenceSnapshot, PresenceUser, RelayFrame};
use crate::utils::current_timestamp_ms;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PresenceBroadcaster {
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<BrokerBridge>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, bridge: Arc<BrokerBridge>) -> Self {
        Self { registry, bridge }
    }

    /// Builds a snapshot of the registry in join order.
    pub async fn snapshot(&self) -> PresenceSnapshot {
        let user_list: Vec<PresenceUser> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .map(|entry| PresenceUser {
                connection_time: entry.connection_time(),
                user_id: entry.user_id,
            })
            .collect();

        PresenceSnapshot {
            total_users: user_list.len(),
            user_list,
            ts: current_timestamp_ms(),
        }
    }

    /// Snapshots the registry and publishes it.
    ///
    /// Returns the published snapshot, or `None` if publishing failed. A
    /// failure is logged and otherwise ignored; the next presence change
    /// publishes a complete snapshot again.
    pub async fn broadcast(&self) -> Option<PresenceSnapshot> {
        let snapshot = self.snapshot().await;
        let frame = RelayFrame::Presence(snapshot.clone());

        match self.bridge.publish(&frame).await {
            Ok(()) => {
                info!(total_users = snapshot.total_users, "👥 Presence snapshot published");
                Some(snapshot)
            }
            Err(e) => {
                warn!("Failed to publish presence snapshot: {}", e);
                None
            }
        }
    }
}
