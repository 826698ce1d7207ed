//! Inbound frame routing.
//!
//! Turns raw client text frames into registry updates and broker publishes.
//! Joins stay local to this instance; chat lines are stamped with a server
//! timestamp and published exactly once. Nothing is ever sent back to the
//! originating client from here: it sees its own chat through the broker
//! fan-out like everyone else.

use crate::broker::BrokerBridge;
use crate::connection::{ConnectionId, ConnectionRegistry};
use crate::messaging::{preview, ChatFrame, ClientFrame, RelayFrame};
use crate::presence::PresenceBroadcaster;
use crate::utils::current_timestamp_ms;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Maximum number of characters of a bad frame echoed into the logs.
const LOG_PREVIEW_CHARS: usize = 100;

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Not a JSON object; the connection stays open
    Dropped,
    /// A join; `first` is true when it registered the connection
    Joined { first: bool },
    /// A chat line handed to the broker
    Published,
    /// A chat line the broker refused; not retried
    PublishFailed,
}

pub struct FrameRouter {
    registry: Arc<ConnectionRegistry>,
    bridge: Arc<BrokerBridge>,
    presence: Arc<PresenceBroadcaster>,
}

impl FrameRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bridge: Arc<BrokerBridge>,
        presence: Arc<PresenceBroadcaster>,
    ) -> Self {
        Self { registry, bridge, presence }
    }

    /// Routes one raw text frame received on `connection_id`.
    pub async fn handle(&self, connection_id: ConnectionId, raw: &str) -> RouteOutcome {
        let frame = match ClientFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    connection_id = %connection_id,
                    frame_preview = preview(raw, LOG_PREVIEW_CHARS),
                    "Dropping client frame: {}", e
                );
                return RouteOutcome::Dropped;
            }
        };

        match frame {
            ClientFrame::Join { user } => RouteOutcome::Joined {
                first: self.join(connection_id, &user).await,
            },
            ClientFrame::Chat { user, text } => {
                // A chat before any join identifies the connection implicitly
                if self.registry.user_of(connection_id).await.is_none() {
                    self.join(connection_id, &user).await;
                }

                let ts = self.registry.stamp_chat(connection_id, current_timestamp_ms()).await;
                let frame = RelayFrame::Chat(ChatFrame { text, user, ts });
                match self.bridge.publish(&frame).await {
                    Ok(()) => {
                        debug!(connection_id = %connection_id, ts, "Chat frame published");
                        RouteOutcome::Published
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, "Failed to publish chat frame: {}", e);
                        RouteOutcome::PublishFailed
                    }
                }
            }
        }
    }

    async fn join(&self, connection_id: ConnectionId, user: &str) -> bool {
        let first = self.registry.register(connection_id, user).await;
        if first {
            let total_users = self.registry.size().await;
            info!(connection_id = %connection_id, user_id = %user, total_users, "🙋 User joined");
            self.presence.broadcast().await;
        } else {
            debug!(connection_id = %connection_id, user_id = %user, "Ignoring repeated join");
        }
        first
    }
}
