//! Broker bridge: connection lifecycle, bounded retry and fan-out delivery.
//!
//! The bridge walks an explicit state machine:
//!
//! ```text
//! Disconnected -> Connecting{1} -> ... -> Connecting{max} -> Failed
//!                       \________________________/
//!                                   |
//!                               Connected
//! ```
//!
//! Each failed attempt bumps the failure counter and waits a fixed delay
//! before the next one. `Failed` is terminal for the process. While
//! `Connected`, [`BrokerBridge::publish`] is the only publish path and
//! [`BrokerBridge::run_consumer`] delivers every consumed frame to every open
//! local socket.

use super::{Broker, BrokerDelivery, BrokerSession, Sleeper};
use crate::connection::{deliver_to_all, ConnectionRegistry};
use crate::error::{BrokerError, RelayError};
use crate::messaging::{preview, RelayFrame};
use crate::shutdown::ShutdownState;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, trace, warn};

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No session and no attempt in progress
    Disconnected,
    /// Connection attempt `attempt` (1-based) in progress
    Connecting { attempt: u32 },
    /// Session established; publish and consume are available
    Connected,
    /// Retry budget exhausted
    Failed,
}

/// Owns the broker session shared by the router, the presence broadcaster
/// and the consumer task.
pub struct BrokerBridge {
    broker: Arc<dyn Broker>,
    sleeper: Arc<dyn Sleeper>,
    max_attempts: u32,
    retry_delay: Duration,
    state: RwLock<BridgeState>,
    failures: AtomicU32,
    session: RwLock<Option<Arc<dyn BrokerSession>>>,
}

impl BrokerBridge {
    pub fn new(
        broker: Arc<dyn Broker>,
        sleeper: Arc<dyn Sleeper>,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            broker,
            sleeper,
            max_attempts: max_attempts.max(1),
            retry_delay,
            state: RwLock::new(BridgeState::Disconnected),
            failures: AtomicU32::new(0),
            session: RwLock::new(None),
        }
    }

    /// Current state of the bridge.
    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    /// Whether a session is established.
    pub async fn is_connected(&self) -> bool {
        self.state().await == BridgeState::Connected
    }

    /// Total failed connection attempts since the bridge was created.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Connects with a fresh retry budget.
    ///
    /// Makes at most `max_attempts` attempts with the fixed retry delay
    /// between consecutive ones. Exhausting the budget leaves the bridge in
    /// [`BridgeState::Failed`] and returns [`RelayError::BrokerExhausted`].
    pub async fn connect(&self) -> Result<(), RelayError> {
        for attempt in 1..=self.max_attempts {
            *self.state.write().await = BridgeState::Connecting { attempt };
            debug!(attempt, backend = self.broker.name(), "Connecting to broker");

            match self.broker.connect().await {
                Ok(session) => {
                    *self.session.write().await = Some(session);
                    *self.state.write().await = BridgeState::Connected;
                    info!(attempt, backend = self.broker.name(), "✅ Connected to broker");
                    return Ok(());
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        "Broker connection failed: {}",
                        e
                    );
                    if attempt < self.max_attempts {
                        self.sleeper.sleep(self.retry_delay).await;
                    }
                }
            }
        }

        *self.state.write().await = BridgeState::Failed;
        error!(
            attempts = self.max_attempts,
            "❌ Giving up on broker after {} attempts", self.max_attempts
        );
        Err(RelayError::BrokerExhausted { attempts: self.max_attempts })
    }

    async fn current_session(&self) -> Option<Arc<dyn BrokerSession>> {
        self.session.read().await.clone()
    }

    /// Publishes a frame to the fan-out topic, including this instance's own
    /// subscription.
    pub async fn publish(&self, frame: &RelayFrame) -> Result<(), BrokerError> {
        let session = self.current_session().await.ok_or(BrokerError::NotConnected)?;
        let payload = frame.encode().map_err(|e| BrokerError::Publish(e.to_string()))?;
        session.publish(payload.as_bytes()).await
    }

    /// Consumes frames and delivers them to every open local connection
    /// until shutdown.
    ///
    /// If the consumption stream ends while the relay is not shutting down,
    /// the session is dropped and the bridge reconnects with a fresh retry
    /// budget. Only an exhausted budget is returned as an error.
    pub async fn run_consumer(
        &self,
        registry: Arc<ConnectionRegistry>,
        shutdown: ShutdownState,
    ) -> Result<(), RelayError> {
        loop {
            if shutdown.is_shutdown_initiated() {
                return Ok(());
            }

            let session = self.current_session().await.ok_or(BrokerError::NotConnected)?;
            match session.consume().await {
                Ok(mut deliveries) => {
                    info!("📥 Broker consumer started");
                    loop {
                        let next = tokio::select! {
                            _ = shutdown.wait() => return Ok(()),
                            next = deliveries.next() => next,
                        };
                        match next {
                            Some(Ok(delivery)) => self.dispatch(delivery, &registry).await,
                            Some(Err(e)) => {
                                warn!("Broker consumption error: {}", e);
                                break;
                            }
                            None => break,
                        }
                    }
                }
                Err(e) => warn!("Failed to start broker consumer: {}", e),
            }

            if shutdown.is_shutdown_initiated() {
                return Ok(());
            }

            warn!("🔌 Broker consumption lost, reconnecting");
            self.session.write().await.take();
            *self.state.write().await = BridgeState::Disconnected;

            tokio::select! {
                _ = shutdown.wait() => return Ok(()),
                reconnected = self.connect() => reconnected?,
            }
        }
    }

    async fn dispatch(&self, delivery: BrokerDelivery, registry: &ConnectionRegistry) {
        let text = match std::str::from_utf8(&delivery.payload) {
            Ok(text) => text,
            Err(_) => {
                warn!(bytes = delivery.payload.len(), "Rejecting non-UTF-8 broker frame");
                if let Err(e) = delivery.reject().await {
                    warn!("Failed to reject broker frame: {}", e);
                }
                return;
            }
        };

        match RelayFrame::decode(text.as_bytes()) {
            Ok(frame) => {
                let targets = registry.open_connections().await;
                let delivered = deliver_to_all(&targets, text);
                match &frame {
                    RelayFrame::Chat(chat) => {
                        trace!(user_id = %chat.user, delivered, "Delivered chat frame")
                    }
                    RelayFrame::Presence(snapshot) => trace!(
                        total_users = snapshot.total_users,
                        delivered,
                        "Delivered presence snapshot"
                    ),
                }
                if let Err(e) = delivery.ack().await {
                    warn!("Failed to ack broker frame: {}", e);
                }
            }
            Err(e) => {
                warn!(
                    frame_preview = preview(text, 100),
                    "Rejecting malformed broker frame: {}", e
                );
                if let Err(e) = delivery.reject().await {
                    warn!("Failed to reject broker frame: {}", e);
                }
            }
        }
    }

    /// Releases the broker session.
    pub async fn close(&self) {
        if let Some(session) = self.session.write().await.take() {
            if let Err(e) = session.close().await {
                warn!("Error while closing broker session: {}", e);
            }
            info!("Broker session closed");
        }
        let mut state = self.state.write().await;
        if *state != BridgeState::Failed {
            *state = BridgeState::Disconnected;
        }
    }
}
