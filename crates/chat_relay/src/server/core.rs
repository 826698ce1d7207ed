//! Core relay server implementation.
//!
//! This module contains the main `RelayServer` struct, which wires the
//! registry, broker bridge, router, presence broadcaster and heartbeat
//! supervisor together and serves the HTTP listener.

use crate::{
    broker::{AmqpBroker, BridgeState, Broker, BrokerBridge, MemoryBroker, Sleeper, TokioSleeper},
    config::{validate_ws_path, BrokerKind, RelayConfig},
    connection::ConnectionRegistry,
    error::RelayError,
    health::HealthManager,
    heartbeat::HeartbeatSupervisor,
    messaging::FrameRouter,
    presence::PresenceBroadcaster,
    server::handlers::{build_router, ConnectionContext},
    shutdown::ShutdownState,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for HTTP connections, then for sessions.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Point-in-time counters for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Open WebSocket connections, identified or not
    pub connections: usize,
    /// Presence entries
    pub users: usize,
    /// Broker bridge state
    pub bridge_state: BridgeState,
    /// Failed broker connection attempts so far
    pub broker_failures: u32,
    /// Seconds since the relay was created
    pub uptime_secs: u64,
}

/// The chat relay server.
///
/// `RelayServer` owns every component of one relay instance:
///
/// * **Connection registry** - sessions and presence, behind one lock
/// * **Broker bridge** - retrying broker session, publish and consume paths
/// * **Frame router** - inbound client frames to registry and broker
/// * **Presence broadcaster** - membership snapshots on every change
/// * **Heartbeat supervisor** - ping/pong liveness and pruning
///
/// The listener starts accepting before the broker is connected so health
/// probes are answered while the bridge is still retrying.
pub struct RelayServer {
    /// Relay configuration settings
    config: RelayConfig,

    registry: Arc<ConnectionRegistry>,
    bridge: Arc<BrokerBridge>,
    presence: Arc<PresenceBroadcaster>,
    router: Arc<FrameRouter>,
    health: Arc<HealthManager>,

    /// Shutdown state used by [`Self::start`] and [`Self::shutdown`]
    shutdown_state: ShutdownState,
}

impl RelayServer {
    /// Creates a relay using the broker backend named in the configuration.
    pub fn new(config: RelayConfig) -> Self {
        let broker: Arc<dyn Broker> = match config.broker.kind {
            BrokerKind::Amqp => Arc::new(AmqpBroker::new(config.broker.clone())),
            BrokerKind::Memory => Arc::new(MemoryBroker::default()),
        };
        Self::with_broker(config, broker, Arc::new(TokioSleeper))
    }

    /// Creates a relay on top of an explicit broker and retry sleeper.
    pub fn with_broker(config: RelayConfig, broker: Arc<dyn Broker>, sleeper: Arc<dyn Sleeper>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let bridge = Arc::new(BrokerBridge::new(
            broker,
            sleeper,
            config.broker.max_connect_attempts,
            config.broker.retry_delay(),
        ));
        let presence = Arc::new(PresenceBroadcaster::new(registry.clone(), bridge.clone()));
        let router = Arc::new(FrameRouter::new(registry.clone(), bridge.clone(), presence.clone()));
        let health = Arc::new(HealthManager::new(config.service_name.clone()));

        Self {
            config,
            registry,
            bridge,
            presence,
            router,
            health,
            shutdown_state: ShutdownState::new(),
        }
    }

    /// Binds the configured address and runs until [`Self::shutdown`].
    pub async fn start(&self) -> Result<(), RelayError> {
        self.start_with_shutdown_state(self.shutdown_state.clone()).await
    }

    /// Binds the configured address and runs until `shutdown_state` is
    /// initiated.
    pub async fn start_with_shutdown_state(&self, shutdown_state: ShutdownState) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_address).await.map_err(|e| {
            RelayError::Network(format!("Failed to bind {}: {e}", self.config.bind_address))
        })?;
        self.serve(listener, shutdown_state).await
    }

    /// Runs the relay on an already bound listener.
    ///
    /// Returns `Ok(())` after a graceful shutdown, or
    /// [`RelayError::BrokerExhausted`] if the broker could not be reached.
    pub async fn serve(&self, listener: TcpListener, shutdown: ShutdownState) -> Result<(), RelayError> {
        validate_ws_path(&self.config.ws_path).map_err(RelayError::Config)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::Network(format!("Listener has no local address: {e}")))?;
        info!("🚀 Starting chat relay on {}", local_addr);
        info!("🔌 WebSocket endpoint: ws://{}{}", local_addr, self.config.ws_path);

        let (sessions, sessions_done) = mpsc::channel(1);
        let ctx = Arc::new(ConnectionContext {
            registry: self.registry.clone(),
            router: self.router.clone(),
            presence: self.presence.clone(),
            health: self.health.clone(),
            shutdown: shutdown.clone(),
            max_connections: self.config.max_connections,
            outbound_queue_size: self.config.outbound_queue_size,
            sessions,
        });
        let app = build_router(ctx, &self.config.ws_path);
        let http_task = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                    .with_graceful_shutdown(async move { shutdown.wait().await })
                    .await
            })
        };
        let listener = Listener { http_task, sessions_done };

        let connected = tokio::select! {
            connected = self.bridge.connect() => Some(connected),
            _ = shutdown.wait() => None,
        };
        match connected {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                error!("❌ Broker unavailable: {}", e);
                shutdown.initiate_shutdown();
                self.finish(listener, &shutdown).await;
                return Err(e);
            }
            None => {
                self.finish(listener, &shutdown).await;
                return Ok(());
            }
        }

        let mut consumer = {
            let bridge = self.bridge.clone();
            let registry = self.registry.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { bridge.run_consumer(registry, shutdown).await })
        };
        let heartbeat = {
            let supervisor = HeartbeatSupervisor::new(
                self.registry.clone(),
                self.presence.clone(),
                self.config.heartbeat_interval(),
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move { supervisor.run(shutdown).await })
        };
        info!(
            "💓 Heartbeat every {}s, broker retry budget {} x {}ms",
            self.config.heartbeat_interval_secs,
            self.config.broker.max_connect_attempts,
            self.config.broker.retry_delay_ms
        );

        // Run until shutdown, or until the consumer gives up on the broker
        let finished_early = tokio::select! {
            _ = shutdown.wait() => None,
            joined = &mut consumer => Some(joined),
        };
        shutdown.initiate_shutdown();

        let joined = match finished_early {
            Some(joined) => joined,
            None => consumer.await,
        };
        let outcome = joined.unwrap_or_else(|e| Err(RelayError::Internal(format!("Broker consumer task failed: {e}"))));

        if let Err(e) = heartbeat.await {
            warn!("Heartbeat task ended abnormally: {}", e);
        }
        self.finish(listener, &shutdown).await;

        info!("Relay stopped");
        outcome
    }

    /// Closes the publish path, sends a close frame to every socket and
    /// waits, within [`DRAIN_TIMEOUT`] per stage, for the listener and the
    /// sessions to finish.
    async fn finish(&self, listener: Listener, shutdown: &ShutdownState) {
        info!("🧹 Performing relay cleanup...");
        self.bridge.close().await;

        let sockets = self.registry.drain().await;
        debug!(sockets = sockets.len(), "Sending close frames");
        for (_, outbound) in &sockets {
            outbound.close_or_terminate("server shutting down");
        }

        let Listener { http_task, mut sessions_done } = listener;
        match tokio::time::timeout(DRAIN_TIMEOUT, http_task).await {
            Ok(Ok(Ok(()))) => debug!("HTTP listener stopped"),
            Ok(Ok(Err(e))) => warn!("HTTP listener failed: {}", e),
            Ok(Err(e)) => warn!("HTTP listener task ended abnormally: {}", e),
            Err(_) => warn!("⏰ HTTP connections still open after {}s", DRAIN_TIMEOUT.as_secs()),
        }
        // Closes once the router and every session have dropped their sender
        if tokio::time::timeout(DRAIN_TIMEOUT, sessions_done.recv()).await.is_err() {
            warn!("⏰ Sessions still running after {}s", DRAIN_TIMEOUT.as_secs());
        }

        shutdown.complete_shutdown();
        info!("✅ Relay cleanup completed");
    }

    /// Initiates shutdown of a relay started with [`Self::start`].
    pub async fn shutdown(&self) -> Result<(), RelayError> {
        info!("🛑 Shutting down relay...");
        self.shutdown_state.initiate_shutdown();
        Ok(())
    }

    /// Current counters for monitoring.
    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            connections: self.registry.connection_count().await,
            users: self.registry.size().await,
            bridge_state: self.bridge.state().await,
            broker_failures: self.bridge.failures(),
            uptime_secs: self.health.uptime().as_secs(),
        }
    }

    /// Gets the shutdown state used by [`Self::start`].
    pub fn get_shutdown_state(&self) -> ShutdownState {
        self.shutdown_state.clone()
    }

    /// Gets the connection registry.
    pub fn get_registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Gets the broker bridge.
    pub fn get_bridge(&self) -> Arc<BrokerBridge> {
        self.bridge.clone()
    }

    /// Gets the health manager.
    pub fn get_health_manager(&self) -> Arc<HealthManager> {
        self.health.clone()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }
}

/// The running HTTP listener and the session tracker it feeds.
struct Listener {
    http_task: JoinHandle<io::Result<()>>,
    sessions_done: mpsc::Receiver<()>,
}
