//! Main application logic and lifecycle management.
//!
//! This module contains the `Application` struct that orchestrates relay
//! startup, periodic monitoring and shutdown.

use crate::{
    cli::CliArgs,
    config::{parse_broker_kind, AppConfig},
    logging::display_banner,
    signals::{setup_signal_handlers, wait_for_signal},
};
use chat_relay::{BrokerKind, RelayError, RelayServer, ShutdownState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How often relay statistics are logged.
const MONITORING_INTERVAL: Duration = Duration::from_secs(60);
/// How long the relay gets to close its sockets after a signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Main application struct.
///
/// Owns the merged configuration and the relay server, and drives the
/// process from startup to exit.
pub struct Application {
    /// Loaded application configuration
    config: AppConfig,
    /// Relay server instance
    server: Arc<RelayServer>,
}

impl Application {
    /// Creates a new application instance.
    ///
    /// # Process
    ///
    /// 1. Load configuration from file (creating default if missing)
    /// 2. Apply `AMQP_URL` and `PORT` from the environment
    /// 3. Apply command-line argument overrides
    /// 4. Validate merged configuration
    /// 5. Display startup banner and create the relay
    pub async fn new(args: CliArgs) -> Result<Self, Box<dyn std::error::Error>> {
        info!("🔧 Loading configuration from: {}", args.config_path.display());
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        config
            .apply_env_overrides()
            .map_err(|e| format!("Invalid environment override: {e}"))?;

        // Apply CLI overrides
        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }

        if let Some(broker) = args.broker {
            config.broker.kind = parse_broker_kind(&broker)?;
        }

        if let Some(amqp_url) = args.amqp_url {
            config.broker.url = amqp_url;
        }

        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }

        if args.json_logs {
            config.logging.json_format = true;
        }

        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration loaded and validated successfully");

        display_banner();

        let server = Arc::new(RelayServer::new(config.to_relay_config()?));

        Ok(Self { config, server })
    }

    /// Runs the relay until a termination signal or a fatal relay error.
    ///
    /// Returns an error if the relay stopped on its own, which happens when
    /// the broker retry budget is exhausted.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        info!("🌟 Starting Chat Relay Application");
        self.log_configuration_summary();

        let shutdown_state = ShutdownState::new();

        let mut server_handle = {
            let server = self.server.clone();
            let shutdown_state = shutdown_state.clone();
            tokio::spawn(async move { server.start_with_shutdown_state(shutdown_state).await })
        };

        let monitoring_handle = {
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MONITORING_INTERVAL);
                interval.tick().await;

                loop {
                    interval.tick().await;
                    let stats = server.stats().await;
                    info!(
                        "📊 Relay Health - up {}s | {} connections | {} users | broker {:?} ({} failed attempts)",
                        stats.uptime_secs, stats.connections, stats.users, stats.bridge_state, stats.broker_failures
                    );
                }
            })
        };

        info!("✅ Chat relay is now running!");
        info!(
            "💬 Ready to accept connections on ws://{}{}",
            self.config.server.bind_address, self.config.server.ws_path
        );
        info!("🔍 Health monitoring active - stats every {} seconds", MONITORING_INTERVAL.as_secs());
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        let early_exit = tokio::select! {
            joined = &mut server_handle => Some(joined),
            signal = setup_signal_handlers(&shutdown_state) => {
                signal?;
                None
            }
        };

        monitoring_handle.abort();

        if let Some(joined) = early_exit {
            // The relay stopped without being asked to
            let outcome = flatten(joined);
            if let Err(e) = &outcome {
                error!("❌ Relay stopped: {}", e);
            }
            return outcome.map_err(Into::into);
        }

        // merciless shutdown
        tokio::spawn(async move {
            if let Err(e) = wait_for_signal().await {
                error!("Failed to set up merciless shutdown signal handler: {e}");
                return;
            }

            warn!("Shutdown handler received again! I'll make this quick.");
            std::process::exit(1);
        });

        info!("🛑 Shutdown signal received, closing client connections...");
        let outcome = match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server_handle).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                warn!("⏰ Relay did not stop within {}s, aborting", SHUTDOWN_TIMEOUT.as_secs());
                server_handle.abort();
                Ok(())
            }
        };

        let stats = self.server.stats().await;
        info!("📊 Final Statistics:");
        info!("  - Connections still open: {}", stats.connections);
        info!("  - Broker connection failures: {}", stats.broker_failures);
        info!("  - Uptime: {}s", stats.uptime_secs);
        info!("  - Shutdown complete: {}", shutdown_state.is_shutdown_complete());

        outcome?;
        info!("✅ Chat relay shutdown complete");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn server_config(&self) -> &chat_relay::RelayConfig {
        self.server.config()
    }

    /// Logs the configuration summary at startup.
    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  🔌 WebSocket path: {}", self.config.server.ws_path);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  💓 Heartbeat interval: {}s", self.config.server.heartbeat_interval_secs);
        match self.config.broker.kind {
            BrokerKind::Amqp => info!(
                "  📨 Broker: AMQP {} (exchange {}, queue {})",
                self.config.broker.url, self.config.broker.exchange, self.config.broker.queue
            ),
            BrokerKind::Memory => info!("  📨 Broker: in-process (single instance)"),
        }
        info!(
            "  🔁 Broker retries: {} x {}ms",
            self.config.broker.max_connect_attempts, self.config.broker.retry_delay_ms
        );
    }
}

fn flatten(joined: Result<Result<(), RelayError>, tokio::task::JoinError>) -> Result<(), RelayError> {
    joined.unwrap_or_else(|e| Err(RelayError::Internal(format!("Relay task failed: {e}"))))
}
