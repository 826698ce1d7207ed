//! # Chat Relay - Main Entry Point
//!
//! Runs one chat relay instance. This entry point handles CLI parsing,
//! configuration loading, logging setup and application lifecycle.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! relay
//!
//! # Specify custom configuration
//! relay --config production.toml
//!
//! # Single instance without a broker
//! relay --broker memory --bind 0.0.0.0:8080 --log-level debug
//!
//! # JSON logging for production
//! AMQP_URL=amqp://rabbitmq:5672 relay --json-logs
//! ```
//!
//! ## Configuration
//!
//! The relay loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//! `AMQP_URL` and `PORT` override the file; command-line flags override both.
//!
//! ## Signal Handling
//!
//! SIGINT (Ctrl+C) and SIGTERM start a graceful shutdown: consumption stops,
//! the publish path closes and every client receives a close frame. A second
//! signal exits immediately.
//!
//! ## Exit Codes
//!
//! * **0**: Graceful shutdown
//! * **1**: Invalid configuration, bind failure, or broker retry budget exhausted

use tracing::error;

mod app;
mod cli;
mod config;
mod logging;
mod signals;

use app::Application;
use cli::CliArgs;
use config::AppConfig;

/// Parses arguments, sets up logging and runs the relay to completion.
///
/// Called from an async context (`main` with `#[tokio::main]`), so it does
/// not start a runtime itself.
pub async fn init() -> Result<(), Box<dyn std::error::Error>> {
    // Parse CLI arguments first
    let args = CliArgs::parse();

    // Load configuration to get logging settings
    let mut log_settings = AppConfig::load_from_file(&args.config_path)
        .await
        .unwrap_or_default()
        .logging;
    if let Some(level) = &args.log_level {
        log_settings.level = level.clone();
    }

    // Setup logging before anything else
    if let Err(e) = logging::setup_logging(&log_settings, args.json_logs) {
        eprintln!("❌ Failed to setup logging: {e}");
        std::process::exit(1);
    }

    // Create and run application
    match Application::new(args).await {
        Ok(app) => {
            if let Err(e) = app.run().await {
                error!("❌ Application error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to start application: {e}");
            std::process::exit(1);
        }
    }

    Ok(())
}

// Re-export main types for potential library usage
pub use config::{BrokerSettings, LoggingSettings, ServerSettings};

#[cfg(test)]
mod tests {
    use super::*;
    use chat_relay::BrokerKind;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_converts() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let relay_config = config
            .to_relay_config()
            .expect("Default config should convert to RelayConfig");
        assert_eq!(relay_config.max_connections, 1000);
        assert_eq!(relay_config.ws_path, "/chat/ws");
    }

    #[tokio::test]
    async fn test_application_applies_cli_overrides() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("relay.toml");
        let config_arg = config_path.to_string_lossy().to_string();

        let args = CliArgs::try_parse_from([
            "relay",
            "--config",
            config_arg.as_str(),
            "--bind",
            "127.0.0.1:0",
            "--broker",
            "memory",
            "--log-level",
            "warn",
        ])
        .unwrap();

        let app = Application::new(args).await.unwrap();
        let relay = app.server_config();
        assert_eq!(relay.broker.kind, BrokerKind::Memory);
        assert_eq!(relay.bind_address.port(), 0);
        assert!(config_path.exists());
    }

    #[tokio::test]
    async fn test_application_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let config_arg = dir.path().join("relay.toml").to_string_lossy().to_string();

        let args = CliArgs::try_parse_from([
            "relay",
            "--config",
            config_arg.as_str(),
            "--log-level",
            "chatty",
        ])
        .unwrap();

        assert!(Application::new(args).await.is_err());
    }
}
