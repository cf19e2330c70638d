//! Chat Relay Server
//!
//! WebSocket relay for short text messages. Clients register an identifier
//! with their first message and then talk directly to another user, broadcast
//! to everyone, or send to the server alone.

mod config;
mod registry;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use config::RelayConfig;
use server::RelayServer;

/// Chat Relay Server
///
/// WebSocket relay with direct, broadcast and echo routing
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on [default: 8888]
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address [default: 0.0.0.0]
    #[arg(long)]
    bind: Option<String>,

    /// Endpoint path for upgrade requests [default: /websocket]
    #[arg(long)]
    path: Option<String>,

    /// Pending connection queue length [default: 5]
    #[arg(long)]
    backlog: Option<u32>,

    /// Close connections idle for this many seconds (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Load the config file, if any, and apply command line overrides
    fn into_config(self) -> anyhow::Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)?,
            None => RelayConfig::default(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(path) = self.path {
            config.router.endpoint_path = path;
        }
        if let Some(backlog) = self.backlog {
            config.server.backlog = backlog;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            config.server.idle_timeout_secs = idle_timeout;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    info!("Chat Relay v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;

    // Create and start the relay server
    let server = Arc::new(RelayServer::new(config));
    let server_handle = Arc::clone(&server);

    // Spawn shutdown signal handler
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Initiating graceful shutdown...");
        server_handle.shutdown();
    });

    // Run the server
    server.run().await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_defaults() {
        let args = Args::parse_from([
            "chat-relay",
            "--port",
            "9001",
            "--path",
            "/chat",
            "--idle-timeout",
            "60",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.backlog, 5);
        assert_eq!(config.router.endpoint_path, "/chat");
        assert_eq!(config.server.idle_timeout_secs, 60);
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("relay.toml");
        std::fs::write(&path, "[server]\nport = 7000\nbacklog = 64\n").unwrap();

        let args = Args::parse_from([
            "chat-relay",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7001",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.server.port, 7001);
        assert_eq!(config.server.backlog, 64);
    }

    #[test]
    fn test_cli_rejects_bad_path() {
        let args = Args::parse_from(["chat-relay", "--path", "chat"]);
        assert!(args.into_config().is_err());
    }
}
