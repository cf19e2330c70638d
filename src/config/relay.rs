//! Relay configuration
//!
//! Loads `[server]` and `[router]` tables from a TOML file. Missing files and
//! missing keys fall back to defaults.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::server::DEFAULT_ENDPOINT_PATH;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid bind address {0}")]
    InvalidAddress(String),
    #[error("Endpoint path must start with '/': {0}")]
    InvalidPath(String),
}

/// Listening transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Pending connection queue length
    pub backlog: u32,
    /// Enable TCP keep-alive on accepted sockets
    pub keepalive: bool,
    /// Close open connections idle for this many seconds (0 disables)
    pub idle_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8888,
            backlog: 5,
            keepalive: true,
            idle_timeout_secs: 0,
        }
    }
}

impl ServerSettings {
    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.bind, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidAddress(addr))
    }

    /// Idle timeout, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

/// Message routing settings
///
/// Templates accept `{sender}`, `{receiver}` and `{body}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Path upgrade requests must target
    pub endpoint_path: String,
    /// Broadcast messages that name a sender but no receiver
    pub broadcast_on_empty_receiver: bool,
    /// Tell the sender when a direct message has no live receiver
    pub notify_undeliverable: bool,
    /// Frame delivered to the receiver of a direct message
    pub direct_template: String,
    /// Frame delivered to every connection on broadcast
    pub broadcast_template: String,
    /// Acknowledgment returned to the origin of an echo
    pub echo_template: String,
    /// Notice returned to the sender of an undeliverable message
    pub undeliverable_template: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            endpoint_path: DEFAULT_ENDPOINT_PATH.to_string(),
            broadcast_on_empty_receiver: true,
            notify_undeliverable: true,
            direct_template: "user {sender} says: {body}".to_string(),
            broadcast_template: "user {sender} broadcast: {body}".to_string(),
            echo_template: "server received: {body}".to_string(),
            undeliverable_template: "user {receiver} is not online".to_string(),
        }
    }
}

/// Complete relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub router: RouterConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that TOML typing alone does not constrain
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;
        if !self.router.endpoint_path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.router.endpoint_path.clone()));
        }
        Ok(())
    }
}
