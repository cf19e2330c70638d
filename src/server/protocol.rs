//! Relay wire protocol
//!
//! Text frames carry `senderId,receiverId,body`. Sender and receiver may be
//! empty; the body is everything after the second comma and is never split.

use thiserror::Error;

use crate::registry::RegistryError;

/// Expected value of the `Upgrade` header
pub const UPGRADE_PROTOCOL: &str = "websocket";

/// The only WebSocket protocol version negotiated
pub const WEBSOCKET_VERSION: &str = "13";

/// Default endpoint path for upgrade requests
pub const DEFAULT_ENDPOINT_PATH: &str = "/websocket";

/// Maximum size of an upgrade request (head plus body)
pub const MAX_REQUEST_SIZE: usize = 65535;

/// Field delimiter in relay payloads
pub const FIELD_DELIMITER: char = ',';

// ============================================================================
// Error Types
// ============================================================================

/// Faults raised while negotiating or serving a connection
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Protocol negotiation failed: {0}")]
    ProtocolNegotiation(String),

    #[error("Unsupported WebSocket version: {0}")]
    UnsupportedVersion(String),

    #[error("Unsupported frame kind: {0} (only text frames are accepted)")]
    UnsupportedFrameKind(&'static str),

    #[error("Malformed message: expected senderId,receiverId,body but got {0:?}")]
    MalformedMessage(String),

    #[error("Handshake not complete, cannot process frames")]
    HandshakeNotComplete,

    #[error("No upgrade request within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl RelayError {
    /// Whether this fault ends the connection
    ///
    /// Malformed payloads and delivery failures only drop the message.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MalformedMessage(_) | Self::Registry(_))
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;

// ============================================================================
// Messages
// ============================================================================

/// A parsed relay payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMessage {
    /// Identifier the sender registers under (may be empty)
    pub sender: String,
    /// Target identifier (may be empty)
    pub receiver: String,
    /// Free text, may itself contain commas
    pub body: String,
}

/// How a message should be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Sender and receiver both present
    Direct,
    /// Sender present, receiver empty
    Broadcast,
    /// Neither sender nor receiver present
    Echo,
}

impl RelayMessage {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            body: body.into(),
        }
    }

    /// Parse a text payload into its three fields
    pub fn parse(payload: &str) -> RelayResult<Self> {
        let mut fields = payload.splitn(3, FIELD_DELIMITER);
        match (fields.next(), fields.next(), fields.next()) {
            (Some(sender), Some(receiver), Some(body)) => Ok(Self::new(sender, receiver, body)),
            _ => Err(RelayError::MalformedMessage(payload.to_string())),
        }
    }

    /// Classify the message by which identifiers are present
    ///
    /// A receiver without a sender carries no identity to deliver from and is
    /// handled as an echo.
    pub fn route(&self) -> Route {
        match (self.sender.is_empty(), self.receiver.is_empty()) {
            (false, false) => Route::Direct,
            (false, true) => Route::Broadcast,
            (true, _) => Route::Echo,
        }
    }

    /// Serialize back to wire form
    pub fn to_payload(&self) -> String {
        format!(
            "{}{delim}{}{delim}{}",
            self.sender,
            self.receiver,
            self.body,
            delim = FIELD_DELIMITER
        )
    }
}
