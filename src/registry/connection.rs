//! Connection handles
//!
//! A handle is the registry's non-owning view of a live connection. The
//! connection task owns the socket; the handle only feeds its outbound queue.

use std::fmt;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Errors that can occur during registry operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    #[error("User identifier cannot be empty")]
    EmptyUserId,
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Locally unique connection identifier, assigned at accept time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cloneable write side of a connection
///
/// Writes are fire-and-forget: frames are queued on an unbounded channel and
/// drained into the socket by the connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    /// Create a handle around an existing outbound queue
    pub fn new(peer_addr: Option<SocketAddr>, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_addr,
            tx,
        }
    }

    /// Create a handle together with the receiving end of its outbound queue
    pub fn channel(peer_addr: Option<SocketAddr>) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(peer_addr, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a frame for this connection
    pub fn send(&self, message: Message) -> RegistryResult<()> {
        self.tx
            .send(message)
            .map_err(|_| RegistryError::ConnectionClosed(self.id))
    }

    /// Queue a text frame for this connection
    pub fn send_text(&self, text: impl Into<String>) -> RegistryResult<()> {
        self.send(Message::Text(text.into()))
    }

    /// Whether the writer side has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr {
            Some(addr) => write!(f, "{} ({})", self.id, addr),
            None => write!(f, "{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[tokio::test]
    async fn test_send_text_queues_frame() {
        let (handle, mut rx) = ConnectionHandle::channel(None);
        handle.send_text("hello").unwrap();
        assert_eq!(rx.recv().await, Some(Message::Text("hello".to_string())));
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (handle, rx) = ConnectionHandle::channel(None);
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(
            handle.send_text("lost"),
            Err(RegistryError::ConnectionClosed(handle.id()))
        );
    }

    #[test]
    fn test_display_includes_peer_addr() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let (handle, _rx) = ConnectionHandle::channel(Some(addr));
        assert!(handle.to_string().ends_with("(127.0.0.1:4000)"));
    }
}
