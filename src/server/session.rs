//! Per-connection protocol state machine
//!
//! `Connected` -> `AwaitingUpgrade` -> `Open` -> `Closed`. Each connection
//! owns its session, including the negotiated handshake; nothing here is
//! shared between connections except the router and its registry.

use std::sync::Arc;
use std::time::Instant;

use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::handshake::{negotiate, HttpRequest, HttpResponse};
use super::params::parse_params;
use super::protocol::{RelayError, RelayResult};
use super::router::MessageRouter;
use crate::registry::ConnectionHandle;

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket accepted, no upgrade request yet
    Connected,
    /// Upgrade request received, negotiating
    AwaitingUpgrade,
    /// Handshake complete, frames flow
    Open,
    /// Terminal
    Closed,
}

/// What the transport should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    Close,
}

/// Negotiated handshake for one connection
#[derive(Debug, Clone)]
struct Handshake {
    path: String,
    completed_at: Instant,
}

/// Protocol state for a single connection
pub struct Session {
    handle: ConnectionHandle,
    router: Arc<MessageRouter>,
    state: ConnectionState,
    handshake: Option<Handshake>,
    released: bool,
}

impl Session {
    /// Start tracking a freshly accepted connection and register it
    pub async fn connect(handle: ConnectionHandle, router: Arc<MessageRouter>) -> Self {
        router.registry().add(handle.clone()).await;
        info!("Client connected: {}", handle);
        Self {
            handle,
            router,
            state: ConnectionState::Connected,
            handshake: None,
            released: false,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Process a complete upgrade request
    ///
    /// Returns the 101 response on success. On failure the session is closed;
    /// the caller writes `HttpResponse::rejection` for the returned fault.
    pub fn handle_upgrade(&mut self, request: &HttpRequest) -> RelayResult<HttpResponse> {
        self.state = ConnectionState::AwaitingUpgrade;

        match negotiate(request, &self.router.config().endpoint_path) {
            Ok(accept_key) => {
                self.handshake = Some(Handshake {
                    path: request.path().to_string(),
                    completed_at: Instant::now(),
                });
                self.state = ConnectionState::Open;
                info!("Handshake complete for {} on {}", self.handle, request.path());
                Ok(HttpResponse::switching_protocols(&accept_key))
            }
            Err(e) => {
                debug!(
                    "Rejected {} {} from {} with params {:?}",
                    request.method,
                    request.uri,
                    self.handle,
                    parse_params(request)
                );
                self.reject_upgrade(&e);
                Err(e)
            }
        }
    }

    /// Fail the upgrade, e.g. when the request could not be decoded
    pub fn reject_upgrade(&mut self, err: &RelayError) -> HttpResponse {
        warn!("Upgrade from {} rejected: {}", self.handle, err);
        self.state = ConnectionState::Closed;
        HttpResponse::rejection(err)
    }

    /// Dispatch one inbound frame
    ///
    /// Errors are fatal for this connection; the caller force-closes with
    /// [`Session::fail`]. Malformed text payloads are dropped here and do not
    /// surface as errors.
    pub async fn handle_frame(&mut self, message: Message) -> RelayResult<FrameOutcome> {
        if self.state != ConnectionState::Open || self.handshake.is_none() {
            return Err(RelayError::HandshakeNotComplete);
        }

        match message {
            Message::Text(text) => {
                debug!("Received message from {}: {}", self.handle, text);
                match self.router.route(&text, &self.handle).await {
                    Ok(outcome) => debug!("Routed message from {}: {:?}", self.handle, outcome),
                    Err(e) if !e.is_fatal() => warn!("Dropped message from {}: {}", self.handle, e),
                    Err(e) => return Err(e),
                }
                Ok(FrameOutcome::Continue)
            }
            Message::Ping(data) => {
                // The websocket layer queues the matching pong itself
                debug!("Ping from {} ({} bytes)", self.handle, data.len());
                Ok(FrameOutcome::Continue)
            }
            Message::Pong(_) => Ok(FrameOutcome::Continue),
            Message::Close(frame) => {
                info!("Client {} requested close", self.handle);
                // Echo the peer's close frame to complete the close handshake
                let _ = self.handle.send(Message::Close(frame));
                self.state = ConnectionState::Closed;
                Ok(FrameOutcome::Close)
            }
            Message::Binary(_) => Err(RelayError::UnsupportedFrameKind("binary")),
            Message::Frame(_) => Err(RelayError::UnsupportedFrameKind("raw")),
        }
    }

    /// Force-close after a fault, telling the peer why
    pub fn fail(&mut self, err: &RelayError) {
        warn!("Closing {} after fault: {}", self.handle, err);
        if self.state == ConnectionState::Open {
            let code = match err {
                RelayError::UnsupportedFrameKind(_) => CloseCode::Unsupported,
                RelayError::HandshakeNotComplete => CloseCode::Protocol,
                _ => CloseCode::Error,
            };
            let _ = self.handle.send(Message::Close(Some(CloseFrame {
                code,
                reason: err.to_string().into(),
            })));
        }
        self.state = ConnectionState::Closed;
    }

    /// Close the connection and release it from the registry
    ///
    /// Sends a normal close frame if the session was still open. Safe to call
    /// more than once.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Open {
            let _ = self.handle.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })));
        }
        self.state = ConnectionState::Closed;

        if self.released {
            return;
        }
        self.released = true;

        let unbound = self.router.registry().remove(self.handle.id()).await;
        match &self.handshake {
            Some(handshake) => info!(
                "Connection {} on {} closed after {:?} (unbound: {:?})",
                self.handle,
                handshake.path,
                handshake.completed_at.elapsed(),
                unbound
            ),
            None => info!("Connection {} closed before handshake", self.handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::config::RouterConfig;
    use crate::registry::ConnectionRegistry;
    use crate::server::handshake::parse_request;

    const UPGRADE_REQUEST: &str = "GET /websocket HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\r\n";

    fn router() -> Arc<MessageRouter> {
        let registry = Arc::new(ConnectionRegistry::new());
        Arc::new(MessageRouter::new(RouterConfig::default(), registry))
    }

    fn request(raw: &str) -> HttpRequest {
        parse_request(raw.as_bytes()).unwrap().unwrap().0
    }

    async fn open_session(router: &Arc<MessageRouter>) -> (Session, UnboundedReceiver<Message>) {
        let (handle, rx) = ConnectionHandle::channel(None);
        let mut session = Session::connect(handle, Arc::clone(router)).await;
        session.handle_upgrade(&request(UPGRADE_REQUEST)).unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn test_connect_registers_before_handshake() {
        let router = router();
        let (handle, _rx) = ConnectionHandle::channel(None);
        let session = Session::connect(handle.clone(), Arc::clone(&router)).await;

        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(router.registry().contains_connection(handle.id()).await);
    }

    #[tokio::test]
    async fn test_successful_upgrade_opens_session() {
        let router = router();
        let (session, _rx) = open_session(&router).await;
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_rejected_upgrade_closes_session() {
        let router = router();
        let (handle, _rx) = ConnectionHandle::channel(None);
        let mut session = Session::connect(handle.clone(), Arc::clone(&router)).await;

        let raw = UPGRADE_REQUEST.replace("Upgrade: websocket\r\n", "");
        let err = session.handle_upgrade(&request(&raw)).unwrap_err();
        assert!(matches!(err, RelayError::ProtocolNegotiation(_)));
        assert_eq!(HttpResponse::rejection(&err).status, 400);
        assert_eq!(session.state(), ConnectionState::Closed);

        session.close().await;
        assert!(!router.registry().contains_connection(handle.id()).await);
    }

    #[tokio::test]
    async fn test_frame_before_handshake_is_fault() {
        let router = router();
        let (handle, _rx) = ConnectionHandle::channel(None);
        let mut session = Session::connect(handle, router).await;

        let result = session.handle_frame(Message::Text(",,hi".into())).await;
        assert!(matches!(result, Err(RelayError::HandshakeNotComplete)));
    }

    #[tokio::test]
    async fn test_ping_keeps_session_open_without_extra_pong() {
        let router = router();
        let (mut session, mut rx) = open_session(&router).await;

        let outcome = session.handle_frame(Message::Ping(vec![1, 2, 3])).await.unwrap();
        assert_eq!(outcome, FrameOutcome::Continue);
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_text_is_routed() {
        let router = router();
        let (mut session, mut rx) = open_session(&router).await;

        let outcome = session.handle_frame(Message::Text(",,hello".into())).await.unwrap();
        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Text("server received: hello".into())
        );
    }

    #[tokio::test]
    async fn test_malformed_text_keeps_session_open() {
        let router = router();
        let (mut session, mut rx) = open_session(&router).await;

        let outcome = session.handle_frame(Message::Text("just text".into())).await.unwrap();
        assert_eq!(outcome, FrameOutcome::Continue);
        assert_eq!(session.state(), ConnectionState::Open);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_binary_frame_is_fault() {
        let router = router();
        let (mut session, mut rx) = open_session(&router).await;

        let err = session.handle_frame(Message::Binary(vec![0xff])).await.unwrap_err();
        assert!(matches!(err, RelayError::UnsupportedFrameKind("binary")));

        session.fail(&err);
        assert_eq!(session.state(), ConnectionState::Closed);
        match rx.try_recv().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, CloseCode::Unsupported),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_frame_is_acknowledged() {
        let router = router();
        let (mut session, mut rx) = open_session(&router).await;
        let id = session.handle().id();

        let outcome = session.handle_frame(Message::Close(None)).await.unwrap();
        assert_eq!(outcome, FrameOutcome::Close);
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(rx.try_recv().unwrap(), Message::Close(None));

        session.close().await;
        assert!(!router.registry().contains_connection(id).await);
        // No second close frame
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_releases_bindings() {
        let router = router();
        let (mut session, _rx) = open_session(&router).await;
        session.handle_frame(Message::Text("u1,,hi".into())).await.unwrap();
        assert!(router.registry().contains("u1").await);

        session.close().await;
        session.close().await;
        assert!(!router.registry().contains("u1").await);
        assert_eq!(router.registry().connection_count().await, 0);
    }
}
