//! WebSocket server implementation
//!
//! Listens on the configured address, runs one task per connection and
//! drives each connection's session: upgrade, frame loop, release.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{error::Elapsed, timeout};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use super::handshake::{read_request, HttpResponse};
use super::protocol::{RelayError, RelayResult, MAX_REQUEST_SIZE};
use super::router::MessageRouter;
use super::session::{FrameOutcome, Session};
use crate::config::{RelayConfig, ServerSettings};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

/// How long a closing connection may take to flush its last frames
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long shutdown waits for open connections to release
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Deadline for the upgrade request when no idle timeout is configured
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket relay server
pub struct RelayServer {
    settings: ServerSettings,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RelayServer {
    /// Create a new relay server with a fresh registry
    pub fn new(config: RelayConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(MessageRouter::new(config.router, Arc::clone(&registry)));
        Self {
            settings: config.server,
            registry,
            router,
            shutdown_tx,
        }
    }

    /// Shared connection registry
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Get a shutdown signal receiver (for external components to listen for shutdown)
    #[allow(dead_code)]
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the listening socket with the configured backlog and keep-alive
    pub fn bind(&self) -> anyhow::Result<TcpListener> {
        let addr = self.settings.socket_addr()?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.set_keepalive(self.settings.keepalive)?;
        socket.bind(addr)?;
        Ok(socket.listen(self.settings.backlog)?)
    }

    /// Bind and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// Returns after a shutdown signal once open connections have released,
    /// or the grace period has passed. The registry is cleared on return.
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            "Relay listening on ws://{}{}",
            addr,
            self.router.config().endpoint_path
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let router = Arc::clone(&self.router);
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            let idle_timeout = self.settings.idle_timeout();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer_addr, router, idle_timeout, shutdown_rx).await {
                                    match e {
                                        RelayError::Io(_) | RelayError::WebSocket(_) => {
                                            error!("Connection error from {}: {}", peer_addr, e)
                                        }
                                        _ => debug!("Connection from {} ended: {}", peer_addr, e),
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let open = self.registry.connection_count().await;
        if open > 0 {
            info!("Waiting for {} open connections to close...", open);
            let drained = timeout(SHUTDOWN_GRACE, async {
                while self.registry.connection_count().await > 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            })
            .await;
            if drained.is_err() {
                warn!("Shutdown grace period elapsed with connections still open");
            }
        }

        self.registry.clear().await;
        Ok(())
    }
}

/// Handle a single connection from accept to release
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Arc<MessageRouter>,
    idle_timeout: Option<Duration>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> RelayResult<()> {
    let (handle, outbound_rx) = ConnectionHandle::channel(Some(peer_addr));
    let mut session = Session::connect(handle, router).await;

    let result = match upgrade(&mut session, stream, idle_timeout, &mut shutdown_rx).await {
        Ok(Some(ws_stream)) => {
            relay(&mut session, ws_stream, outbound_rx, idle_timeout, &mut shutdown_rx).await
        }
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };

    session.close().await;
    result
}

/// Read and answer the upgrade request
///
/// Returns `None` if the server shut down before the request arrived.
async fn upgrade(
    session: &mut Session,
    mut stream: TcpStream,
    idle_timeout: Option<Duration>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> RelayResult<Option<WebSocketStream<TcpStream>>> {
    let deadline = idle_timeout.unwrap_or(HANDSHAKE_TIMEOUT);
    let read = tokio::select! {
        read = timeout(deadline, read_request(&mut stream, MAX_REQUEST_SIZE)) => read,
        _ = shutdown_rx.recv() => {
            info!("Shutdown signal received, dropping {} before handshake", session.handle());
            return Ok(None);
        }
    };

    let (request, leftover) = match read {
        Err(_) => {
            info!("No upgrade request from {} within {:?}", session.handle(), deadline);
            return Err(RelayError::HandshakeTimeout(deadline));
        }
        Ok(Ok(read)) => read,
        Ok(Err(RelayError::Io(e))) => return Err(RelayError::Io(e)),
        Ok(Err(e)) => {
            let response = session.reject_upgrade(&e);
            write_rejection(&mut stream, &response).await;
            return Err(e);
        }
    };

    match session.handle_upgrade(&request) {
        Ok(response) => {
            stream.write_all(&response.to_bytes()).await?;
        }
        Err(e) => {
            write_rejection(&mut stream, &HttpResponse::rejection(&e)).await;
            return Err(e);
        }
    }

    Ok(Some(
        WebSocketStream::from_partially_read(stream, leftover, Role::Server, None).await,
    ))
}

/// Write a rejection and close, whatever the client's keep-alive preference
async fn write_rejection(stream: &mut TcpStream, response: &HttpResponse) {
    if let Err(e) = stream.write_all(&response.to_bytes()).await {
        debug!("Failed to write {} response: {}", response.status, e);
    }
    let _ = stream.shutdown().await;
}

/// Frame loop for an open connection
async fn relay(
    session: &mut Session,
    ws_stream: WebSocketStream<TcpStream>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    idle_timeout: Option<Duration>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> RelayResult<()> {
    let (ws_sender, mut ws_receiver) = ws_stream.split();
    let writer = tokio::spawn(writer_task(ws_sender, outbound_rx));
    let writer_abort = writer.abort_handle();

    let mut result = Ok(());
    loop {
        tokio::select! {
            frame = next_frame(&mut ws_receiver, idle_timeout) => {
                match frame {
                    Ok(Some(Ok(message))) => match session.handle_frame(message).await {
                        Ok(FrameOutcome::Continue) => {}
                        Ok(FrameOutcome::Close) => break,
                        Err(e) => {
                            session.fail(&e);
                            result = Err(e);
                            break;
                        }
                    },
                    Ok(Some(Err(e))) => {
                        warn!("WebSocket error from {}: {}", session.handle(), e);
                        result = Err(e.into());
                        break;
                    }
                    Ok(None) => {
                        info!("Connection closed by {}", session.handle());
                        break;
                    }
                    Err(_) => {
                        info!("Closing idle connection {}", session.handle());
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", session.handle());
                break;
            }
        }
    }

    // Queues the final close frame unless one was already sent
    session.close().await;

    if timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!("Writer for {} did not drain in time", session.handle());
        writer_abort.abort();
    }

    result
}

/// Next inbound frame, bounded by the idle timeout when one is set
async fn next_frame<S>(
    receiver: &mut S,
    idle_timeout: Option<Duration>,
) -> Result<Option<Result<Message, WsError>>, Elapsed>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    match idle_timeout {
        Some(limit) => timeout(limit, receiver.next()).await,
        None => Ok(receiver.next().await),
    }
}

/// Drain the outbound queue into the socket until a close frame goes out
async fn writer_task<S>(mut sink: S, mut outbound_rx: mpsc::UnboundedReceiver<Message>)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = outbound_rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                    debug!("Socket closed while writing")
                }
                e => warn!("Failed to write frame: {}", e),
            }
            break;
        }
        if closing {
            break;
        }
    }
}
