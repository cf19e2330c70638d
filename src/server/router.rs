//! Message router
//!
//! Interprets text payloads from open connections and delivers them through
//! the registry: direct to one bound user, broadcast to everyone, or echoed
//! back to the origin only.

use std::sync::Arc;

use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::protocol::{RelayMessage, RelayResult, Route};
use crate::config::RouterConfig;
use crate::registry::{BindOutcome, ConnectionHandle, ConnectionRegistry};

/// What happened to a routed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the connection bound to `receiver`
    Delivered { receiver: String },
    /// No live connection is bound to `receiver`
    Undeliverable { receiver: String },
    /// Broadcast queued for `delivered` connections
    Broadcast { delivered: usize },
    /// Acknowledged back to the origin only
    Echoed,
}

/// Routes parsed relay messages between registered connections
#[derive(Debug)]
pub struct MessageRouter {
    config: RouterConfig,
    registry: Arc<ConnectionRegistry>,
}

impl MessageRouter {
    pub fn new(config: RouterConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self { config, registry }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Parse and route a text payload received on `origin`
    ///
    /// A payload without all three fields fails with `MalformedMessage`; the
    /// caller drops it and keeps the connection.
    pub async fn route(&self, payload: &str, origin: &ConnectionHandle) -> RelayResult<RouteOutcome> {
        let message = RelayMessage::parse(payload)?;
        self.route_message(&message, origin).await
    }

    /// Route an already parsed message
    pub async fn route_message(
        &self,
        message: &RelayMessage,
        origin: &ConnectionHandle,
    ) -> RelayResult<RouteOutcome> {
        if !message.sender.is_empty() {
            match self.registry.bind_if_absent(&message.sender, origin.id()).await {
                Ok(BindOutcome::Occupied(owner)) => debug!(
                    "User {} already bound to {}, not rebinding to {}",
                    message.sender, owner, origin
                ),
                Ok(_) => {}
                Err(e) => warn!("Could not bind {} to {}: {}", message.sender, origin, e),
            }
        }

        match message.route() {
            Route::Direct => self.send_direct(message, origin).await,
            Route::Broadcast if self.config.broadcast_on_empty_receiver => {
                Ok(self.broadcast(message).await)
            }
            Route::Broadcast | Route::Echo => self.echo(message, origin),
        }
    }

    async fn send_direct(
        &self,
        message: &RelayMessage,
        origin: &ConnectionHandle,
    ) -> RelayResult<RouteOutcome> {
        let receiver = message.receiver.clone();

        let delivered = match self.registry.lookup(&receiver).await {
            Some(target) => match target.send_text(render(&self.config.direct_template, message)) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Direct send from {} to {} failed: {}", message.sender, receiver, e);
                    false
                }
            },
            None => false,
        };

        if delivered {
            debug!("Delivered message from {} to {}", message.sender, receiver);
            return Ok(RouteOutcome::Delivered { receiver });
        }

        debug!("No connection bound to {}, message from {} dropped", receiver, message.sender);
        if self.config.notify_undeliverable {
            origin.send_text(render(&self.config.undeliverable_template, message))?;
        }
        Ok(RouteOutcome::Undeliverable { receiver })
    }

    async fn broadcast(&self, message: &RelayMessage) -> RouteOutcome {
        info!("User {} broadcast: {}", message.sender, message.body);
        let frame = Message::Text(render(&self.config.broadcast_template, message));
        let delivered = self.registry.broadcast_all(frame).await;
        RouteOutcome::Broadcast { delivered }
    }

    fn echo(&self, message: &RelayMessage, origin: &ConnectionHandle) -> RelayResult<RouteOutcome> {
        debug!("Message from {} kept at server", origin);
        origin.send_text(render(&self.config.echo_template, message))?;
        Ok(RouteOutcome::Echoed)
    }
}

/// Fill `{sender}`, `{receiver}` and `{body}` placeholders in one pass
fn render(template: &str, message: &RelayMessage) -> String {
    let fields = [
        ("{sender}", message.sender.as_str()),
        ("{receiver}", message.receiver.as_str()),
        ("{body}", message.body.as_str()),
    ];

    let mut out = String::with_capacity(template.len() + message.body.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match fields.iter().find(|(placeholder, _)| tail.starts_with(placeholder)) {
            Some((placeholder, value)) => {
                out.push_str(value);
                rest = &tail[placeholder.len()..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::server::protocol::RelayError;

    async fn connect(registry: &ConnectionRegistry) -> (ConnectionHandle, UnboundedReceiver<Message>) {
        let (handle, rx) = ConnectionHandle::channel(None);
        registry.add(handle.clone()).await;
        (handle, rx)
    }

    fn router(config: RouterConfig) -> (MessageRouter, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        (MessageRouter::new(config, Arc::clone(&registry)), registry)
    }

    fn text(rx: &mut UnboundedReceiver<Message>) -> Option<String> {
        match rx.try_recv() {
            Ok(Message::Text(text)) => Some(text),
            _ => None,
        }
    }

    #[test]
    fn test_render_placeholders() {
        let msg = RelayMessage::new("u1", "u2", "hi {sender}");
        assert_eq!(render("{sender} -> {receiver}: {body}", &msg), "u1 -> u2: hi {sender}");
        assert_eq!(render("{unknown} {", &msg), "{unknown} {");
    }

    #[tokio::test]
    async fn test_first_message_binds_sender() {
        let (router, registry) = router(RouterConfig::default());
        let (a, _rx_a) = connect(&registry).await;

        router.route(",,anything", &a).await.unwrap();
        assert_eq!(registry.user_count().await, 0);

        router.route("u1,,hi", &a).await.unwrap();
        assert_eq!(registry.lookup("u1").await.map(|h| h.id()), Some(a.id()));
    }

    #[tokio::test]
    async fn test_bound_sender_is_not_stolen() {
        let (router, registry) = router(RouterConfig::default());
        let (a, _rx_a) = connect(&registry).await;
        let (b, _rx_b) = connect(&registry).await;

        router.route("u1,,first", &a).await.unwrap();
        router.route("u1,,second", &b).await.unwrap();
        assert_eq!(registry.lookup("u1").await.map(|h| h.id()), Some(a.id()));
    }

    #[tokio::test]
    async fn test_direct_send_reaches_only_receiver() {
        let (router, registry) = router(RouterConfig::default());
        let (a, mut rx_a) = connect(&registry).await;
        let (b, mut rx_b) = connect(&registry).await;
        let (_c, mut rx_c) = connect(&registry).await;
        registry.bind("u1", a.id()).await.unwrap();
        registry.bind("u2", b.id()).await.unwrap();

        let outcome = router.route("u1,u2,hello", &a).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Delivered { receiver: "u2".into() });

        let frame = text(&mut rx_b).unwrap();
        assert!(frame.contains("hello"));
        assert!(frame.contains("u1"));
        assert!(text(&mut rx_b).is_none());
        assert!(text(&mut rx_a).is_none());
        assert!(text(&mut rx_c).is_none());
    }

    #[tokio::test]
    async fn test_direct_send_to_unknown_user_notifies_sender() {
        let (router, registry) = router(RouterConfig::default());
        let (a, mut rx_a) = connect(&registry).await;

        let outcome = router.route("u1,ghost,hello", &a).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Undeliverable { receiver: "ghost".into() });
        assert_eq!(text(&mut rx_a).unwrap(), "user ghost is not online");
    }

    #[tokio::test]
    async fn test_direct_send_to_unknown_user_silent() {
        let config = RouterConfig {
            notify_undeliverable: false,
            ..RouterConfig::default()
        };
        let (router, registry) = router(config);
        let (a, mut rx_a) = connect(&registry).await;

        router.route("u1,ghost,hello", &a).await.unwrap();
        assert!(text(&mut rx_a).is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_including_sender() {
        let (router, registry) = router(RouterConfig::default());
        let (a, mut rx_a) = connect(&registry).await;
        let (_b, mut rx_b) = connect(&registry).await;
        let (_c, mut rx_c) = connect(&registry).await;

        let outcome = router.route("u1,,hi", &a).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Broadcast { delivered: 3 });

        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            let frame = text(rx).unwrap();
            assert_eq!(frame, "user u1 broadcast: hi");
            assert!(text(rx).is_none());
        }
    }

    #[tokio::test]
    async fn test_broadcast_disabled_echoes_instead() {
        let config = RouterConfig {
            broadcast_on_empty_receiver: false,
            ..RouterConfig::default()
        };
        let (router, registry) = router(config);
        let (a, mut rx_a) = connect(&registry).await;
        let (_b, mut rx_b) = connect(&registry).await;

        let outcome = router.route("u1,,hi", &a).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Echoed);
        assert!(text(&mut rx_a).is_some());
        assert!(text(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn test_echo_only_reaches_origin() {
        let (router, registry) = router(RouterConfig::default());
        let (a, mut rx_a) = connect(&registry).await;
        let (_b, mut rx_b) = connect(&registry).await;

        let outcome = router.route(",,ping", &a).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Echoed);
        assert!(text(&mut rx_a).unwrap().contains("ping"));
        assert!(text(&mut rx_b).is_none());
    }

    #[tokio::test]
    async fn test_malformed_message_is_rejected_without_side_effects() {
        let (router, registry) = router(RouterConfig::default());
        let (a, mut rx_a) = connect(&registry).await;

        let result = router.route("u1,u2", &a).await;
        assert!(matches!(result, Err(RelayError::MalformedMessage(_))));
        assert!(!registry.contains("u1").await);
        assert!(text(&mut rx_a).is_none());
    }
}
