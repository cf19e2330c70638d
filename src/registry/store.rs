//! Connection registry
//!
//! Holds the set of all open connections and the user identifier index.
//! Every connection referenced by the user index is also present in the
//! connection set; both maps live behind one lock so that holds across
//! concurrent add/remove/bind calls.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::{ConnectionHandle, ConnectionId, RegistryError, RegistryResult};

#[derive(Debug, Default)]
struct RegistryState {
    /// All open connections, keyed by id
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// User identifier -> bound connection
    users: HashMap<String, ConnectionId>,
}

/// Result of binding a user identifier to a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// Identifier was free
    Bound,
    /// Identifier was already bound to this connection
    Unchanged,
    /// Identifier was bound to another connection, which lost it
    Replaced(ConnectionId),
    /// Identifier is held by another connection and was left alone
    Occupied(ConnectionId),
}

/// Process-wide registry of live connections
///
/// Created at server start and shared with every connection task by `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    state: RwLock<RegistryState>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Adding the same connection twice is a no-op.
    pub async fn add(&self, handle: ConnectionHandle) {
        let mut state = self.state.write().await;
        let id = handle.id();
        if state.connections.insert(id, handle).is_none() {
            debug!("Connection {} added to registry", id);
        }
    }

    /// Remove a connection and every user identifier still bound to it
    ///
    /// Returns the identifiers that were unbound.
    pub async fn remove(&self, id: ConnectionId) -> Vec<String> {
        let mut state = self.state.write().await;
        state.connections.remove(&id);

        let mut unbound = Vec::new();
        state.users.retain(|user, bound| {
            if *bound == id {
                unbound.push(user.clone());
                false
            } else {
                true
            }
        });

        debug!(
            "Connection {} removed from registry (unbound {} users)",
            id,
            unbound.len()
        );
        unbound
    }

    /// Bind a user identifier to a registered connection
    ///
    /// Last bind wins: an identifier already bound to another connection is
    /// moved over without checking whether the previous one is still live.
    pub async fn bind(&self, user_id: &str, id: ConnectionId) -> RegistryResult<BindOutcome> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }

        let mut state = self.state.write().await;
        if !state.connections.contains_key(&id) {
            return Err(RegistryError::ConnectionNotFound(id));
        }

        let outcome = match state.users.insert(user_id.to_string(), id) {
            None => BindOutcome::Bound,
            Some(previous) if previous == id => BindOutcome::Unchanged,
            Some(previous) => {
                warn!(
                    "User {} rebound from connection {} to {}",
                    user_id, previous, id
                );
                BindOutcome::Replaced(previous)
            }
        };

        debug!("User {} bound to connection {}", user_id, id);
        Ok(outcome)
    }

    /// Bind a user identifier only if no connection holds it yet
    ///
    /// Check and insert happen under one write lock, so concurrent claims for
    /// the same identifier resolve to exactly one winner.
    pub async fn bind_if_absent(
        &self,
        user_id: &str,
        id: ConnectionId,
    ) -> RegistryResult<BindOutcome> {
        if user_id.is_empty() {
            return Err(RegistryError::EmptyUserId);
        }

        let mut state = self.state.write().await;
        if !state.connections.contains_key(&id) {
            return Err(RegistryError::ConnectionNotFound(id));
        }

        match state.users.get(user_id) {
            Some(current) if *current == id => Ok(BindOutcome::Unchanged),
            Some(current) => Ok(BindOutcome::Occupied(*current)),
            None => {
                state.users.insert(user_id.to_string(), id);
                debug!("User {} bound to connection {}", user_id, id);
                Ok(BindOutcome::Bound)
            }
        }
    }

    /// Look up the connection bound to a user identifier
    pub async fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        let state = self.state.read().await;
        state
            .users
            .get(user_id)
            .and_then(|id| state.connections.get(id))
            .cloned()
    }

    /// Check if a user identifier is bound
    pub async fn contains(&self, user_id: &str) -> bool {
        self.state.read().await.users.contains_key(user_id)
    }

    /// Check if a connection is registered
    pub async fn contains_connection(&self, id: ConnectionId) -> bool {
        self.state.read().await.connections.contains_key(&id)
    }

    /// User identifiers currently bound to a connection
    pub async fn users_of(&self, id: ConnectionId) -> Vec<String> {
        let state = self.state.read().await;
        let mut users: Vec<String> = state
            .users
            .iter()
            .filter(|(_, bound)| **bound == id)
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Write a frame to every registered connection
    ///
    /// Works on a snapshot taken under the read lock; a failed write is logged
    /// and does not stop delivery to the rest. Returns the number of
    /// connections the frame was queued for.
    pub async fn broadcast_all(&self, message: Message) -> usize {
        let targets: Vec<ConnectionHandle> = {
            let state = self.state.read().await;
            state.connections.values().cloned().collect()
        };

        let mut delivered = 0;
        for target in &targets {
            match target.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {} failed: {}", target, e),
            }
        }

        debug!("Broadcast delivered to {}/{} connections", delivered, targets.len());
        delivered
    }

    /// Number of open connections
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Number of bound user identifiers
    pub async fn user_count(&self) -> usize {
        self.state.read().await.users.len()
    }

    /// Drop every connection and binding. Used during server shutdown.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.connections.clear();
        state.users.clear();
    }

    #[cfg(test)]
    async fn invariant_holds(&self) -> bool {
        let state = self.state.read().await;
        state
            .users
            .values()
            .all(|id| state.connections.contains_key(id))
    }
}
