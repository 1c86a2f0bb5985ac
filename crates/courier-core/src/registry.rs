//! Connection registry.
//!
//! Maps each online identity to its single live [`Connection`]. This is the
//! only shared mutable structure in the delivery path; a single read/write
//! lock serializes mutations while lookups proceed in parallel. The lock is
//! never held across an `.await`.

use crate::connection::Connection;
use crate::message::Identity;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Registry of live connections, at most one per identity.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Identity, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `connection` as the live connection for its identity.
    ///
    /// Any previous connection for the same identity is evicted and closed.
    /// Closing only signals the old connection's tasks, so this returns
    /// without waiting on its transport.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let identity = connection.identity().to_string();
        let previous = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identity.clone(), Arc::clone(&connection));

        if let Some(prev) = &previous {
            prev.close();
            info!(
                identity = %identity,
                old = %prev.id(),
                new = %connection.id(),
                "Superseded existing connection"
            );
        } else {
            debug!(identity = %identity, connection = %connection.id(), "Registered");
        }

        previous
    }

    /// Remove and close the live connection for `identity`.
    pub fn unregister(&self, identity: &str) -> Option<Arc<Connection>> {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity);

        if let Some(conn) = &removed {
            conn.close();
            debug!(identity = %identity, connection = %conn.id(), "Unregistered");
        }
        removed
    }

    /// Remove `connection` only if it is still the live one for its identity.
    ///
    /// A reader whose connection was superseded must not evict its successor.
    pub fn remove_if_current(&self, connection: &Connection) -> bool {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let is_current = connections
            .get(connection.identity())
            .map_or(false, |live| live.id() == connection.id());

        if is_current {
            connections.remove(connection.identity());
            debug!(identity = %connection.identity(), connection = %connection.id(), "Removed");
        }
        is_current
    }

    /// The live connection for `identity`, if any.
    #[must_use]
    pub fn lookup(&self, identity: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .cloned()
    }

    /// Whether `identity` currently has a live connection.
    #[must_use]
    pub fn is_online(&self, identity: &str) -> bool {
        self.lookup(identity).map_or(false, |conn| !conn.is_closed())
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
