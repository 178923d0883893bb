//! Authoritative set of live subscriber connections.
//!
//! Mutations take a short write lock; [`ConnectionRegistry::snapshot_live`]
//! copies the handles out under a read lock so broadcasts never iterate the
//! map while it changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use fanout_core::{ConnectionId, FanoutError, Result};
use parking_lot::RwLock;
use tracing::{debug, error};

use super::connection::Connection;

struct Inner {
    connections: BTreeMap<ConnectionId, Arc<Connection>>,
    available: bool,
}

/// Registry of connections that should receive broadcasts.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty, available registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: BTreeMap::new(),
                available: true,
            }),
        }
    }

    /// Add a connection.
    ///
    /// Fails with [`FanoutError::DuplicateIdentifier`] if the id is already
    /// present (the existing entry is kept) and with
    /// [`FanoutError::RegistryUnavailable`] after [`close`](Self::close).
    pub fn register(&self, connection: Arc<Connection>) -> Result<()> {
        let id = connection.id();
        let mut inner = self.inner.write();
        if !inner.available {
            return Err(FanoutError::RegistryUnavailable);
        }
        if inner.connections.contains_key(&id) {
            error!(conn_id = %id, "duplicate connection id");
            return Err(FanoutError::DuplicateIdentifier(id));
        }
        let _ = inner.connections.insert(id, connection);
        debug!(conn_id = %id, live = inner.connections.len(), "connection registered");
        Ok(())
    }

    /// Remove a connection. Returns `false` if it was not present.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut inner = self.inner.write();
        let removed = inner.connections.remove(&id).is_some();
        if removed {
            debug!(conn_id = %id, live = inner.connections.len(), "connection unregistered");
        }
        removed
    }

    /// Copy of the current membership, ordered by id. Entries already in
    /// the `Closed` state are left out.
    ///
    /// Later registrations or removals do not affect a snapshot already
    /// taken.
    pub fn snapshot_live(&self) -> Vec<Arc<Connection>> {
        self.inner
            .read()
            .connections
            .values()
            .filter(|conn| !conn.state().is_terminal())
            .cloned()
            .collect()
    }

    /// Look up one connection.
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().connections.get(&id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.inner.read().connections.contains_key(&id)
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.inner.read().connections.len()
    }

    /// Whether the registry has no connections.
    pub fn is_empty(&self) -> bool {
        self.inner.read().connections.is_empty()
    }

    /// Remove every entry matching `predicate`, returning the removed
    /// connections.
    pub fn remove_where(&self, predicate: impl Fn(&Connection) -> bool) -> Vec<Arc<Connection>> {
        let mut inner = self.inner.write();
        let doomed: Vec<ConnectionId> = inner
            .connections
            .values()
            .filter(|conn| predicate(conn))
            .map(|conn| conn.id())
            .collect();
        doomed
            .iter()
            .filter_map(|id| inner.connections.remove(id))
            .collect()
    }

    /// Stop accepting registrations. Existing entries stay until their
    /// sessions unregister them.
    pub fn close(&self) {
        self.inner.write().available = false;
    }

    /// Whether [`register`](Self::register) can still succeed.
    pub fn is_available(&self) -> bool {
        self.inner.read().available
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
