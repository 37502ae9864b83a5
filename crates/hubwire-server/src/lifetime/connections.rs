//! Registry of live connections.

use std::sync::Arc;

use dashmap::DashMap;
use hubwire_core::ConnectionId;

use crate::connection::HubConnection;

/// Concurrent id → connection map.
///
/// Iteration is weakly consistent: a connection added or removed while a
/// broadcast walks the map may or may not be visited.
#[derive(Default)]
pub struct ConnectionStore {
    connections: DashMap<ConnectionId, Arc<HubConnection>>,
}

impl ConnectionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous entry with the same id.
    pub fn add(&self, connection: Arc<HubConnection>) {
        let _ = self
            .connections
            .insert(connection.id().clone(), connection);
    }

    /// Unregister a connection.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<HubConnection>> {
        self.connections.remove(connection_id).map(|(_, conn)| conn)
    }

    /// Look up a connection.
    pub fn get(&self, connection_id: &str) -> Option<Arc<HubConnection>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Connections matching `predicate`, collected without holding any lock
    /// across the caller's work.
    pub fn filter(&self, predicate: impl Fn(&HubConnection) -> bool) -> Vec<Arc<HubConnection>> {
        self.connections
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Every connection.
    pub fn all(&self) -> Vec<Arc<HubConnection>> {
        self.filter(|_| true)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
