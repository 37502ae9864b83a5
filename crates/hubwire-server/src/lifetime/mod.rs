//! Connection lifetime and fan-out.
//!
//! [`HubLifetimeManager`] is the seam a scale-out backend would implement;
//! [`DefaultHubLifetimeManager`] keeps everything in process.
//!
//! Every `send_*` builds one [`SerializedHubMessage`] and hands the same
//! `Arc` to each recipient, so a message is encoded at most once per
//! protocol no matter how many connections receive it. Sends return once
//! the message is queued on every recipient, not once it is written.

pub mod connections;
pub mod groups;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use hubwire_core::errors::{HubError, Result};
use hubwire_core::protocol::{HubMessage, InvocationMessage};
use metrics::counter;
use serde_json::Value;
use tracing::debug;

use crate::connection::HubConnection;
use crate::metrics::BROADCASTS_TOTAL;
use crate::serialized::SerializedHubMessage;

pub use connections::ConnectionStore;
pub use groups::GroupList;

/// Membership and delivery operations for a hub.
#[async_trait]
pub trait HubLifetimeManager: Send + Sync {
    /// Track a connection that finished its handshake.
    async fn on_connected(&self, connection: Arc<HubConnection>) -> Result<()>;

    /// Forget a connection and remove it from every group.
    async fn on_disconnected(&self, connection: &HubConnection) -> Result<()>;

    /// Invoke `method` on every connection.
    async fn send_all(&self, method: &str, args: Vec<Value>) -> Result<()>;

    /// Invoke `method` on every connection except `excluded`.
    async fn send_all_except(&self, method: &str, args: Vec<Value>, excluded: &[String]) -> Result<()>;

    /// Invoke `method` on one connection. Unknown ids are ignored.
    async fn send_connection(&self, connection_id: &str, method: &str, args: Vec<Value>) -> Result<()>;

    /// Invoke `method` on several connections.
    async fn send_connections(&self, connection_ids: &[String], method: &str, args: Vec<Value>) -> Result<()>;

    /// Invoke `method` on a group's members.
    async fn send_group(&self, group: &str, method: &str, args: Vec<Value>) -> Result<()>;

    /// Invoke `method` on the members of several groups, once per connection.
    async fn send_groups(&self, groups: &[String], method: &str, args: Vec<Value>) -> Result<()>;

    /// Invoke `method` on a group's members except `excluded`.
    async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<()>;

    /// Invoke `method` on every connection of a user.
    async fn send_user(&self, user_id: &str, method: &str, args: Vec<Value>) -> Result<()>;

    /// Invoke `method` on every connection of several users.
    async fn send_users(&self, user_ids: &[String], method: &str, args: Vec<Value>) -> Result<()>;

    /// Add a connection to a group. Unknown connections are ignored.
    async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<()>;

    /// Remove a connection from a group. Non-members are ignored.
    async fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<()>;
}

/// In-process lifetime manager.
#[derive(Default)]
pub struct DefaultHubLifetimeManager {
    connections: ConnectionStore,
    groups: GroupList,
}

impl DefaultHubLifetimeManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Live connection registry.
    pub fn connections(&self) -> &ConnectionStore {
        &self.connections
    }

    /// Group registry.
    pub fn groups(&self) -> &GroupList {
        &self.groups
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Abort every live connection (server shutdown).
    pub fn abort_all(&self) {
        for connection in self.connections.all() {
            connection.abort();
        }
    }

    fn deliver(
        &self,
        kind: &'static str,
        recipients: impl IntoIterator<Item = Arc<HubConnection>>,
        method: &str,
        args: Vec<Value>,
    ) {
        let message = invocation(method, args);
        let mut seen = HashSet::new();
        let mut delivered = 0usize;
        for connection in recipients {
            if !seen.insert(connection.id().clone()) {
                continue;
            }
            match connection.write_serialized(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(conn_id = %connection.id(), error = %err, method, "skipping closed connection");
                }
            }
        }
        counter!(BROADCASTS_TOTAL, "kind" => kind).increment(1);
        debug!(kind, method, delivered, "fan-out queued");
    }
}

fn invocation(method: &str, args: Vec<Value>) -> Arc<SerializedHubMessage> {
    Arc::new(SerializedHubMessage::new(HubMessage::Invocation(
        InvocationMessage::new(method, args),
    )))
}

fn require_group_name(group: &str) -> Result<()> {
    if group.is_empty() {
        return Err(HubError::InvalidArgument(
            "Cannot send to an empty group name.".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl HubLifetimeManager for DefaultHubLifetimeManager {
    async fn on_connected(&self, connection: Arc<HubConnection>) -> Result<()> {
        self.connections.add(connection);
        Ok(())
    }

    async fn on_disconnected(&self, connection: &HubConnection) -> Result<()> {
        let _ = self.connections.remove(connection.id());
        self.groups.remove_disconnected(connection.id());
        Ok(())
    }

    async fn send_all(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.deliver("all", self.connections.all(), method, args);
        Ok(())
    }

    async fn send_all_except(&self, method: &str, args: Vec<Value>, excluded: &[String]) -> Result<()> {
        let recipients = self
            .connections
            .filter(|c| !excluded.iter().any(|id| id == c.id().as_str()));
        self.deliver("all_except", recipients, method, args);
        Ok(())
    }

    async fn send_connection(&self, connection_id: &str, method: &str, args: Vec<Value>) -> Result<()> {
        // Single recipient: nothing to share, let the drain task encode it.
        let Some(connection) = self.connections.get(connection_id) else {
            return Ok(());
        };
        if let Err(err) = connection.write(HubMessage::Invocation(InvocationMessage::new(method, args))) {
            debug!(conn_id = connection_id, error = %err, method, "skipping closed connection");
        }
        counter!(BROADCASTS_TOTAL, "kind" => "connection").increment(1);
        Ok(())
    }

    async fn send_connections(&self, connection_ids: &[String], method: &str, args: Vec<Value>) -> Result<()> {
        let recipients = connection_ids
            .iter()
            .filter_map(|id| self.connections.get(id))
            .collect::<Vec<_>>();
        self.deliver("connections", recipients, method, args);
        Ok(())
    }

    async fn send_group(&self, group: &str, method: &str, args: Vec<Value>) -> Result<()> {
        require_group_name(group)?;
        self.deliver("group", self.groups.members(group), method, args);
        Ok(())
    }

    async fn send_groups(&self, groups: &[String], method: &str, args: Vec<Value>) -> Result<()> {
        for group in groups {
            require_group_name(group)?;
        }
        let recipients = groups
            .iter()
            .flat_map(|group| self.groups.members(group))
            .collect::<Vec<_>>();
        self.deliver("groups", recipients, method, args);
        Ok(())
    }

    async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[String],
    ) -> Result<()> {
        require_group_name(group)?;
        let recipients = self
            .groups
            .members(group)
            .into_iter()
            .filter(|c| !excluded.iter().any(|id| id == c.id().as_str()))
            .collect::<Vec<_>>();
        self.deliver("group_except", recipients, method, args);
        Ok(())
    }

    async fn send_user(&self, user_id: &str, method: &str, args: Vec<Value>) -> Result<()> {
        let recipients = self
            .connections
            .filter(|c| c.user_identifier() == Some(user_id));
        self.deliver("user", recipients, method, args);
        Ok(())
    }

    async fn send_users(&self, user_ids: &[String], method: &str, args: Vec<Value>) -> Result<()> {
        let recipients = self.connections.filter(|c| {
            c.user_identifier()
                .is_some_and(|user| user_ids.iter().any(|u| u == user))
        });
        self.deliver("users", recipients, method, args);
        Ok(())
    }

    async fn add_to_group(&self, connection_id: &str, group: &str) -> Result<()> {
        if group.is_empty() {
            return Err(HubError::InvalidArgument("Group name must not be empty.".into()));
        }
        if let Some(connection) = self.connections.get(connection_id) {
            let _ = self.groups.add(group, connection);
        }
        Ok(())
    }

    async fn remove_from_group(&self, connection_id: &str, group: &str) -> Result<()> {
        if group.is_empty() {
            return Err(HubError::InvalidArgument("Group name must not be empty.".into()));
        }
        let _ = self.groups.remove(group, connection_id);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
