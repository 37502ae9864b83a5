//! Group membership registry.

use std::sync::Arc;

use dashmap::DashMap;
use hubwire_core::ConnectionId;

use crate::connection::HubConnection;

type Members = DashMap<ConnectionId, Arc<HubConnection>>;

/// Concurrent group name → members map.
///
/// Membership is a set: adding twice is a no-op, removing a non-member is a
/// no-op. A group whose last member leaves is dropped.
#[derive(Default)]
pub struct GroupList {
    groups: DashMap<String, Members>,
}

impl GroupList {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `group`. Returns `true` if it was not a member.
    pub fn add(&self, group: &str, connection: Arc<HubConnection>) -> bool {
        // The outer entry guard serializes this insert against pruning.
        self.groups
            .entry(group.to_owned())
            .or_default()
            .insert(connection.id().clone(), connection)
            .is_none()
    }

    /// Remove a connection from `group`. Returns `true` if it was a member.
    pub fn remove(&self, group: &str, connection_id: &str) -> bool {
        let removed = match self.groups.get(group) {
            Some(members) => members.remove(connection_id).is_some(),
            None => false,
        };
        if removed {
            let _ = self.groups.remove_if(group, |_, members| members.is_empty());
        }
        removed
    }

    /// Remove a connection from every group, pruning groups left empty.
    pub fn remove_disconnected(&self, connection_id: &str) {
        self.groups.retain(|_, members| {
            let _ = members.remove(connection_id);
            !members.is_empty()
        });
    }

    /// Snapshot of a group's members; empty for unknown groups.
    pub fn members(&self, group: &str) -> Vec<Arc<HubConnection>> {
        self.groups
            .get(group)
            .map(|members| members.iter().map(|m| Arc::clone(m.value())).collect())
            .unwrap_or_default()
    }

    /// Whether `connection_id` belongs to `group`.
    pub fn contains(&self, group: &str, connection_id: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|members| members.contains_key(connection_id))
    }

    /// Number of non-empty groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of members in `group`.
    pub fn member_count(&self, group: &str) -> usize {
        self.groups.get(group).map_or(0, |members| members.len())
    }
}
