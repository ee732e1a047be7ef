//! Presence tracking for Chatter.
//!
//! The registry maps each online user to the set of connections currently
//! open for them. A user is online exactly when that set is non-empty; an
//! emptied set is removed rather than kept around.

use crate::connection::{ConnectionId, UserId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, trace};

/// Result of removing a connection from the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deregistration {
    /// Whether the connection was present and has been removed.
    pub removed: bool,
    /// Connections still open for the user afterwards.
    pub remaining: usize,
}

impl Deregistration {
    /// True when this removal took the user's last connection.
    #[must_use]
    pub fn went_offline(&self) -> bool {
        self.removed && self.remaining == 0
    }
}

/// Presence statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PresenceStats {
    /// Number of users with at least one connection.
    pub online_users: usize,
    /// Total number of registered connections.
    pub connections: usize,
}

/// Backing store for user presence.
///
/// Every operation is atomic with respect to the others for a given user.
/// Results are snapshots; mutating them never touches the store.
pub trait PresenceStore: Send + Sync {
    /// Add a connection for a user. Returns `false` if it was already present.
    fn register(&self, user_id: &str, connection_id: &ConnectionId) -> bool;

    /// Remove a connection for a user. Absent users or connections are a no-op.
    fn deregister(&self, user_id: &str, connection_id: &ConnectionId) -> Deregistration;

    /// Whether the user has at least one open connection.
    fn is_online(&self, user_id: &str) -> bool;

    /// Snapshot of the user's open connections.
    fn connections_for(&self, user_id: &str) -> HashSet<ConnectionId>;

    /// Snapshot of all online users, sorted.
    fn all_online_users(&self) -> Vec<UserId>;

    /// Number of open connections for the user.
    fn connection_count(&self, user_id: &str) -> usize {
        self.connections_for(user_id).len()
    }

    /// Registry statistics.
    fn stats(&self) -> PresenceStats;
}

/// In-process presence registry.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PresenceStore for PresenceRegistry {
    fn register(&self, user_id: &str, connection_id: &ConnectionId) -> bool {
        let mut connections = self.users.entry(user_id.to_string()).or_default();
        let added = connections.insert(connection_id.clone());
        if added {
            debug!(
                user = %user_id,
                connection = %connection_id,
                sessions = connections.len(),
                "Presence: connection registered"
            );
        }
        added
    }

    fn deregister(&self, user_id: &str, connection_id: &ConnectionId) -> Deregistration {
        // Removal and the emptiness check happen under the same entry lock.
        match self.users.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(connection_id);
                let remaining = entry.get().len();
                if remaining == 0 {
                    entry.remove();
                }
                if removed {
                    debug!(
                        user = %user_id,
                        connection = %connection_id,
                        sessions = remaining,
                        "Presence: connection deregistered"
                    );
                }
                Deregistration { removed, remaining }
            }
            Entry::Vacant(_) => {
                trace!(user = %user_id, connection = %connection_id, "Presence: nothing to deregister");
                Deregistration::default()
            }
        }
    }

    fn is_online(&self, user_id: &str) -> bool {
        self.users
            .get(user_id)
            .map(|connections| !connections.is_empty())
            .unwrap_or(false)
    }

    fn connections_for(&self, user_id: &str) -> HashSet<ConnectionId> {
        self.users
            .get(user_id)
            .map(|connections| connections.clone())
            .unwrap_or_default()
    }

    fn all_online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.users.iter().map(|e| e.key().clone()).collect();
        users.sort_unstable();
        users
    }

    fn connection_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map(|c| c.len()).unwrap_or(0)
    }

    fn stats(&self) -> PresenceStats {
        PresenceStats {
            online_users: self.users.len(),
            connections: self.users.iter().map(|e| e.len()).sum(),
        }
    }
}
