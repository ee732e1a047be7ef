//! Connection identity and per-connection state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// A user identifier as issued by the user directory.
pub type UserId = String;

/// Unique identifier for one physical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Create a connection ID from an existing string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ConnectionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An authenticated user bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Lifecycle state of a connection.
///
/// ```text
/// Connecting ──▶ Authenticated ──▶ Active ──▶ Closed
///      │                │                       ▲
///      └────────────────┴───────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Physical link established, no identity yet.
    Connecting,
    /// Handshake succeeded; not yet visible to other users.
    Authenticated,
    /// Registered in presence and routing events.
    Active,
    /// Torn down.
    Closed,
}

/// One physical connection, owned by the task driving it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    identity: Option<Identity>,
    created_at: DateTime<Utc>,
}

impl Connection {
    /// Create a connection in the `Connecting` state with a fresh ID.
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(ConnectionId::generate())
    }

    /// Create a connection in the `Connecting` state with a known ID.
    #[must_use]
    pub fn with_id(id: ConnectionId) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            identity: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The user bound at handshake, if any.
    #[must_use]
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Bind the authenticated identity.
    ///
    /// Only succeeds from `Connecting`; an identity is never replaced.
    pub(crate) fn bind_identity(&mut self, identity: Identity) -> bool {
        if self.state != ConnectionState::Connecting || self.identity.is_some() {
            return false;
        }
        self.identity = Some(identity);
        self.state = ConnectionState::Authenticated;
        true
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("conn_"));
    }

    #[test]
    fn test_identity_binds_once() {
        let mut conn = Connection::new();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(conn.identity().is_none());

        assert!(conn.bind_identity(Identity::new("u-1", "alice")));
        assert_eq!(conn.state(), ConnectionState::Authenticated);

        assert!(!conn.bind_identity(Identity::new("u-2", "bob")));
        assert_eq!(conn.identity().unwrap().user_id, "u-1");
    }

    #[test]
    fn test_closed_connection_cannot_bind() {
        let mut conn = Connection::new();
        conn.set_state(ConnectionState::Closed);
        assert!(!conn.bind_identity(Identity::new("u-1", "alice")));
        assert!(conn.identity().is_none());
    }
}
