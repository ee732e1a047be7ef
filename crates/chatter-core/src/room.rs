//! Room subscriptions for Chatter.
//!
//! Rooms are named broadcast groups. They hold no state beyond the set of
//! connections currently subscribed, and disappear when the last one leaves.

use crate::connection::ConnectionId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

/// Default maximum rooms a single connection may join.
pub const DEFAULT_MAX_ROOMS_PER_CONNECTION: usize = 100;

/// A room identifier.
pub type RoomId = String;

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidName(&'static str),

    /// Already a member of the room.
    #[error("Already joined room: {0}")]
    AlreadyJoined(String),

    /// Not a member of the room.
    #[error("Not a member of room: {0}")]
    NotJoined(String),

    /// Maximum rooms per connection reached.
    #[error("Maximum rooms per connection reached")]
    MaxRoomsReached,
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Subscriber table keyed by room, with a reverse index per connection.
///
/// Lock order is always memberships before rooms.
#[derive(Debug)]
pub struct RoomTable {
    rooms: DashMap<RoomId, HashSet<ConnectionId>>,
    memberships: DashMap<ConnectionId, HashSet<RoomId>>,
    max_rooms_per_connection: usize,
}

impl RoomTable {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_ROOMS_PER_CONNECTION)
    }

    #[must_use]
    pub fn with_limit(max_rooms_per_connection: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            max_rooms_per_connection,
        }
    }

    /// Subscribe a connection to a room, creating the room if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the connection is already a
    /// member, or it has reached its room limit.
    pub fn join(&self, connection_id: &ConnectionId, room: &str) -> Result<(), RoomError> {
        validate_room_name(room).map_err(RoomError::InvalidName)?;

        let mut joined = self.memberships.entry(connection_id.clone()).or_default();
        if joined.contains(room) {
            return Err(RoomError::AlreadyJoined(room.to_string()));
        }
        if joined.len() >= self.max_rooms_per_connection {
            return Err(RoomError::MaxRoomsReached);
        }

        let mut members = self.rooms.entry(room.to_string()).or_insert_with(|| {
            debug!(room = %room, "Creating room");
            HashSet::new()
        });
        members.insert(connection_id.clone());
        joined.insert(room.to_string());

        debug!(room = %room, connection = %connection_id, members = members.len(), "Joined room");
        Ok(())
    }

    /// Unsubscribe a connection from a room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is not a member.
    pub fn leave(&self, connection_id: &ConnectionId, room: &str) -> Result<(), RoomError> {
        let left = match self.memberships.entry(connection_id.clone()) {
            Entry::Occupied(mut entry) => {
                let left = entry.get_mut().remove(room);
                if entry.get().is_empty() {
                    entry.remove();
                }
                left
            }
            Entry::Vacant(_) => false,
        };

        if !left {
            return Err(RoomError::NotJoined(room.to_string()));
        }

        self.remove_member(room, connection_id);
        debug!(room = %room, connection = %connection_id, "Left room");
        Ok(())
    }

    /// Unsubscribe a connection from every room. Returns the rooms it left.
    pub fn leave_all(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        let Some((_, rooms)) = self.memberships.remove(connection_id) else {
            return Vec::new();
        };

        for room in &rooms {
            self.remove_member(room, connection_id);
        }

        debug!(connection = %connection_id, rooms = rooms.len(), "Left all rooms");
        rooms.into_iter().collect()
    }

    fn remove_member(&self, room: &str, connection_id: &ConnectionId) {
        if let Entry::Occupied(mut entry) = self.rooms.entry(room.to_string()) {
            entry.get_mut().remove(connection_id);
            if entry.get().is_empty() {
                entry.remove();
                debug!(room = %room, "Deleted empty room");
            }
        }
    }

    /// Snapshot of the connections subscribed to a room.
    #[must_use]
    pub fn members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rooms a connection has joined.
    #[must_use]
    pub fn rooms_of(&self, connection_id: &ConnectionId) -> Vec<RoomId> {
        self.memberships
            .get(connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId, room: &str) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(connection_id))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn exists(&self, room: &str) -> bool {
        self.rooms.contains_key(room)
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomTable {
    fn default() -> Self {
        Self::new()
    }
}
