//! User directory: the external authority on who users are and what their
//! last known status was.

use crate::connection::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Status mirrored into the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
}

impl std::fmt::Display for UserStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserStatus::Online => f.write_str("online"),
            UserStatus::Offline => f.write_str("offline"),
        }
    }
}

/// Public profile of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
}

impl UserProfile {
    #[must_use]
    pub fn new(id: impl Into<UserId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
        }
    }
}

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// No such user.
    #[error("User not found: {0}")]
    NotFound(String),

    /// The backing service could not be reached.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Lookup and status capabilities provided by the user store.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve a user ID to a live profile.
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, DirectoryError>;

    /// Record a user's status and when it changed.
    async fn set_user_status(
        &self,
        user_id: &str,
        status: UserStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone)]
struct UserRecord {
    profile: UserProfile,
    status: UserStatus,
    last_seen: Option<DateTime<Utc>>,
}

/// In-process user directory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    users: DashMap<UserId, UserRecord>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory seeded with the given users, all offline.
    #[must_use]
    pub fn with_users(users: impl IntoIterator<Item = UserProfile>) -> Self {
        let directory = Self::new();
        for profile in users {
            directory.insert(profile);
        }
        directory
    }

    /// Add or replace a user.
    pub fn insert(&self, profile: UserProfile) {
        self.users.insert(
            profile.id.clone(),
            UserRecord {
                profile,
                status: UserStatus::Offline,
                last_seen: None,
            },
        );
    }

    /// Delete a user. Tokens naming them stop resolving.
    pub fn remove(&self, user_id: &str) -> Option<UserProfile> {
        self.users.remove(user_id).map(|(_, record)| record.profile)
    }

    #[must_use]
    pub fn status(&self, user_id: &str) -> Option<UserStatus> {
        self.users.get(user_id).map(|r| r.status)
    }

    #[must_use]
    pub fn last_seen(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.users.get(user_id).and_then(|r| r.last_seen)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, DirectoryError> {
        Ok(self.users.get(user_id).map(|r| r.profile.clone()))
    }

    async fn set_user_status(
        &self,
        user_id: &str,
        status: UserStatus,
        at: DateTime<Utc>,
    ) -> Result<(), DirectoryError> {
        let mut record = self
            .users
            .get_mut(user_id)
            .ok_or_else(|| DirectoryError::NotFound(user_id.to_string()))?;
        record.status = status;
        record.last_seen = Some(at);
        debug!(user = %user_id, status = %status, "Directory: status updated");
        Ok(())
    }
}
