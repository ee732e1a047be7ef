//! Shared fixtures for Chatter benchmarks.

use async_trait::async_trait;
use chatter_core::{
    session, AuthError, Connection, Inbox, Lifecycle, MemoryDirectory, TokenVerifier, UserProfile,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Treats the token itself as the user id.
pub struct TrustingVerifier;

#[async_trait]
impl TokenVerifier for TrustingVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        Ok(token.to_string())
    }
}

/// User id for the `n`th fixture user.
#[must_use]
pub fn user(n: usize) -> String {
    format!("user-{n}")
}

/// A lifecycle with `users` registered users and a runtime to drive it.
pub struct Fixture {
    pub runtime: Runtime,
    pub lifecycle: Lifecycle,
    sessions: Vec<(Connection, Inbox)>,
}

impl Fixture {
    /// # Panics
    ///
    /// Panics if the runtime cannot be built.
    #[must_use]
    pub fn new(users: usize) -> Self {
        let directory =
            MemoryDirectory::with_users((0..users).map(|n| UserProfile::new(user(n), user(n))));
        Self {
            runtime: tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap(),
            lifecycle: Lifecycle::new(Arc::new(TrustingVerifier), Arc::new(directory)),
            sessions: Vec::new(),
        }
    }

    /// Open an active session for `user_id` and return its index.
    ///
    /// # Panics
    ///
    /// Panics if the user is not in the directory.
    pub fn connect(&mut self, user_id: &str) -> usize {
        let mut conn = Connection::new();
        let (outbox, inbox) = session::channel();
        let lifecycle = &self.lifecycle;
        self.runtime.block_on(async {
            lifecycle
                .authenticate(&mut conn, Some(user_id))
                .await
                .unwrap();
            lifecycle.activate(&mut conn, outbox).await.unwrap();
        });
        self.sessions.push((conn, inbox));
        self.drain();
        self.sessions.len() - 1
    }

    /// Close the session at `index`.
    pub fn disconnect(&mut self, index: usize) {
        let (conn, _) = &mut self.sessions[index];
        self.runtime.block_on(self.lifecycle.close(conn));
    }

    #[must_use]
    pub fn connection(&self, index: usize) -> &Connection {
        &self.sessions[index].0
    }

    /// Discard every queued event and return how many there were.
    pub fn drain(&mut self) -> usize {
        let mut drained = 0;
        for (_, inbox) in &mut self.sessions {
            while inbox.try_recv().is_ok() {
                drained += 1;
            }
        }
        drained
    }
}
