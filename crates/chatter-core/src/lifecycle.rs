//! Connection lifecycle: admission on connect, teardown on disconnect.
//!
//! Connect runs handshake, register, mark online, broadcast, acknowledge.
//! Disconnect runs deregister, mark offline if it was the last session,
//! broadcast. Calls into the user directory happen with no registry lock
//! held, and their failures never affect the registry.

use crate::auth::{AuthError, Handshake, TokenVerifier};
use crate::connection::{Connection, ConnectionId, ConnectionState};
use crate::directory::{UserDirectory, UserStatus};
use crate::presence::{PresenceRegistry, PresenceStore};
use crate::room::{RoomTable, DEFAULT_MAX_ROOMS_PER_CONNECTION};
use crate::router::EventRouter;
use crate::session::{Outbox, SessionTable};
use chatter_protocol::{ConnectionAck, ServerEvent};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lifecycle errors.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Activation was attempted before a successful handshake.
    #[error("Connection {0} is not authenticated")]
    NotAuthenticated(ConnectionId),
}

/// Lifecycle configuration.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_connection: DEFAULT_MAX_ROOMS_PER_CONNECTION,
        }
    }
}

/// Owns the shared state and drives connections through their states.
pub struct Lifecycle {
    handshake: Handshake,
    directory: Arc<dyn UserDirectory>,
    presence: Arc<dyn PresenceStore>,
    sessions: Arc<SessionTable>,
    rooms: Arc<RoomTable>,
    router: EventRouter,
    /// Orders `users:online` snapshots so no session sees a stale one last.
    online_broadcast: Mutex<()>,
}

impl Lifecycle {
    /// Create a lifecycle backed by an in-process presence registry.
    #[must_use]
    pub fn new(verifier: Arc<dyn TokenVerifier>, directory: Arc<dyn UserDirectory>) -> Self {
        Self::with_config(verifier, directory, LifecycleConfig::default())
    }

    #[must_use]
    pub fn with_config(
        verifier: Arc<dyn TokenVerifier>,
        directory: Arc<dyn UserDirectory>,
        config: LifecycleConfig,
    ) -> Self {
        Self::with_presence_store(
            verifier,
            directory,
            Arc::new(PresenceRegistry::new()),
            config,
        )
    }

    /// Create a lifecycle over a caller-supplied presence store.
    #[must_use]
    pub fn with_presence_store(
        verifier: Arc<dyn TokenVerifier>,
        directory: Arc<dyn UserDirectory>,
        presence: Arc<dyn PresenceStore>,
        config: LifecycleConfig,
    ) -> Self {
        info!("Creating lifecycle with config: {:?}", config);
        let sessions = Arc::new(SessionTable::new());
        let rooms = Arc::new(RoomTable::with_limit(config.max_rooms_per_connection));
        let router = EventRouter::new(
            Arc::clone(&presence),
            Arc::clone(&sessions),
            Arc::clone(&rooms),
        );
        Self {
            handshake: Handshake::new(verifier, Arc::clone(&directory)),
            directory,
            presence,
            sessions,
            rooms,
            router,
            online_broadcast: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    #[must_use]
    pub fn presence(&self) -> &dyn PresenceStore {
        self.presence.as_ref()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomTable {
        &self.rooms
    }

    /// `Connecting -> Authenticated`, or `Connecting -> Closed` on failure.
    ///
    /// Nothing shared is touched on either path.
    ///
    /// # Errors
    ///
    /// Returns the handshake failure. Its cause is logged here; callers
    /// should only show the client [`AuthError::client_message`].
    pub async fn authenticate(
        &self,
        conn: &mut Connection,
        token: Option<&str>,
    ) -> Result<(), AuthError> {
        match self.handshake.authenticate(token).await {
            Ok(identity) => {
                let user = identity.user_id.clone();
                if conn.bind_identity(identity) {
                    debug!(connection = %conn.id(), user = %user, "Connection authenticated");
                }
                Ok(())
            }
            Err(e) => {
                warn!(connection = %conn.id(), cause = %e, "Authentication failed");
                conn.set_state(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// `Authenticated -> Active`.
    ///
    /// Registers the connection, marks the user online, broadcasts the
    /// online set and acknowledges the new session.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection has not authenticated.
    pub async fn activate(
        &self,
        conn: &mut Connection,
        outbox: Outbox,
    ) -> Result<(), LifecycleError> {
        let identity = match (conn.state(), conn.identity()) {
            (ConnectionState::Authenticated, Some(identity)) => identity.clone(),
            _ => return Err(LifecycleError::NotAuthenticated(conn.id().clone())),
        };

        self.sessions
            .insert(conn.id().clone(), identity.clone(), outbox);
        self.presence.register(&identity.user_id, conn.id());
        conn.set_state(ConnectionState::Active);

        if let Err(e) = self
            .directory
            .set_user_status(&identity.user_id, UserStatus::Online, Utc::now())
            .await
        {
            warn!(user = %identity.user_id, error = %e, "Failed to mark user online");
        }

        self.broadcast_online().await;

        self.sessions.send(
            conn.id(),
            Arc::new(ServerEvent::ConnectionSuccess(ConnectionAck {
                user_id: identity.user_id.clone(),
                connection_id: conn.id().to_string(),
            })),
        );

        info!(
            connection = %conn.id(),
            user = %identity.user_id,
            sessions = self.presence.connection_count(&identity.user_id),
            "User connected"
        );
        Ok(())
    }

    /// Any state `-> Closed`.
    ///
    /// Safe to call more than once; teardown runs only for the call that
    /// actually removes the connection from presence.
    pub async fn close(&self, conn: &mut Connection) {
        conn.set_state(ConnectionState::Closed);

        let Some(identity) = conn.identity().cloned() else {
            return;
        };

        self.rooms.leave_all(conn.id());
        self.sessions.remove(conn.id());

        let outcome = self.presence.deregister(&identity.user_id, conn.id());
        if !outcome.removed {
            return;
        }

        if outcome.went_offline() {
            if let Err(e) = self
                .directory
                .set_user_status(&identity.user_id, UserStatus::Offline, Utc::now())
                .await
            {
                warn!(user = %identity.user_id, error = %e, "Failed to mark user offline");
            }
        }

        self.broadcast_online().await;

        info!(
            connection = %conn.id(),
            user = %identity.user_id,
            remaining = outcome.remaining,
            "User disconnected"
        );
    }

    /// Push the current online set to every session.
    ///
    /// Snapshot and push happen under one lock, so pushes reach each
    /// outbox in snapshot order.
    async fn broadcast_online(&self) -> usize {
        let _guard = self.online_broadcast.lock().await;
        let users = self.presence.all_online_users();
        self.sessions
            .broadcast(Arc::new(ServerEvent::UsersOnline(users)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{token_for, SECRET};
    use crate::auth::JwtVerifier;
    use crate::directory::{DirectoryError, MemoryDirectory, UserProfile};
    use crate::session::{self, Inbox};
    use async_trait::async_trait;
    use chatter_protocol::{ChatMessage, ClientEvent};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Directory that records status updates and can be told to fail.
    #[derive(Default)]
    struct RecordingDirectory {
        inner: MemoryDirectory,
        updates: Mutex<Vec<(String, UserStatus)>>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl RecordingDirectory {
        fn with_users(users: &[(&str, &str)], fail: bool) -> Self {
            Self {
                inner: MemoryDirectory::with_users(
                    users.iter().map(|(id, name)| UserProfile::new(*id, *name)),
                ),
                fail,
                ..Self::default()
            }
        }

        fn updates(&self) -> Vec<(String, UserStatus)> {
            self.updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UserDirectory for RecordingDirectory {
        async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, DirectoryError> {
            self.inner.find_user(user_id).await
        }

        async fn set_user_status(
            &self,
            user_id: &str,
            status: UserStatus,
            at: DateTime<Utc>,
        ) -> Result<(), DirectoryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DirectoryError::Unavailable("database down".into()));
            }
            self.updates
                .lock()
                .unwrap()
                .push((user_id.to_string(), status));
            self.inner.set_user_status(user_id, status, at).await
        }
    }

    fn lifecycle(directory: Arc<RecordingDirectory>) -> Lifecycle {
        Lifecycle::new(Arc::new(JwtVerifier::new(SECRET, 0)), directory)
    }

    async fn connect(lc: &Lifecycle, user: &str) -> (Connection, Inbox) {
        let mut conn = Connection::new();
        lc.authenticate(&mut conn, Some(&token_for(user, 60)))
            .await
            .unwrap();
        let (tx, rx) = session::channel();
        lc.activate(&mut conn, tx).await.unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    fn online_broadcasts(events: &[ServerEvent]) -> Vec<Vec<String>> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::UsersOnline(users) => Some(users.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_sequence() {
        let directory = Arc::new(RecordingDirectory::with_users(&[("A", "alice")], false));
        let lc = lifecycle(directory.clone());

        let (conn, mut rx) = connect(&lc, "A").await;
        assert_eq!(conn.state(), ConnectionState::Active);
        assert!(lc.presence().is_online("A"));
        assert_eq!(lc.presence().connection_count("A"), 1);
        assert_eq!(directory.updates(), vec![("A".to_string(), UserStatus::Online)]);

        let events = drain(&mut rx);
        assert_eq!(events[0], ServerEvent::UsersOnline(vec!["A".into()]));
        assert_eq!(
            events[1],
            ServerEvent::ConnectionSuccess(ConnectionAck {
                user_id: "A".into(),
                connection_id: conn.id().to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_failed_handshake_mutates_nothing() {
        let directory = Arc::new(RecordingDirectory::with_users(&[("A", "alice")], false));
        let lc = lifecycle(directory.clone());

        let mut conn = Connection::new();
        let err = lc.authenticate(&mut conn, None).await.unwrap_err();
        assert_eq!(err.client_message(), "Authentication failed");
        assert_eq!(conn.state(), ConnectionState::Closed);

        let (tx, _rx) = session::channel();
        assert!(lc.activate(&mut conn, tx).await.is_err());

        lc.close(&mut conn).await;
        assert!(lc.presence().all_online_users().is_empty());
        assert!(lc.sessions().is_empty());
        assert_eq!(directory.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_deleted_user_token_rejected() {
        let directory = Arc::new(RecordingDirectory::with_users(&[("A", "alice")], false));
        directory.inner.remove("A");
        let lc = lifecycle(directory);

        let mut conn = Connection::new();
        let err = lc
            .authenticate(&mut conn, Some(&token_for("A", 60)))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn test_two_users_chat_then_disconnect() {
        let directory = Arc::new(RecordingDirectory::with_users(
            &[("A", "alice"), ("B", "bob"), ("C", "carol")],
            false,
        ));
        let lc = lifecycle(directory.clone());

        let (a, mut a_rx) = connect(&lc, "A").await;
        assert_eq!(lc.presence().connection_count("A"), 1);

        let (mut b, mut b_rx) = connect(&lc, "B").await;
        assert_eq!(
            online_broadcasts(&drain(&mut a_rx)).last().unwrap(),
            &vec!["A".to_string(), "B".to_string()]
        );
        drain(&mut b_rx);

        lc.router()
            .dispatch(&a, ClientEvent::MessageSend(ChatMessage::direct("B", "hi")))
            .unwrap();
        let received = drain(&mut b_rx);
        assert!(matches!(
            &received[..],
            [ServerEvent::MessageReceive(m)] if m.content.as_deref() == Some("hi")
        ));
        assert!(drain(&mut a_rx).is_empty());

        lc.close(&mut b).await;
        assert!(!lc.presence().is_online("B"));
        assert_eq!(
            online_broadcasts(&drain(&mut a_rx)),
            vec![vec!["A".to_string()]]
        );

        let (c, _) = connect(&lc, "C").await;
        let outcome = lc
            .router()
            .dispatch(&c, ClientEvent::MessageSend(ChatMessage::direct("B", "there?")))
            .unwrap();
        assert_eq!(outcome, crate::router::RouteOutcome::DeliveryMiss);
    }

    #[tokio::test]
    async fn test_offline_only_after_last_session() {
        let directory = Arc::new(RecordingDirectory::with_users(
            &[("A", "alice"), ("B", "bob")],
            false,
        ));
        let lc = lifecycle(directory.clone());

        let (_observer, mut observer_rx) = connect(&lc, "B").await;
        let (mut first, _) = connect(&lc, "A").await;
        let (mut second, _) = connect(&lc, "A").await;
        drain(&mut observer_rx);

        lc.close(&mut first).await;
        assert!(lc.presence().is_online("A"));
        assert!(!directory
            .updates()
            .contains(&("A".to_string(), UserStatus::Offline)));

        lc.close(&mut second).await;
        assert!(!lc.presence().is_online("A"));

        // Repeated disconnect notifications change nothing.
        lc.close(&mut second).await;
        lc.close(&mut first).await;

        let offline_updates = directory
            .updates()
            .into_iter()
            .filter(|u| *u == ("A".to_string(), UserStatus::Offline))
            .count();
        assert_eq!(offline_updates, 1);

        let broadcasts = online_broadcasts(&drain(&mut observer_rx));
        assert_eq!(broadcasts.len(), 2);
        assert_eq!(broadcasts.last().unwrap(), &vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn test_directory_failure_does_not_block_admission() {
        let directory = Arc::new(RecordingDirectory::with_users(&[("A", "alice")], true));
        let lc = lifecycle(directory.clone());

        let (mut conn, mut rx) = connect(&lc, "A").await;
        assert!(lc.presence().is_online("A"));
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, ServerEvent::ConnectionSuccess(_))));

        lc.close(&mut conn).await;
        assert!(!lc.presence().is_online("A"));
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_online_broadcast_matches_registry_under_churn() {
        let names: Vec<String> = (0..8).map(|n| format!("U{n}")).collect();
        let mut users: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), n.as_str())).collect();
        users.push(("OBS", "observer"));
        let directory = Arc::new(RecordingDirectory::with_users(&users, false));
        let lc = Arc::new(lifecycle(directory));

        let (_observer, mut observer_rx) = connect(&lc, "OBS").await;

        let tasks: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(n, name)| {
                let lc = Arc::clone(&lc);
                let name = name.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        let (mut conn, _rx) = connect(&lc, &name).await;
                        tokio::task::yield_now().await;
                        lc.close(&mut conn).await;
                    }
                    // Even-numbered users stay online.
                    if n % 2 == 0 {
                        Some(connect(&lc, &name).await)
                    } else {
                        None
                    }
                })
            })
            .collect();

        let mut kept = Vec::new();
        for task in tasks {
            kept.push(task.await.unwrap());
        }

        let final_online = lc.presence().all_online_users();
        assert_eq!(final_online, vec!["OBS", "U0", "U2", "U4", "U6"]);
        assert_eq!(
            online_broadcasts(&drain(&mut observer_rx)).last().unwrap(),
            &final_online
        );
    }

    #[tokio::test]
    async fn test_close_leaves_rooms() {
        let directory = Arc::new(RecordingDirectory::with_users(&[("A", "alice")], false));
        let lc = lifecycle(directory);

        let (mut conn, _) = connect(&lc, "A").await;
        lc.rooms().join(conn.id(), "lobby").unwrap();
        lc.close(&mut conn).await;

        assert!(!lc.rooms().exists("lobby"));
        assert!(!lc.sessions().contains(conn.id()));
    }
}
