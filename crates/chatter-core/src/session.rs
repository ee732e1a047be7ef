//! Live session table: where to push events for each open connection.
//!
//! Each session owns an unbounded queue drained by its connection task, so
//! pushing an event never waits on the recipient.

use crate::connection::{ConnectionId, Identity};
use chatter_protocol::ServerEvent;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// Sending half of a session's event queue.
pub type Outbox = mpsc::UnboundedSender<Arc<ServerEvent>>;

/// Receiving half of a session's event queue.
pub type Inbox = mpsc::UnboundedReceiver<Arc<ServerEvent>>;

/// Create a new session queue.
#[must_use]
pub fn channel() -> (Outbox, Inbox) {
    mpsc::unbounded_channel()
}

/// A registered session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub identity: Identity,
    outbox: Outbox,
}

impl SessionHandle {
    /// Queue an event for this session. Returns `false` if it has gone away.
    pub fn push(&self, event: Arc<ServerEvent>) -> bool {
        self.outbox.send(event).is_ok()
    }
}

/// All open sessions, keyed by connection.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: DashMap<ConnectionId, SessionHandle>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection_id: ConnectionId, identity: Identity, outbox: Outbox) {
        self.sessions
            .insert(connection_id, SessionHandle { identity, outbox });
    }

    pub fn remove(&self, connection_id: &ConnectionId) -> Option<SessionHandle> {
        self.sessions.remove(connection_id).map(|(_, handle)| handle)
    }

    /// Queue an event for one connection.
    ///
    /// Returns `false` if the connection is unknown or its queue is closed.
    pub fn send(&self, connection_id: &ConnectionId, event: Arc<ServerEvent>) -> bool {
        let delivered = self
            .sessions
            .get(connection_id)
            .map(|session| session.push(event))
            .unwrap_or(false);
        if !delivered {
            trace!(connection = %connection_id, "Session unavailable, event dropped");
        }
        delivered
    }

    /// Queue an event for every open session. Returns how many accepted it.
    pub fn broadcast(&self, event: Arc<ServerEvent>) -> usize {
        self.sessions
            .iter()
            .filter(|session| session.push(Arc::clone(&event)))
            .count()
    }

    #[must_use]
    pub fn identity(&self, connection_id: &ConnectionId) -> Option<Identity> {
        self.sessions
            .get(connection_id)
            .map(|session| session.identity.clone())
    }

    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.sessions.contains_key(connection_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_broadcast() {
        let table = SessionTable::new();
        let (tx1, mut rx1) = channel();
        let (tx2, mut rx2) = channel();
        table.insert("c1".into(), Identity::new("u-1", "alice"), tx1);
        table.insert("c2".into(), Identity::new("u-2", "bob"), tx2);

        assert!(table.send(&"c1".into(), Arc::new(ServerEvent::Pong)));
        assert_eq!(*rx1.try_recv().unwrap(), ServerEvent::Pong);
        assert!(rx2.try_recv().is_err());

        let online = Arc::new(ServerEvent::UsersOnline(vec!["u-1".into()]));
        assert_eq!(table.broadcast(online), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_closed_queue_is_not_delivered() {
        let table = SessionTable::new();
        let (tx, rx) = channel();
        table.insert("c1".into(), Identity::new("u-1", "alice"), tx);
        drop(rx);

        assert!(!table.send(&"c1".into(), Arc::new(ServerEvent::Pong)));
        assert!(!table.send(&"missing".into(), Arc::new(ServerEvent::Pong)));
    }

    #[test]
    fn test_remove() {
        let table = SessionTable::new();
        let (tx, _rx) = channel();
        table.insert("c1".into(), Identity::new("u-1", "alice"), tx);

        assert_eq!(table.identity(&"c1".into()).unwrap().username, "alice");
        assert!(table.remove(&"c1".into()).is_some());
        assert!(table.remove(&"c1".into()).is_none());
        assert!(table.is_empty());
    }
}
