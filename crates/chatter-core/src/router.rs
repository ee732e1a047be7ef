//! Event router for Chatter.
//!
//! The router validates inbound client events, resolves their logical target
//! (a user or a room) to live connections and queues one copy per recipient.
//! It never waits on a recipient.

use crate::connection::{Connection, ConnectionId, Identity, UserId};
use crate::presence::PresenceStore;
use crate::room::{RoomError, RoomId, RoomTable};
use crate::session::SessionTable;
use chatter_protocol::{
    ChatMessage, ClientEvent, ReadUpdate, RoomRequest, ServerEvent, TypingNotice, TypingTarget,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// An inbound event that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message content or media is required")]
    EmptyMessage,

    #[error("Receiver is required for private messages")]
    MissingReceiver,

    #[error("Room is required for group messages")]
    MissingRoom,

    #[error("Typing indicator requires a recipientId or room")]
    MissingTypingTarget,

    #[error("Read receipt requires a messageId and senderId")]
    IncompleteReceipt,
}

/// Router errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The event itself is malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A room membership request was refused.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// The connection has no bound identity.
    #[error("Connection {0} is not authenticated")]
    NotAuthenticated(ConnectionId),
}

/// Where a routable event is headed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    User(UserId),
    Room(RoomId),
}

/// A validated event ready for fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutableEvent {
    Message { target: Target, message: ChatMessage },
    TypingStart { target: Target },
    TypingStop { target: Target },
    ReadReceipt { target: UserId, message_id: String },
}

impl RoutableEvent {
    /// Validate a chat message and stamp it with the sender.
    ///
    /// # Errors
    ///
    /// Returns an error if the message has no body or lacks the target its
    /// kind requires.
    pub fn message(sender: &Identity, mut message: ChatMessage) -> Result<Self, ValidationError> {
        if !message.has_body() {
            return Err(ValidationError::EmptyMessage);
        }

        let target = if message.is_group() {
            match non_empty(message.room.as_deref()) {
                Some(room) => Target::Room(room.to_string()),
                None => return Err(ValidationError::MissingRoom),
            }
        } else {
            match non_empty(message.receiver.as_deref()) {
                Some(receiver) => Target::User(receiver.to_string()),
                None => return Err(ValidationError::MissingReceiver),
            }
        };

        message.sender = Some(sender.user_id.clone());
        Ok(RoutableEvent::Message { target, message })
    }

    /// Resolve a typing target. A room takes precedence over a recipient.
    ///
    /// # Errors
    ///
    /// Returns an error if neither a room nor a recipient is given.
    pub fn typing_target(target: &TypingTarget) -> Result<Target, ValidationError> {
        if let Some(room) = non_empty(target.room.as_deref()) {
            return Ok(Target::Room(room.to_string()));
        }
        if let Some(user) = non_empty(target.recipient_id.as_deref()) {
            return Ok(Target::User(user.to_string()));
        }
        Err(ValidationError::MissingTypingTarget)
    }

    /// Convert a client event into a routable one.
    ///
    /// Returns `Ok(None)` for events that are not routed to other users.
    ///
    /// # Errors
    ///
    /// Returns an error if the event fails validation.
    pub fn from_client(sender: &Identity, event: ClientEvent) -> Result<Option<Self>, ValidationError> {
        let routable = match event {
            ClientEvent::MessageSend(message) => Self::message(sender, message)?,
            ClientEvent::TypingStart(target) => RoutableEvent::TypingStart {
                target: Self::typing_target(&target)?,
            },
            ClientEvent::TypingStop(target) => RoutableEvent::TypingStop {
                target: Self::typing_target(&target)?,
            },
            ClientEvent::MessageRead(receipt) => {
                if receipt.message_id.is_empty() || receipt.sender_id.is_empty() {
                    return Err(ValidationError::IncompleteReceipt);
                }
                RoutableEvent::ReadReceipt {
                    target: receipt.sender_id,
                    message_id: receipt.message_id,
                }
            }
            ClientEvent::RoomJoin(_) | ClientEvent::RoomLeave(_) | ClientEvent::Ping => {
                return Ok(None)
            }
        };
        Ok(Some(routable))
    }

    #[must_use]
    pub fn target(&self) -> Target {
        match self {
            RoutableEvent::Message { target, .. }
            | RoutableEvent::TypingStart { target }
            | RoutableEvent::TypingStop { target } => target.clone(),
            RoutableEvent::ReadReceipt { target, .. } => Target::User(target.clone()),
        }
    }

    /// The event recipients see, given who sent it.
    #[must_use]
    pub fn into_server_event(self, sender: &Identity) -> ServerEvent {
        let room_of = |target: &Target| match target {
            Target::Room(room) => Some(room.clone()),
            Target::User(_) => None,
        };
        match self {
            RoutableEvent::Message { message, .. } => ServerEvent::MessageReceive(message),
            RoutableEvent::TypingStart { target } => ServerEvent::TypingDisplay(TypingNotice {
                user_id: sender.user_id.clone(),
                username: sender.username.clone(),
                room: room_of(&target),
            }),
            RoutableEvent::TypingStop { target } => ServerEvent::TypingHide(TypingNotice {
                user_id: sender.user_id.clone(),
                username: sender.username.clone(),
                room: room_of(&target),
            }),
            RoutableEvent::ReadReceipt { message_id, .. } => ServerEvent::ReadUpdate(ReadUpdate {
                message_id,
                read_by: sender.user_id.clone(),
                read_at: Utc::now(),
            }),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// What happened to a handled event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued for this many connections.
    Delivered(usize),
    /// No live connection matched the target. Not an error.
    DeliveryMiss,
    /// Answered directly to the sender (room membership, ping).
    Replied,
}

impl RouteOutcome {
    #[must_use]
    pub fn deliveries(&self) -> usize {
        match self {
            RouteOutcome::Delivered(n) => *n,
            RouteOutcome::DeliveryMiss | RouteOutcome::Replied => 0,
        }
    }
}

/// The central event router.
pub struct EventRouter {
    presence: Arc<dyn PresenceStore>,
    sessions: Arc<SessionTable>,
    rooms: Arc<RoomTable>,
}

impl EventRouter {
    #[must_use]
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        sessions: Arc<SessionTable>,
        rooms: Arc<RoomTable>,
    ) -> Self {
        Self {
            presence,
            sessions,
            rooms,
        }
    }

    /// Handle an event and report any failure to the sending connection
    /// as `message:error`.
    ///
    /// # Errors
    ///
    /// Returns the same error that was reported.
    pub fn dispatch(
        &self,
        from: &Connection,
        event: ClientEvent,
    ) -> Result<RouteOutcome, RouteError> {
        let name = event.name();
        let result = self.handle(from, event);
        if let Err(e) = &result {
            debug!(connection = %from.id(), event = name, error = %e, "Event rejected");
            self.reply(from.id(), ServerEvent::error(e.to_string()));
        }
        result
    }

    /// Handle an event from an authenticated connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unauthenticated, the event is
    /// invalid, or a room request is refused.
    pub fn handle(&self, from: &Connection, event: ClientEvent) -> Result<RouteOutcome, RouteError> {
        let sender = from
            .identity()
            .ok_or_else(|| RouteError::NotAuthenticated(from.id().clone()))?;

        match event {
            ClientEvent::RoomJoin(RoomRequest { room }) => {
                self.rooms.join(from.id(), &room)?;
                self.reply(from.id(), ServerEvent::RoomJoined(RoomRequest { room }));
                Ok(RouteOutcome::Replied)
            }
            ClientEvent::RoomLeave(RoomRequest { room }) => {
                self.rooms.leave(from.id(), &room)?;
                self.reply(from.id(), ServerEvent::RoomLeft(RoomRequest { room }));
                Ok(RouteOutcome::Replied)
            }
            ClientEvent::Ping => {
                self.reply(from.id(), ServerEvent::Pong);
                Ok(RouteOutcome::Replied)
            }
            event => match RoutableEvent::from_client(sender, event)? {
                Some(routable) => Ok(self.route(from.id(), sender, routable)),
                None => Ok(RouteOutcome::Replied),
            },
        }
    }

    /// Fan a validated event out to its target.
    pub fn route(
        &self,
        origin: &ConnectionId,
        sender: &Identity,
        event: RoutableEvent,
    ) -> RouteOutcome {
        let target = event.target();
        let payload = Arc::new(event.into_server_event(sender));

        let recipients = self.resolve(origin, &sender.user_id, &target);
        let delivered = self.fan_out(recipients.iter(), &payload);

        if delivered == 0 {
            debug!(
                user = %sender.user_id,
                destination = ?target,
                event = payload.name(),
                "No live recipients"
            );
            RouteOutcome::DeliveryMiss
        } else {
            trace!(
                user = %sender.user_id,
                destination = ?target,
                event = payload.name(),
                recipients = delivered,
                "Routed"
            );
            RouteOutcome::Delivered(delivered)
        }
    }

    /// One independent, non-blocking push per recipient.
    fn fan_out<'a>(
        &self,
        recipients: impl Iterator<Item = &'a ConnectionId>,
        payload: &Arc<ServerEvent>,
    ) -> usize {
        recipients
            .filter(|c| self.sessions.send(c, Arc::clone(payload)))
            .count()
    }

    fn reply(&self, connection_id: &ConnectionId, event: ServerEvent) {
        if !self.sessions.send(connection_id, Arc::new(event)) {
            warn!(connection = %connection_id, "Reply to closed session dropped");
        }
    }

    /// Connections that would receive an event for `target` from `origin`.
    #[must_use]
    pub fn resolve(&self, origin: &ConnectionId, sender: &UserId, target: &Target) -> HashSet<ConnectionId> {
        match target {
            Target::User(user_id) => self
                .presence
                .connections_for(user_id)
                .into_iter()
                .filter(|c| c != origin)
                .collect(),
            Target::Room(room) => {
                let own = self.presence.connections_for(sender);
                self.rooms
                    .members(room)
                    .into_iter()
                    .filter(|c| c != origin && !own.contains(c))
                    .collect()
            }
        }
    }
}
