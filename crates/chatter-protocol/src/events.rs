//! Event types for the Chatter protocol.
//!
//! Events are the unit of communication between clients and the server.
//! Both directions use the same envelope: an `event` name and a `data`
//! payload whose shape depends on the name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A chat message as sent by a client with `message:send`.
///
/// Fields the server does not interpret are kept in `extra` and echoed
/// back to recipients unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Sending user. Always overwritten with the authenticated identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Recipient user for direct messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Target room for group messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Text body. May be empty when a media reference is attached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reference to attached media (e.g. an upload path).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<String>,
    /// Attached image, the name older clients use for `media`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Whether the message is addressed to a room. Absent means direct.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_group_message: Option<bool>,
    /// Any other fields supplied by the client.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Create a direct message to a user.
    #[must_use]
    pub fn direct(receiver: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            receiver: Some(receiver.into()),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// Create a group message to a room.
    #[must_use]
    pub fn group(room: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            room: Some(room.into()),
            content: Some(content.into()),
            is_group_message: Some(true),
            ..Self::default()
        }
    }

    /// Attach a media reference.
    #[must_use]
    pub fn with_media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }

    /// Whether the message is addressed to a room.
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.is_group_message.unwrap_or(false)
    }

    /// The attached media reference under either field name.
    #[must_use]
    pub fn media_ref(&self) -> Option<&str> {
        self.media
            .as_deref()
            .or(self.image.as_deref())
            .filter(|m| !m.is_empty())
    }

    /// Whether the message has a non-empty body or a media reference.
    #[must_use]
    pub fn has_body(&self) -> bool {
        let has_content = self.content.as_deref().is_some_and(|c| !c.is_empty());
        has_content || self.media_ref().is_some()
    }
}

/// Target of a typing indicator. Exactly one field is expected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl TypingTarget {
    #[must_use]
    pub fn user(recipient_id: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id.into()),
            room: None,
        }
    }

    #[must_use]
    pub fn room(room: impl Into<String>) -> Self {
        Self {
            recipient_id: None,
            room: Some(room.into()),
        }
    }
}

/// A read receipt sent by the reader of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    /// The message that was read.
    pub message_id: String,
    /// The user who originally sent the message.
    pub sender_id: String,
}

/// Room membership request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRequest {
    pub room: String,
}

impl RoomRequest {
    #[must_use]
    pub fn new(room: impl Into<String>) -> Self {
        Self { room: room.into() }
    }
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Send a direct or group message.
    #[serde(rename = "message:send")]
    MessageSend(ChatMessage),

    /// Start showing a typing indicator.
    #[serde(rename = "typing:start")]
    TypingStart(TypingTarget),

    /// Stop showing a typing indicator.
    #[serde(rename = "typing:stop")]
    TypingStop(TypingTarget),

    /// Mark a message as read.
    #[serde(rename = "message:read")]
    MessageRead(ReadReceipt),

    /// Subscribe this connection to a room.
    #[serde(rename = "room:join")]
    RoomJoin(RoomRequest),

    /// Unsubscribe this connection from a room.
    #[serde(rename = "room:leave")]
    RoomLeave(RoomRequest),

    /// Application-level keepalive.
    #[serde(rename = "ping")]
    Ping,
}

impl ClientEvent {
    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::MessageSend(_) => "message:send",
            ClientEvent::TypingStart(_) => "typing:start",
            ClientEvent::TypingStop(_) => "typing:stop",
            ClientEvent::MessageRead(_) => "message:read",
            ClientEvent::RoomJoin(_) => "room:join",
            ClientEvent::RoomLeave(_) => "room:leave",
            ClientEvent::Ping => "ping",
        }
    }
}

/// Admission acknowledgement sent to a newly connected session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAck {
    pub user_id: String,
    pub connection_id: String,
}

/// Typing indicator as seen by recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

/// Read receipt as seen by the original sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadUpdate {
    pub message_id: String,
    pub read_by: String,
    pub read_at: DateTime<Utc>,
}

/// Error reported to the originating connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub error: String,
}

/// Events the server pushes to connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// The connection has been admitted.
    #[serde(rename = "connection:success")]
    ConnectionSuccess(ConnectionAck),

    /// Current set of online users.
    #[serde(rename = "users:online")]
    UsersOnline(Vec<String>),

    /// A message addressed to this connection's user or room.
    #[serde(rename = "message:receive")]
    MessageReceive(ChatMessage),

    /// Someone started typing.
    #[serde(rename = "typing:display")]
    TypingDisplay(TypingNotice),

    /// Someone stopped typing.
    #[serde(rename = "typing:hide")]
    TypingHide(TypingNotice),

    /// A previously sent message was read.
    #[serde(rename = "message:read:update")]
    ReadUpdate(ReadUpdate),

    /// An inbound event was rejected.
    #[serde(rename = "message:error")]
    MessageError(ErrorNotice),

    /// Room subscription confirmed.
    #[serde(rename = "room:joined")]
    RoomJoined(RoomRequest),

    /// Room unsubscription confirmed.
    #[serde(rename = "room:left")]
    RoomLeft(RoomRequest),

    /// Reply to a client `ping`.
    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent {
    /// Create a `message:error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::MessageError(ErrorNotice {
            error: message.into(),
        })
    }

    /// The wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ConnectionSuccess(_) => "connection:success",
            ServerEvent::UsersOnline(_) => "users:online",
            ServerEvent::MessageReceive(_) => "message:receive",
            ServerEvent::TypingDisplay(_) => "typing:display",
            ServerEvent::TypingHide(_) => "typing:hide",
            ServerEvent::ReadUpdate(_) => "message:read:update",
            ServerEvent::MessageError(_) => "message:error",
            ServerEvent::RoomJoined(_) => "room:joined",
            ServerEvent::RoomLeft(_) => "room:left",
            ServerEvent::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_send_accepts_image_and_keeps_extra_fields() {
        let raw = json!({
            "event": "message:send",
            "data": {
                "receiver": "u-2",
                "content": "",
                "image": "/uploads/cat.png",
                "isGroupMessage": false,
                "_id": "m-17",
                "messageType": "image"
            }
        });

        let event: ClientEvent = serde_json::from_value(raw).unwrap();
        let ClientEvent::MessageSend(msg) = event else {
            panic!("expected message:send");
        };

        assert_eq!(msg.receiver.as_deref(), Some("u-2"));
        assert_eq!(msg.media_ref(), Some("/uploads/cat.png"));
        assert!(msg.media.is_none());
        assert!(!msg.is_group());
        assert!(msg.has_body());
        assert_eq!(msg.extra.get("_id"), Some(&json!("m-17")));
        assert_eq!(msg.extra.get("messageType"), Some(&json!("image")));
    }

    #[test]
    fn test_message_receive_echoes_client_fields() {
        let sent = json!({
            "receiver": "u-2",
            "content": "",
            "image": "/uploads/cat.png",
            "messageType": "image"
        });

        let mut msg: ChatMessage = serde_json::from_value(sent.clone()).unwrap();
        msg.sender = Some("u-1".into());
        let value = serde_json::to_value(ServerEvent::MessageReceive(msg)).unwrap();

        let mut expected = sent;
        expected["sender"] = json!("u-1");
        assert_eq!(value["event"], "message:receive");
        assert_eq!(value["data"], expected);
    }

    #[test]
    fn test_has_body() {
        assert!(ChatMessage::direct("u-2", "hi").has_body());
        assert!(!ChatMessage::direct("u-2", "").has_body());
        assert!(ChatMessage::direct("u-2", "").with_media("/a.png").has_body());
        assert!(!ChatMessage::default().has_body());

        let image_only = ChatMessage {
            image: Some("/b.png".into()),
            ..ChatMessage::direct("u-2", "")
        };
        assert!(image_only.has_body());
    }

    #[test]
    fn test_typing_target_wire_names() {
        let event = ClientEvent::TypingStart(TypingTarget::user("u-9"));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "typing:start", "data": {"recipientId": "u-9"}})
        );
    }

    #[test]
    fn test_ping_without_data() {
        let event: ClientEvent = serde_json::from_value(json!({"event": "ping"})).unwrap();
        assert_eq!(event, ClientEvent::Ping);
        assert_eq!(event.name(), "ping");
    }

    #[test]
    fn test_server_event_shapes() {
        let ack = ServerEvent::ConnectionSuccess(ConnectionAck {
            user_id: "u-1".into(),
            connection_id: "conn_1".into(),
        });
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"event": "connection:success", "data": {"userId": "u-1", "connectionId": "conn_1"}})
        );

        let online = ServerEvent::UsersOnline(vec!["u-1".into(), "u-2".into()]);
        assert_eq!(
            serde_json::to_value(&online).unwrap(),
            json!({"event": "users:online", "data": ["u-1", "u-2"]})
        );

        let error = ServerEvent::error("nope");
        assert_eq!(error.name(), "message:error");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"event": "message:error", "data": {"error": "nope"}})
        );
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_value(json!({"event": "user:online", "data": "u-1"}));
        assert!(result.is_err());
    }
}
