//! # chatter-protocol
//!
//! Wire protocol definitions for the Chatter realtime chat server.
//!
//! Every event travels as an envelope naming the event and carrying its
//! payload:
//!
//! ```json
//! {"event": "message:send", "data": {"receiver": "u-2", "content": "hi"}}
//! ```
//!
//! ## Events
//!
//! - [`ClientEvent`] - what a connected client may send
//! - [`ServerEvent`] - what the server pushes to connections
//!
//! ## Encodings
//!
//! JSON text frames are the default. Clients that prefer a compact binary form
//! can request MessagePack, which is framed with a 4-byte length prefix.
//!
//! ```rust
//! use chatter_protocol::{codec, ClientEvent, TypingTarget};
//!
//! let event = ClientEvent::TypingStart(TypingTarget::room("lobby"));
//!
//! let text = codec::encode_json(&event).unwrap();
//! let back: ClientEvent = codec::decode_json(&text).unwrap();
//! assert_eq!(event, back);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, decode_json, encode, encode_json, Encoding, ProtocolError};
pub use events::{
    ChatMessage, ClientEvent, ConnectionAck, ErrorNotice, ReadReceipt, ReadUpdate, RoomRequest,
    ServerEvent, TypingNotice, TypingTarget,
};
