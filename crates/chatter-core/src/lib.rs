//! # chatter-core
//!
//! Presence tracking and event routing behind Chatter's persistent
//! connections.
//!
//! This crate provides the building blocks:
//!
//! - **Handshake** - Resolve a connection's token to a user
//! - **Presence** - Which users are online, through which connections
//! - **Router** - Fan message, typing and read-receipt events out to live sessions
//! - **Lifecycle** - Admission and teardown of connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Handshake  │────▶│  Lifecycle  │────▶│  Presence   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   ▲
//!                            ▼                   │
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Sessions   │◀────│   Router    │──▶ Rooms
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod auth;
pub mod connection;
pub mod directory;
pub mod lifecycle;
pub mod presence;
pub mod room;
pub mod router;
pub mod session;

pub use auth::{AuthError, Handshake, JwtVerifier, TokenVerifier, AUTH_FAILED_MESSAGE};
pub use connection::{Connection, ConnectionId, ConnectionState, Identity, UserId};
pub use directory::{DirectoryError, MemoryDirectory, UserDirectory, UserProfile, UserStatus};
pub use lifecycle::{Lifecycle, LifecycleConfig, LifecycleError};
pub use presence::{Deregistration, PresenceRegistry, PresenceStats, PresenceStore};
pub use room::{RoomError, RoomId, RoomTable};
pub use router::{EventRouter, RouteError, RouteOutcome, RoutableEvent, Target, ValidationError};
pub use session::{Inbox, Outbox, SessionTable};
