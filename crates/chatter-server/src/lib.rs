//! # chatter-server
//!
//! WebSocket front end for [`chatter_core`]: authenticates connections,
//! decodes client events and writes queued server events back out.

pub mod config;
pub mod handlers;
pub mod metrics;
