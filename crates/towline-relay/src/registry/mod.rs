//! Connection Registry for real-time message fan-out.
//!
//! This module provides a thread-safe registry that tracks live chat
//! connections, partitioned into per-user sets (customer side) and a
//! flat admin set, so that the dispatcher can deliver a message to
//! every connection interested in a conversation.
//!
//! ## Architecture
//!
//! Each connection registers a channel sender when it becomes active.
//! Fan-out takes a point-in-time snapshot of the relevant membership
//! sets and delivers through the senders outside any registry lock.
//!
//! ```text
//! user socket task (userId=42) <-> ConnectionRegistry <-> admin socket task
//!            |                           |                        |
//!            v                           v                        v
//!      mpsc::Sender            DashMap<ConnectionId,        mpsc::Sender
//!                               ConnectionEntry>
//! ```

mod connection_registry;

pub use connection_registry::{
    ConnectionId, ConnectionKind, ConnectionRegistry, OutboundMessage, RegistrationGuard,
    SendResult,
};
