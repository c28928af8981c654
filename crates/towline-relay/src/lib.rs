//! Towline chat relay library.
//!
//! Core of the customer-support chat backend for the Towline roadside
//! assistance service: a realtime relay that moves messages between a
//! customer's live connections and the support-staff pool, persisting
//! every message before it is fanned out.
//!
//! The library is transport-agnostic. The server crate owns the
//! WebSocket endpoints and feeds raw frames into [`ChatRelay`]; this
//! crate owns the connection registry, validation, persistence, and
//! fan-out semantics.

use std::future::Future;

pub mod dispatch;
pub mod error;
pub mod registry;
pub mod session;
pub mod store;
pub mod types;

pub use dispatch::{FanoutDispatcher, PublishOutcome};
pub use error::RelayError;
pub use registry::{
    ConnectionId, ConnectionKind, ConnectionRegistry, OutboundMessage, RegistrationGuard,
    SendResult,
};
pub use session::{ChatRelay, FrameOutcome};
pub use store::{LibSqlMessageStore, MessageStore, StoreError};
pub use types::{ChatMessage, Envelope, MessageSender, MAX_TEXT_LENGTH};

/// Backend facilities the relay needs from the surrounding application.
///
/// The server crate implements this over its credential verifier and
/// user directory; tests implement it with in-memory fakes.
pub trait AppState: Send + Sync + 'static {
    /// Resolve a handshake credential into a user id.
    ///
    /// Returns [`RelayError::AuthFailed`] for any credential that does
    /// not map to a known user.
    fn resolve_token(&self, token: &str) -> impl Future<Output = Result<i64, RelayError>> + Send;

    /// Whether a user id exists in the user directory.
    ///
    /// Admin frames addressed to nonexistent users are dropped without
    /// persisting anything.
    fn user_exists(&self, user_id: i64) -> impl Future<Output = Result<bool, RelayError>> + Send;
}
