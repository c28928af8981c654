//! Relay core: per-connection frame processing.
//!
//! One `ChatRelay` instance is shared by every connection task. The
//! transport layer (WebSocket routes in the server crate) owns the
//! socket and the read/write loops; this module owns the semantics of
//! each inbound frame — handshake resolution, validation, persistence
//! and fan-out — so the state machines stay testable without a network.
//!
//! User channel: `Connecting → Authenticated → Active → Closed`.
//! The transport calls [`ChatRelay::authenticate`] with the first frame
//! (Connecting → Authenticated), registers with the registry
//! (→ Active), then calls [`ChatRelay::handle_user_frame`] per frame
//! until the socket closes.
//!
//! Admin channel: `Connecting → Active → Closed`. No handshake; the
//! transport registers immediately and calls
//! [`ChatRelay::handle_admin_frame`] per frame.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::dispatch::FanoutDispatcher;
use crate::error::RelayError;
use crate::registry::ConnectionRegistry;
use crate::store::{MessageStore, StoreError};
use crate::types::{
    validate_meta, validate_text, AdminFrame, ChatMessage, HandshakeFrame, MessageSender, UserFrame,
};
use crate::AppState;

/// What became of one inbound message frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// The frame was persisted and fanned out.
    Relayed(ChatMessage),
    /// The frame was dropped silently (blank text, oversized text,
    /// malformed shape, unknown target user). The connection stays
    /// open and the sender is told nothing; absence of the "message"
    /// push is the only signal.
    Dropped,
}

impl FrameOutcome {
    /// True when the frame produced a persisted message.
    pub fn is_relayed(&self) -> bool {
        matches!(self, FrameOutcome::Relayed(_))
    }
}

/// Shared relay core, one instance per server.
///
/// Cheap to clone; connection tasks each hold one.
pub struct ChatRelay<S> {
    state: Arc<S>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn MessageStore>,
    dispatcher: FanoutDispatcher,
}

impl<S> Clone for ChatRelay<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<S: AppState> ChatRelay<S> {
    /// Create the relay core over its collaborators.
    pub fn new(state: Arc<S>, registry: Arc<ConnectionRegistry>, store: Arc<dyn MessageStore>) -> Self {
        let dispatcher = FanoutDispatcher::new(Arc::clone(&registry));
        Self {
            state,
            registry,
            store,
            dispatcher,
        }
    }

    /// The connection registry connection tasks register with.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The message store shared with the HTTP history path.
    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    /// Resolve a user-channel handshake frame into a user identity.
    ///
    /// Any shape other than an object carrying a valid credential is an
    /// auth failure; the transport closes with the policy-violation
    /// code and the client must reconnect with a fresh token.
    #[instrument(skip(self, raw))]
    pub async fn authenticate(&self, raw: &str) -> Result<i64, RelayError> {
        let handshake: HandshakeFrame = serde_json::from_str(raw)
            .map_err(|_| RelayError::auth_failed("handshake is not a token object"))?;

        let token = handshake
            .token
            .ok_or_else(|| RelayError::auth_failed("handshake carries no token"))?;

        let user_id = self.state.resolve_token(&token).await?;
        debug!(user_id, "User channel authenticated");
        Ok(user_id)
    }

    /// Process one inbound frame from an authenticated user connection.
    ///
    /// Returns `Err` only for unparseable input (the transport treats
    /// that as an unrecoverable read failure) or a store failure (the
    /// frame is lost but the connection survives).
    #[instrument(skip(self, raw), fields(user_id = user_id))]
    pub async fn handle_user_frame(&self, user_id: i64, raw: &str) -> Result<FrameOutcome, RelayError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Ok(FrameOutcome::Dropped);
        }

        // Fields deserialize loosely; a frame that still fails the
        // schema is dropped, not treated as a read failure.
        let Ok(frame) = serde_json::from_value::<UserFrame>(value) else {
            return Ok(FrameOutcome::Dropped);
        };

        let Some(text) = validate_text(frame.text.as_deref()) else {
            return Ok(FrameOutcome::Dropped);
        };
        let meta = validate_meta(frame.meta);

        let message = self.relay(user_id, MessageSender::User, &text, meta).await?;
        Ok(FrameOutcome::Relayed(message))
    }

    /// Process one inbound frame from an admin connection.
    ///
    /// The frame addresses a target conversation by `userId`; a missing
    /// or malformed target, blank text, or a target absent from the
    /// user directory all drop the frame silently. Best-effort relay,
    /// not a reliable delivery protocol.
    #[instrument(skip(self, raw))]
    pub async fn handle_admin_frame(&self, raw: &str) -> Result<FrameOutcome, RelayError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Ok(FrameOutcome::Dropped);
        }

        let Ok(frame) = serde_json::from_value::<AdminFrame>(value) else {
            return Ok(FrameOutcome::Dropped);
        };

        let Some(user_id) = frame.user_id else {
            return Ok(FrameOutcome::Dropped);
        };
        let Some(text) = validate_text(frame.text.as_deref()) else {
            return Ok(FrameOutcome::Dropped);
        };

        if !self.state.user_exists(user_id).await? {
            debug!(user_id, "Dropping admin frame for unknown user");
            return Ok(FrameOutcome::Dropped);
        }
        let meta = validate_meta(frame.meta);

        let message = self.relay(user_id, MessageSender::Admin, &text, meta).await?;
        Ok(FrameOutcome::Relayed(message))
    }

    /// Persist a validated message, then fan it out.
    ///
    /// Persistence strictly precedes delivery: if the append fails,
    /// nothing is pushed anywhere. Shared with the HTTP append path.
    pub async fn relay(
        &self,
        user_id: i64,
        sender: MessageSender,
        text: &str,
        meta: Option<Value>,
    ) -> Result<ChatMessage, StoreError> {
        let message = self.store.append(user_id, sender, text, meta).await?;

        let outcome = self.dispatcher.publish(&message);
        if outcome.failed > 0 {
            warn!(
                message_id = message.id,
                failed = outcome.failed,
                "Some recipients were dropped during fan-out"
            );
        }

        Ok(message)
    }
}
