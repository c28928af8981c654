//! Error types for the chat relay.

use thiserror::Error;

use crate::store::StoreError;

/// Chat relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Handshake credential was missing, invalid, or expired.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// An inbound frame was not valid JSON.
    ///
    /// Valid JSON of the wrong shape is dropped silently instead; this
    /// variant only covers unparseable input, which the caller treats
    /// as an unrecoverable read failure.
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    /// Message store failure. Fatal to the current frame only; the
    /// connection stays open.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether this error should close the connection with the
    /// auth-failure close code.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, RelayError::AuthFailed(_))
    }
}
