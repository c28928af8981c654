//! Wire and domain types for the chat relay.
//!
//! Everything that crosses a WebSocket boundary lives here: the inbound
//! frame shapes for the user and admin channels, the outbound message
//! envelope, and the persisted `ChatMessage` itself. Field names follow
//! the JSON protocol (camelCase) rather than Rust conventions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Maximum message text length in characters.
///
/// Measured in characters, not bytes; the boundary is inclusive
/// (2000 is accepted, 2001 is dropped).
pub const MAX_TEXT_LENGTH: usize = 2000;

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSender {
    /// The conversation owner (a customer).
    User,
    /// A support operator.
    Admin,
}

impl MessageSender {
    /// Database column representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageSender::User => "user",
            MessageSender::Admin => "admin",
        }
    }

    /// Parse the database column representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageSender::User),
            "admin" => Some(MessageSender::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted chat message.
///
/// Immutable once created; `id` and `created_at` are assigned by the
/// message store at append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Store-assigned unique id (monotonic per store).
    pub id: i64,
    /// Identity of the conversation owner. Every message belongs to
    /// exactly one user's conversation, regardless of who sent it.
    pub user_id: i64,
    /// Who authored the message.
    pub sender: MessageSender,
    /// Message text, already trimmed and length-validated.
    pub text: String,
    /// Assigned at persistence time.
    pub created_at: DateTime<Utc>,
    /// Optional opaque structured payload, passed through unvalidated.
    /// Serialized as an explicit `null` when absent.
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Handshake frame, first inbound frame on the user channel.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeFrame {
    /// Bearer credential to resolve into a user identity.
    pub token: Option<String>,
}

/// Inbound frame on the user channel.
///
/// Every field is deserialized loosely: a wrong-typed field maps to
/// `None`, which the relay treats as a frame to drop, never as a
/// connection-fatal parse error.
#[derive(Debug, Clone, Deserialize)]
pub struct UserFrame {
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub text: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Inbound frame on the admin channel.
///
/// `userId` is the target conversation. Clients send it either as a
/// JSON number or a numeric string; both are accepted. Like
/// [`UserFrame`], wrong-typed fields become `None` rather than errors.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminFrame {
    #[serde(
        rename = "userId",
        default,
        deserialize_with = "deserialize_loose_user_id"
    )]
    pub user_id: Option<i64>,
    #[serde(default, deserialize_with = "deserialize_loose_text")]
    pub text: Option<String>,
    #[serde(default)]
    pub meta: Option<Value>,
}

/// Outbound push envelope, identical on both channels.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    /// Frame discriminator, always `"message"` for relayed messages.
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: ChatMessage,
}

impl Envelope {
    /// Wrap a persisted message for delivery.
    pub fn message(data: ChatMessage) -> Self {
        Self {
            kind: "message",
            data,
        }
    }
}

/// Accept a user id given as a JSON number or a numeric string.
///
/// Anything else (including a non-numeric string) maps to `None`, which
/// the caller treats as a malformed frame to drop.
fn deserialize_loose_user_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

/// Accept message text only when it is a JSON string.
///
/// Anything else maps to `None`; validation then drops the frame.
fn deserialize_loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}

/// Trim and validate inbound message text.
///
/// Returns the trimmed text when it is non-empty and within
/// [`MAX_TEXT_LENGTH`], `None` otherwise. Blank and oversized frames
/// are dropped silently by the relay, so there is no error type here.
pub fn validate_text(raw: Option<&str>) -> Option<String> {
    let text = raw?.trim();
    if text.is_empty() || text.chars().count() > MAX_TEXT_LENGTH {
        return None;
    }
    Some(text.to_string())
}

/// Keep `meta` only when it is a JSON object; anything else is discarded.
pub fn validate_meta(meta: Option<Value>) -> Option<Value> {
    match meta {
        Some(Value::Object(map)) => Some(Value::Object(map)),
        _ => None,
    }
}
