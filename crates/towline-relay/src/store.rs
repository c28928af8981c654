//! Message store trait and libSQL implementation.
//!
//! Provides durable append/list of conversation messages. The store is
//! the ordering authority for a conversation: `list` returns messages
//! oldest first, ordered by creation time with id as the tiebreak, and
//! every message is appended here before any fan-out is attempted.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::Connection;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::types::{ChatMessage, MessageSender};

/// Errors that can occur during message store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl From<libsql::Error> for StoreError {
    fn from(e: libsql::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Trait for conversation message storage backends.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably append a message to a user's conversation.
    ///
    /// The store assigns `id` and `created_at`. The text is expected to
    /// be already trimmed and length-validated by the caller.
    async fn append(
        &self,
        user_id: i64,
        sender: MessageSender,
        text: &str,
        meta: Option<Value>,
    ) -> Result<ChatMessage, StoreError>;

    /// List a user's conversation, oldest first.
    ///
    /// Ordered by `created_at` then `id`, so two messages persisted in
    /// the same instant still come back in append order.
    async fn list(&self, user_id: i64, limit: Option<usize>) -> Result<Vec<ChatMessage>, StoreError>;
}

const CHAT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chat_messages (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    INTEGER NOT NULL,
    sender     TEXT    NOT NULL,
    text       TEXT    NOT NULL,
    created_at TEXT    NOT NULL,
    meta       TEXT
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_user
    ON chat_messages (user_id, created_at, id);
"#;

/// libSQL-based message store.
///
/// Uses an in-memory or file-based libSQL database. The connection is
/// shared behind a mutex; for in-memory databases it must be a
/// persistent connection or the data vanishes between calls.
#[derive(Clone)]
pub struct LibSqlMessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl LibSqlMessageStore {
    /// Create a new store over the given connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Create from a shared connection (for sharing with other components).
    pub fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Initialize the chat_messages schema.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(CHAT_SCHEMA).await?;
        debug!("Message store schema initialized");
        Ok(())
    }

    fn row_to_message(row: &libsql::Row) -> Result<ChatMessage, StoreError> {
        let id: i64 = row
            .get(0)
            .map_err(|e| StoreError::CorruptRow(format!("id: {}", e)))?;
        let user_id: i64 = row
            .get(1)
            .map_err(|e| StoreError::CorruptRow(format!("user_id: {}", e)))?;

        let sender_str: String = row
            .get(2)
            .map_err(|e| StoreError::CorruptRow(format!("sender: {}", e)))?;
        let sender = MessageSender::parse(&sender_str)
            .ok_or_else(|| StoreError::CorruptRow(format!("unknown sender '{}'", sender_str)))?;

        let text: String = row
            .get(3)
            .map_err(|e| StoreError::CorruptRow(format!("text: {}", e)))?;

        let created_at_str: String = row
            .get(4)
            .map_err(|e| StoreError::CorruptRow(format!("created_at: {}", e)))?;
        let created_at: DateTime<Utc> = created_at_str
            .parse()
            .map_err(|e| StoreError::CorruptRow(format!("created_at parse: {}", e)))?;

        let meta_str: Option<String> = row.get(5).ok();
        let meta = meta_str
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::CorruptRow(format!("meta parse: {}", e)))?;

        Ok(ChatMessage {
            id,
            user_id,
            sender,
            text: text.to_string(),
            created_at,
            meta,
        })
    }
}

#[async_trait]
impl MessageStore for LibSqlMessageStore {
    #[instrument(skip(self, text, meta), fields(user_id = user_id, sender = %sender))]
    async fn append(
        &self,
        user_id: i64,
        sender: MessageSender,
        text: &str,
        meta: Option<Value>,
    ) -> Result<ChatMessage, StoreError> {
        let created_at = Utc::now();
        let meta_str = meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO chat_messages (user_id, sender, text, created_at, meta)
             VALUES (?, ?, ?, ?, ?)",
            libsql::params![
                user_id,
                sender.as_str(),
                text,
                created_at.to_rfc3339(),
                meta_str
            ],
        )
        .await?;

        let id = conn.last_insert_rowid();
        debug!(message_id = id, "Appended chat message");

        Ok(ChatMessage {
            id,
            user_id,
            sender,
            text: text.to_string(),
            created_at,
            meta,
        })
    }

    #[instrument(skip(self), fields(user_id = user_id))]
    async fn list(&self, user_id: i64, limit: Option<usize>) -> Result<Vec<ChatMessage>, StoreError> {
        let conn = self.conn.lock().await;

        let mut rows = match limit {
            Some(limit) if limit > 0 => {
                conn.query(
                    "SELECT id, user_id, sender, text, created_at, meta
                     FROM chat_messages
                     WHERE user_id = ?
                     ORDER BY created_at ASC, id ASC
                     LIMIT ?",
                    libsql::params![user_id, limit as i64],
                )
                .await?
            }
            _ => {
                conn.query(
                    "SELECT id, user_id, sender, text, created_at, meta
                     FROM chat_messages
                     WHERE user_id = ?
                     ORDER BY created_at ASC, id ASC",
                    libsql::params![user_id],
                )
                .await?
            }
        };

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(Self::row_to_message(&row)?);
        }

        Ok(messages)
    }
}
