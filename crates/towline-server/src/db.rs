//! Database bootstrap and the user directory.
//!
//! The server keeps one libSQL database holding both the user directory
//! and the chat message log; the shared connection is handed to the
//! relay's message store so everything lives in the same file.

use std::sync::Arc;

use libsql::Connection;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use towline_relay::StoreError;

const USERS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    phone        TEXT    NOT NULL UNIQUE,
    display_name TEXT,
    created_at   TEXT    NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

/// Handle to the server database.
///
/// Cheap to clone; all clones share one persistent connection. For
/// `:memory:` databases the shared connection is what keeps the data
/// alive between calls.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the database at the given path.
    ///
    /// Accepts `:memory:` for an ephemeral database.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(path).build().await?;
        let conn = db.connect()?;
        info!(path, "Opened database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// The shared connection, for components that store alongside the
    /// user directory.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Create the users schema.
    #[instrument(skip(self))]
    pub async fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(USERS_SCHEMA).await?;
        debug!("User directory schema initialized");
        Ok(())
    }

    /// Whether a user id exists in the directory.
    pub async fn user_exists(&self, user_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT 1 FROM users WHERE id = ?", libsql::params![user_id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Quick reachability probe for health checks.
    pub async fn health_check(&self) -> Result<bool, StoreError> {
        let conn = self.conn.lock().await;
        let mut rows = conn.query("SELECT 1", ()).await?;
        Ok(rows.next().await?.is_some())
    }

    /// Insert a user and return the assigned id. Test seeding helper.
    #[cfg(test)]
    pub async fn create_user(&self, phone: &str, display_name: &str) -> Result<i64, StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (phone, display_name) VALUES (?, ?)",
            libsql::params![phone, display_name],
        )
        .await?;
        Ok(conn.last_insert_rowid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        db.initialize().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_user_exists_after_create() {
        let db = memory_db().await;

        let id = db.create_user("+15551230001", "Dana").await.unwrap();
        assert!(db.user_exists(id).await.unwrap());
        assert!(!db.user_exists(id + 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check() {
        let db = memory_db().await;
        assert!(db.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let db = memory_db().await;
        db.initialize().await.unwrap();
        db.initialize().await.unwrap();
    }
}
