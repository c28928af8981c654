//! Shared server state and the relay's backend implementation.

use std::sync::Arc;

use tracing::debug;

use towline_relay::{AppState, ChatRelay, ConnectionRegistry, LibSqlMessageStore, RelayError};

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::db::Database;

/// The relay's view of the rest of the server: bearer token
/// verification plus the user directory.
pub struct Backend {
    verifier: TokenVerifier,
    db: Database,
}

impl Backend {
    pub fn new(verifier: TokenVerifier, db: Database) -> Self {
        Self { verifier, db }
    }
}

impl AppState for Backend {
    async fn resolve_token(&self, token: &str) -> Result<i64, RelayError> {
        let user_id = self.verifier.verify(token)?;

        // A well-signed token for a deleted user is still invalid.
        if !self.db.user_exists(user_id).await? {
            debug!(user_id, "Token subject not in user directory");
            return Err(RelayError::auth_failed("unknown user"));
        }

        Ok(user_id)
    }

    async fn user_exists(&self, user_id: i64) -> Result<bool, RelayError> {
        Ok(self.db.user_exists(user_id).await?)
    }
}

/// State shared by every route handler.
pub struct ServerState {
    pub relay: ChatRelay<Backend>,
    pub backend: Arc<Backend>,
    pub db: Database,
}

impl ServerState {
    /// Open the database, run schema bootstrap, and wire up the relay.
    pub async fn bootstrap(config: &ServerConfig) -> anyhow::Result<Self> {
        let db = Database::open(&config.db_path).await?;
        db.initialize().await?;

        let store = LibSqlMessageStore::from_shared(db.connection());
        store.initialize().await?;

        let backend = Arc::new(Backend::new(
            TokenVerifier::new(&config.jwt_secret),
            db.clone(),
        ));
        let relay = ChatRelay::new(
            Arc::clone(&backend),
            Arc::new(ConnectionRegistry::new()),
            Arc::new(store),
        );

        Ok(Self { relay, backend, db })
    }
}
