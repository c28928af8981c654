//! Server configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `TOWLINE_ADDR`: Socket address to bind. Default: `0.0.0.0:3000`
//! - `TOWLINE_DB_PATH`: libSQL database file path. Default: `towline.db`
//! - `TOWLINE_JWT_SECRET`: HS256 secret for bearer tokens. Default: a
//!   development-only value that must be overridden in production.

use std::net::SocketAddr;
use tracing::{info, warn};

const DEFAULT_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_DB_PATH: &str = "towline.db";
const DEFAULT_JWT_SECRET: &str = "towline-dev-secret";

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,
    /// Path to the libSQL database file (`:memory:` for ephemeral)
    pub db_path: String,
    /// HS256 secret used to verify bearer tokens
    pub jwt_secret: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            // DEFAULT_ADDR is a valid literal; parse cannot fail.
            bind_addr: DEFAULT_ADDR.parse().unwrap_or(SocketAddr::from(([0, 0, 0, 0], 3000))),
            db_path: DEFAULT_DB_PATH.to_string(),
            jwt_secret: DEFAULT_JWT_SECRET.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load server configuration from environment variables.
    ///
    /// Unset variables fall back to defaults; an unparseable
    /// `TOWLINE_ADDR` falls back with a warning rather than aborting.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_addr = match std::env::var("TOWLINE_ADDR") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(addr = %raw, "Invalid TOWLINE_ADDR, using default");
                defaults.bind_addr
            }),
            Err(_) => defaults.bind_addr,
        };

        let db_path = std::env::var("TOWLINE_DB_PATH").unwrap_or(defaults.db_path);
        let jwt_secret = std::env::var("TOWLINE_JWT_SECRET").unwrap_or(defaults.jwt_secret);

        Self {
            bind_addr,
            db_path,
            jwt_secret,
        }
    }

    /// Log the current server configuration.
    pub fn log_config(&self) {
        info!("Bind address: {}", self.bind_addr);
        info!("Database path: {}", self.db_path);

        if self.jwt_secret == DEFAULT_JWT_SECRET {
            warn!("TOWLINE_JWT_SECRET not set; using the development secret");
        }
    }

    /// Create a test configuration over an in-memory database.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            db_path: ":memory:".to_string(),
            jwt_secret: "test-secret".to_string(),
        }
    }
}
