use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use crate::config::ServerConfig;
use crate::state::ServerState;

mod routes;

/// Start the HTTP server
pub async fn start(config: ServerConfig) -> Result<()> {
    let state = Arc::new(ServerState::bootstrap(&config).await?);

    // Safety net for registry entries whose teardown never ran.
    let registry = Arc::clone(state.relay.registry());
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            registry.cleanup_stale();
        }
    });

    let app = create_router(state);

    info!("Starting Axum HTTP server on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the Axum router with all routes and middleware
pub(crate) fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws/user", get(routes::ws::user_chat_handler))
        .route("/ws/admin", get(routes::ws::admin_chat_handler))
        .route(
            "/api/v1/users/:user_id/chat",
            get(routes::chat::get_history).post(routes::chat::post_message),
        )
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive()) // TODO: Configure proper CORS in production
}

/// Simple health check endpoint (for load balancers)
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    match state.db.health_check().await {
        Ok(true) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "service": "towline-server",
                "version": env!("CARGO_PKG_VERSION"),
            })),
        ),
        Ok(false) => {
            warn!("Health check: database unhealthy");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "towline-server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": "database unhealthy"
                })),
            )
        }
        Err(e) => {
            warn!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "service": "towline-server",
                    "version": env!("CARGO_PKG_VERSION"),
                    "error": format!("database error: {}", e)
                })),
            )
        }
    }
}
