//! Chat history HTTP routes.
//!
//! These share the relay's message store, so a message posted over HTTP
//! is indistinguishable from one sent over a WebSocket: it lands in the
//! same conversation log and is fanned out to the same live connections.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};

use towline_relay::types::{validate_meta, validate_text};
use towline_relay::{AppState, ChatMessage, MessageSender, StoreError};

use crate::state::ServerState;

/// Most messages a single history fetch returns.
const HISTORY_LIMIT: usize = 500;

/// Error responses for the chat routes, rendered FastAPI-style as
/// `{"detail": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("internal error")]
    Internal(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Internal(e) => {
                warn!(error = %e, "Chat route failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// GET /api/v1/users/:user_id/chat
///
/// Full conversation for a user, oldest first, capped at
/// [`HISTORY_LIMIT`] messages.
#[instrument(skip(state))]
pub async fn get_history(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    if !state.db.user_exists(user_id).await? {
        return Err(ApiError::NotFound("user not found".to_string()));
    }

    let messages = state.relay.store().list(user_id, Some(HISTORY_LIMIT)).await?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
pub struct PostChatBody {
    text: Option<String>,
    sender: Option<String>,
    #[serde(default)]
    meta: Option<Value>,
}

/// POST /api/v1/users/:user_id/chat
///
/// Append a message to a user's conversation and fan it out to live
/// connections. The sender defaults to `"user"` when the caller holds a
/// valid bearer token, `"admin"` otherwise; posting as `"user"` always
/// requires a bearer identity matching the conversation owner.
#[instrument(skip(state, headers, body))]
pub async fn post_message(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<PostChatBody>,
) -> Result<impl IntoResponse, ApiError> {
    // Body validation precedes the directory lookup, so a bad payload
    // is 400 even when the user is also unknown.
    let Some(text) = validate_text(body.text.as_deref()) else {
        return Err(ApiError::BadRequest(format!(
            "text must be 1-{} characters",
            towline_relay::MAX_TEXT_LENGTH
        )));
    };

    if !state.db.user_exists(user_id).await? {
        return Err(ApiError::NotFound("user not found".to_string()));
    }

    let bearer_id = match bearer_token(&headers) {
        Some(token) => state.backend.resolve_token(token).await.ok(),
        None => None,
    };

    let sender = match body.sender.as_deref() {
        Some(raw) => MessageSender::parse(raw)
            .ok_or_else(|| ApiError::BadRequest("sender must be 'user' or 'admin'".to_string()))?,
        None if bearer_id.is_some() => MessageSender::User,
        None => MessageSender::Admin,
    };

    if sender == MessageSender::User && bearer_id != Some(user_id) {
        return Err(ApiError::Forbidden(
            "posting as this user requires their bearer token".to_string(),
        ));
    }

    let meta = validate_meta(body.meta);
    let message = state.relay.relay(user_id, sender, &text, meta).await?;

    Ok((StatusCode::CREATED, Json(message)))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::create_router;
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<ServerState>) {
        let state = Arc::new(
            ServerState::bootstrap(&ServerConfig::test_config())
                .await
                .unwrap(),
        );
        (create_router(Arc::clone(&state)), state)
    }

    fn token_for(user_id: i64) -> String {
        encode(
            &Header::default(),
            &json!({
                "sub": user_id.to_string(),
                "exp": chrono::Utc::now().timestamp() + 3600,
            }),
            &EncodingKey::from_secret("test-secret".as_bytes()),
        )
        .unwrap()
    }

    fn post_request(user_id: i64, body: Value, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/users/{user_id}/chat"))
            .header("content-type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_request(user_id: i64) -> Request<Body> {
        Request::builder()
            .uri(format!("/api/v1/users/{user_id}/chat"))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_history_unknown_user_is_404() {
        let (app, _state) = test_app().await;

        let response = app.oneshot(get_request(999)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["detail"], "user not found");
    }

    #[tokio::test]
    async fn test_post_then_get_history_oldest_first() {
        let (app, state) = test_app().await;
        let user_id = state.db.create_user("+15551230001", "Dana").await.unwrap();

        for text in ["first", "second"] {
            let response = app
                .clone()
                .oneshot(post_request(user_id, json!({"text": text}), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
        }

        let response = app.oneshot(get_request(user_id)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let history = body_json(response).await;
        let history = history.as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["text"], "first");
        assert_eq!(history[1]["text"], "second");
        // No bearer token, so both default to the admin sender.
        assert_eq!(history[0]["sender"], "admin");
    }

    #[tokio::test]
    async fn test_post_blank_text_is_400() {
        let (app, state) = test_app().await;
        let user_id = state.db.create_user("+15551230002", "Ray").await.unwrap();

        for body in [json!({"text": "   "}), json!({}), json!({"text": null})] {
            let response = app
                .clone()
                .oneshot(post_request(user_id, body, None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_post_bad_sender_is_400() {
        let (app, state) = test_app().await;
        let user_id = state.db.create_user("+15551230003", "Kim").await.unwrap();

        let response = app
            .oneshot(post_request(
                user_id,
                json!({"text": "hi", "sender": "robot"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_unknown_user_is_404() {
        let (app, _state) = test_app().await;

        let response = app
            .clone()
            .oneshot(post_request(999, json!({"text": "hi"}), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Body validation comes first: blank text is 400 even for an
        // unknown user.
        let response = app
            .oneshot(post_request(999, json!({"text": "  "}), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_as_user_requires_matching_bearer() {
        let (app, state) = test_app().await;
        let user_id = state.db.create_user("+15551230004", "Lee").await.unwrap();
        let other_id = state.db.create_user("+15551230005", "Sam").await.unwrap();

        // No token at all.
        let response = app
            .clone()
            .oneshot(post_request(
                user_id,
                json!({"text": "hi", "sender": "user"}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // Someone else's token.
        let response = app
            .clone()
            .oneshot(post_request(
                user_id,
                json!({"text": "hi", "sender": "user"}),
                Some(&token_for(other_id)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        // The owner's token.
        let response = app
            .oneshot(post_request(
                user_id,
                json!({"text": "hi", "sender": "user"}),
                Some(&token_for(user_id)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["sender"], "user");
    }

    #[tokio::test]
    async fn test_post_with_bearer_defaults_to_user_sender() {
        let (app, state) = test_app().await;
        let user_id = state.db.create_user("+15551230006", "Ana").await.unwrap();

        let response = app
            .oneshot(post_request(
                user_id,
                json!({"text": "hi"}),
                Some(&token_for(user_id)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(body_json(response).await["sender"], "user");
    }

    #[tokio::test]
    async fn test_post_fans_out_to_live_connections() {
        let (app, state) = test_app().await;
        let user_id = state.db.create_user("+15551230007", "Bo").await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        state.relay.registry().register_user(user_id, tx);

        let response = app
            .oneshot(post_request(
                user_id,
                json!({"text": "dispatch update", "meta": {"truckId": 12}}),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let pushed = rx.recv().await.unwrap().to_value().unwrap();
        assert_eq!(pushed["type"], "message");
        assert_eq!(pushed["data"]["text"], "dispatch update");
        assert_eq!(pushed["data"]["meta"]["truckId"], 12);
    }
}
