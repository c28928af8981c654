//! WebSocket chat endpoints.
//!
//! `GET /ws/user` carries the customer side: the first text frame is a
//! handshake `{"token": "..."}` and a rejected credential closes the
//! socket with code 4403. `GET /ws/admin` carries the support side and
//! needs no handshake.
//!
//! Each upgraded socket runs one session loop that multiplexes the
//! inbound stream with the connection's outbound queue, so fan-out from
//! other connections never waits on this socket's reads.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use towline_relay::{ConnectionKind, RegistrationGuard, RelayError};

use crate::state::ServerState;

/// Close code for a rejected handshake credential.
const CLOSE_POLICY_VIOLATION: u16 = 4403;
/// Close code for unrecoverable read failures mid-session.
const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Per-connection outbound queue depth.
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// GET /ws/user
///
/// Customer chat channel. Authenticated by the first frame.
pub async fn user_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_user_socket(socket, state))
}

/// GET /ws/admin
///
/// Support operator channel, joined straight into the admin pool.
pub async fn admin_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_admin_socket(socket, state))
}

async fn handle_user_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();

    let Some(raw) = next_text_frame(&mut stream, &mut sink).await else {
        debug!("User channel closed before handshake");
        return;
    };

    let user_id = match state.relay.authenticate(&raw).await {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!(error = %e, "User channel rejected");
            close_with(&mut sink, CLOSE_POLICY_VIOLATION, "authentication failed").await;
            return;
        }
    };

    info!(user_id, "User channel active");
    run_session(sink, stream, state, ConnectionKind::User(user_id)).await;
}

async fn handle_admin_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (sink, stream) = socket.split();

    info!("Admin channel active");
    run_session(sink, stream, state, ConnectionKind::Admin).await;
}

/// Read frames until the first text frame; answer pings in the meantime.
///
/// Returns `None` when the peer goes away before sending one.
async fn next_text_frame(
    stream: &mut SplitStream<WebSocket>,
    sink: &mut SplitSink<WebSocket, Message>,
) -> Option<String> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Ping(data)) => {
                sink.send(Message::Pong(data)).await.ok()?;
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Run one registered session until either side goes away.
///
/// The registration guard ties the registry entry to this stack frame,
/// so every exit path below unregisters exactly once.
async fn run_session(
    mut sink: SplitSink<WebSocket, Message>,
    mut stream: SplitStream<WebSocket>,
    state: Arc<ServerState>,
    kind: ConnectionKind,
) {
    let registry = Arc::clone(state.relay.registry());
    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let conn_id = match kind {
        ConnectionKind::User(user_id) => registry.register_user(user_id, tx),
        ConnectionKind::Admin => registry.register_admin(tx),
    };
    let _guard = RegistrationGuard::new(registry, conn_id);

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(message) = outbound else { break };
                if let Err(e) = sink.send(Message::Text(message.payload.to_string())).await {
                    debug!(conn_id = %conn_id, error = %e, "Push failed, closing");
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match handle_frame(&state, kind, &text).await {
                            Ok(_) => {}
                            Err(RelayError::MalformedFrame(e)) => {
                                warn!(conn_id = %conn_id, error = %e, "Malformed frame, closing");
                                close_with(&mut sink, CLOSE_INTERNAL_ERROR, "malformed frame").await;
                                break;
                            }
                            Err(e) => {
                                // Store or backend failure: this frame is
                                // lost, the connection survives.
                                error!(conn_id = %conn_id, error = %e, "Failed to relay frame");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(conn_id = %conn_id, "Binary frames are not supported");
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    info!(conn_id = %conn_id, kind = ?kind, "Channel closed");
}

async fn handle_frame(
    state: &ServerState,
    kind: ConnectionKind,
    text: &str,
) -> Result<towline_relay::FrameOutcome, RelayError> {
    match kind {
        ConnectionKind::User(user_id) => state.relay.handle_user_frame(user_id, text).await,
        ConnectionKind::Admin => state.relay.handle_admin_frame(text).await,
    }
}

async fn close_with(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}
