//! The worker relay endpoint: `/ws/relay/{sessionId}`.
//!
//! The worker authenticates with its single-use access token, gets the
//! session's initial prompt as the very first frame, and then streams
//! newline-delimited JSON both ways. The initial prompt is enqueued before
//! the reader starts, so a worker racing ahead still observes prompt-first
//! ordering from the server.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use hq_core::ids::SessionId;
use hq_protocol::worker::{WorkerCommand, WorkerFrame};
use metrics::counter;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connection::{Connection, ConnectionKind, run_writer};
use super::relay_key;
use crate::metrics::{RELAY_BAD_FRAMES_TOTAL, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::services::AppState;

/// Upgrade handler for worker sockets.
pub async fn relay_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let session_id = SessionId::from_string(session_id);

    let Some(token) = bearer_token(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(json!({"error": "Unauthorized"})),
        )
            .into_response();
    };
    // Consume-once: a replayed or cross-session token fails identically.
    if !state.services.sessions.consume_access_token(&token, &session_id) {
        return (
            StatusCode::FORBIDDEN,
            axum::Json(json!({"error": "Forbidden", "message": "invalid or consumed access token"})),
        )
            .into_response();
    }

    let record = match state.services.store.get_session(&session_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                axum::Json(json!({"error": "Not Found"})),
            )
                .into_response();
        }
        Err(e) => {
            warn!(error = %e, "relay session lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({"error": "Internal Server Error"})),
            )
                .into_response();
        }
    };
    if record.status.is_terminal() {
        return (
            StatusCode::FORBIDDEN,
            axum::Json(json!({"error": "Forbidden", "message": "session is terminal"})),
        )
            .into_response();
    }

    let initial_prompt = record.initial_prompt;
    ws.on_upgrade(move |socket| handle_relay_socket(socket, session_id, initial_prompt, state))
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn handle_relay_socket(
    socket: WebSocket,
    session_id: SessionId,
    initial_prompt: String,
    state: AppState,
) {
    info!(session_id = %session_id, "worker connected");
    counter!(WS_CONNECTIONS_TOTAL, "kind" => "worker").increment(1);

    let conn = Arc::new(Connection::new(
        relay_key(&session_id),
        ConnectionKind::Worker,
        state.services.settings.server.browser_queue_capacity,
    ));
    let _ = state.services.registry.register(Arc::clone(&conn));

    // The initial prompt is the first frame the worker receives. It is
    // enqueued before the reader pump starts, so any bytes the worker
    // emitted early are processed strictly after this send.
    let _ = conn.send_text(Arc::new(
        WorkerCommand::User {
            content: initial_prompt,
        }
        .encode_line(),
    ));

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(run_writer(Arc::clone(&conn), sink));

    state.services.sessions.worker_connected(&session_id).await;

    let keepalive = Duration::from_millis(state.services.settings.timeouts.keepalive_ms);

    loop {
        let next = tokio::time::timeout(keepalive, stream.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(session_id = %session_id, error = %e, "worker socket error");
                state.services.sessions.worker_disconnected(&session_id).await;
                break;
            }
            Ok(None) => {
                state.services.sessions.worker_disconnected(&session_id).await;
                break;
            }
            Err(_) => {
                warn!(session_id = %session_id, "worker keepalive window elapsed");
                state
                    .services
                    .sessions
                    .worker_keepalive_lost(&session_id)
                    .await;
                break;
            }
        };

        match message {
            Message::Text(text) => {
                // One WS text message carries one or more newline-delimited
                // frames; message boundaries terminate the last line.
                for line in text.as_str().split('\n') {
                    process_line(&state, &session_id, line.trim()).await;
                }
            }
            Message::Pong(_) => conn.mark_pong(),
            Message::Close(_) => {
                state.services.sessions.worker_disconnected(&session_id).await;
                break;
            }
            Message::Ping(_) | Message::Binary(_) => {}
        }
    }

    conn.close(1000, "Relay closed");
    let _ = state.services.registry.remove(&conn);
    let _ = writer.await;
    counter!(WS_DISCONNECTIONS_TOTAL, "kind" => "worker").increment(1);
    info!(session_id = %session_id, "worker disconnected");
}

async fn process_line(state: &AppState, session_id: &SessionId, line: &str) {
    if line.is_empty() {
        return;
    }
    match WorkerFrame::decode_line(line) {
        Ok(frame) => {
            state.services.sessions.worker_frame(session_id, frame).await;
        }
        Err(e) => {
            // Workers may leak stderr noise onto the stream; that is never
            // fatal to the session.
            counter!(RELAY_BAD_FRAMES_TOTAL).increment(1);
            debug!(session_id = %session_id, error = %e, "dropped malformed worker line");
        }
    }
}
