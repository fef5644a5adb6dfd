//! The browser endpoint: `/ws?deviceId=<id>`.
//!
//! The server's first frame is `connected {deviceId}`. Frames are
//! envelope-wrapped JSON; a malformed frame or unknown type fails the
//! connection with `PROTOCOL_ERROR`. A second socket presenting the same
//! device ID displaces the first.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use futures::StreamExt;
use hq_core::ids::DeviceId;
use hq_protocol::browser::{BrowserInEvent, BrowserOutEvent, SessionStatusPayload};
use hq_protocol::envelope::Envelope;
use hq_store::records::format_ts;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::connection::{Connection, ConnectionKind, run_writer};
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::services::AppState;

/// Upgrade handler for browser sockets.
pub async fn browser_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let device_id = params
        .get("deviceId")
        .and_then(|value| DeviceId::parse(value));
    ws.on_upgrade(move |socket| handle_browser_socket(socket, device_id, state))
}

async fn handle_browser_socket(socket: WebSocket, device_id: Option<DeviceId>, state: AppState) {
    let Some(device_id) = device_id else {
        // Contract: report the error on the socket, then close.
        let (sink, _stream) = socket.split();
        let conn = Arc::new(Connection::new("<anonymous>", ConnectionKind::Browser, 4));
        let _ = conn.send_text(Arc::new(
            Envelope::now(BrowserOutEvent::Error {
                code: "MISSING_DEVICE_ID".into(),
                message: "deviceId query parameter is required".into(),
            })
            .encode(),
        ));
        conn.close(1008, "MISSING_DEVICE_ID");
        run_writer(conn, sink).await;
        return;
    };

    info!(device_id = %device_id, "browser connected");
    counter!(WS_CONNECTIONS_TOTAL, "kind" => "browser").increment(1);

    let conn = Arc::new(Connection::new(
        device_id.as_str(),
        ConnectionKind::Browser,
        state.services.settings.server.browser_queue_capacity,
    ));
    let _ = state.services.registry.register(Arc::clone(&conn));

    let _ = conn.send_text(Arc::new(
        Envelope::now(BrowserOutEvent::Connected {
            device_id: device_id.clone(),
        })
        .encode(),
    ));

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(run_writer(Arc::clone(&conn), sink));

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(device_id = %device_id, error = %e, "browser socket error");
                break;
            }
        };
        match message {
            Message::Text(text) => match BrowserInEvent::decode(text.as_str()) {
                Ok(event) => dispatch(&state, &conn, event).await,
                Err(e) => {
                    // Strict side of the codec: a bad frame fails the
                    // connection.
                    debug!(device_id = %device_id, error = %e, "protocol error, closing browser socket");
                    let _ = conn.send_text(Arc::new(
                        Envelope::now(BrowserOutEvent::Error {
                            code: "PROTOCOL_ERROR".into(),
                            message: e.to_string(),
                        })
                        .encode(),
                    ));
                    conn.close(1008, "PROTOCOL_ERROR");
                    break;
                }
            },
            Message::Pong(_) => conn.mark_pong(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Binary(_) => {}
        }
    }

    conn.close(1000, "Connection closed");
    let _ = state.services.registry.remove(&conn);
    let _ = writer.await;
    counter!(WS_DISCONNECTIONS_TOTAL, "kind" => "browser").increment(1);
    info!(device_id = %device_id, "browser disconnected");
}

async fn dispatch(state: &AppState, conn: &Arc<Connection>, event: BrowserInEvent) {
    match event {
        BrowserInEvent::SessionSubscribe { session_id } => {
            conn.subscribe(session_id.clone());
            // Snapshot so a late subscriber does not wait for the next
            // transition to learn the current status.
            if let Ok(Some(record)) = state.services.store.get_session(&session_id) {
                let payload = SessionStatusPayload {
                    startup_phase: (record.startup_phase
                        != hq_core::session::StartupPhase::None)
                        .then_some(record.startup_phase),
                    error: record.error.clone(),
                    last_activity_at: Some(format_ts(record.last_activity_at)),
                    ..SessionStatusPayload::new(session_id, record.status)
                };
                let _ = conn.send_text(Arc::new(
                    Envelope::now(BrowserOutEvent::SessionStatus(payload)).encode(),
                ));
            }
        }
        BrowserInEvent::SessionUnsubscribe { session_id } => {
            conn.unsubscribe(&session_id);
        }
        BrowserInEvent::SessionUserMessage {
            session_id,
            content,
        } => {
            state.services.sessions.user_message(&session_id, content).await;
        }
        BrowserInEvent::SessionPermissionResponse {
            session_id,
            request_id,
            behavior,
        } => {
            state
                .services
                .sessions
                .permission_response(&session_id, request_id, behavior)
                .await;
        }
        BrowserInEvent::Ping => {
            let _ = conn.send_text(Arc::new(
                Envelope::now(BrowserOutEvent::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                })
                .encode(),
            ));
        }
    }
}
