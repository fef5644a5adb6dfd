//! Browser-channel frames, both directions.
//!
//! Inbound frames arrive as `{type, payload}`; outbound frames are wrapped
//! into the full `{type, payload, timestamp}` envelope by
//! [`Envelope`](crate::envelope::Envelope) before hitting the socket.

use hq_core::ids::{DeviceId, SessionId};
use hq_core::session::{SessionStatus, StartupPhase};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Permission decision relayed from browser to worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionBehavior {
    /// Permit the tool invocation.
    Allow,
    /// Refuse the tool invocation.
    Deny,
}

/// Frames the browser sends the server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BrowserInEvent {
    /// Add a session to this connection's subscription set.
    SessionSubscribe {
        /// Session to watch.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },

    /// Remove a session from the subscription set.
    SessionUnsubscribe {
        /// Session to stop watching.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },

    /// User input for a session; forwarded to the worker as a `user` frame,
    /// or consumed as a question answer while one is pending.
    SessionUserMessage {
        /// Target session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Message text.
        content: String,
    },

    /// Response to a worker permission request.
    SessionPermissionResponse {
        /// Target session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Request being answered.
        #[serde(rename = "requestId")]
        request_id: String,
        /// The decision.
        behavior: PermissionBehavior,
    },

    /// Liveness probe; server answers with `pong`.
    Ping,
}

impl BrowserInEvent {
    /// Strictly decode a browser text frame.
    ///
    /// Invalid JSON and unknown `type` values are [`ProtocolError`]s that
    /// fail the enclosing connection.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<missing>")
            .to_string();
        serde_json::from_value(value).map_err(|_| ProtocolError::UnknownType(frame_type))
    }
}

/// `session_status` payload: the session's externally visible state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusPayload {
    /// Session this status describes.
    pub session_id: SessionId,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Outstanding permission requests, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_permissions: Option<Vec<Value>>,
    /// Startup sub-state while `starting`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_phase: Option<StartupPhase>,
    /// ISO-8601 instant the current startup phase began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_timestamp: Option<String>,
    /// Failure reason when `errored`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// ISO-8601 instant of the last worker activity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<String>,
}

impl SessionStatusPayload {
    /// Minimal payload with all optional fields absent.
    pub fn new(session_id: SessionId, status: SessionStatus) -> Self {
        Self {
            session_id,
            status,
            pending_permissions: None,
            startup_phase: None,
            startup_timestamp: None,
            error: None,
            last_activity_at: None,
        }
    }
}

/// Frames the server sends the browser (pre-envelope).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum BrowserOutEvent {
    /// First frame after the socket opens.
    Connected {
        /// The device key this connection registered under.
        #[serde(rename = "deviceId")]
        device_id: DeviceId,
    },

    /// Connection-level error report.
    Error {
        /// Stable error code (e.g. `MISSING_DEVICE_ID`, `PROTOCOL_ERROR`).
        code: String,
        /// Human-readable description.
        message: String,
    },

    /// Reply to `ping`.
    Pong {
        /// Milliseconds since the Unix epoch at send time.
        timestamp: i64,
    },

    /// Session lifecycle update.
    SessionStatus(SessionStatusPayload),

    /// A persisted session message, fanned out to subscribers.
    SessionMessage {
        /// Source session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Message kind string (`user`, `assistant`, `tool_use`, …).
        #[serde(rename = "messageType")]
        message_type: String,
        /// Message body.
        content: String,
        /// The worker's original frame, when it carried more than `content`.
        #[serde(skip_serializing_if = "Option::is_none")]
        raw: Option<Value>,
    },

    /// Worker streaming event, passed through verbatim.
    SessionStream {
        /// Source session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// The worker's streaming payload.
        event: Value,
    },

    /// Worker asks permission to run a tool.
    SessionPermissionRequest {
        /// Source session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Correlation ID for the response.
        #[serde(rename = "requestId")]
        request_id: String,
        /// Tool being requested.
        #[serde(rename = "toolName")]
        tool_name: String,
        /// Tool input.
        input: Value,
    },

    /// A permission request was decided.
    SessionPermissionResolved {
        /// Source session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Request that was decided.
        #[serde(rename = "requestId")]
        request_id: String,
        /// The decision.
        behavior: PermissionBehavior,
    },

    /// Incremental tool progress.
    SessionToolProgress {
        /// Source session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Tool invocation this progress belongs to.
        #[serde(rename = "toolUseId", skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        /// Progress payload.
        progress: Value,
    },

    /// Terminal result of a worker run.
    SessionResult {
        /// Source session.
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Result payload.
        result: Value,
    },

    /// Fleet catalogue: worker definition created.
    #[serde(rename = "agent:created")]
    AgentCreated(Value),

    /// Fleet catalogue: worker definition updated.
    #[serde(rename = "agent:updated")]
    AgentUpdated(Value),

    /// Fleet catalogue: worker definition deleted.
    #[serde(rename = "agent:deleted")]
    AgentDeleted(Value),
}
