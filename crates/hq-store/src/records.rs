//! Persisted record types.
//!
//! Timestamps are stored as RFC 3339 TEXT with millisecond precision so
//! lexicographic comparison in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};
use hq_core::ids::{QuestionId, SessionId, ShareId, WorkerId};
use hq_core::session::{
    MessageKind, QuestionStatus, SessionStatus, ShareStatus, StartupPhase, WorkerStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Render a timestamp in the canonical database/wire form.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a canonical timestamp; invalid text falls back to the epoch with a
/// warning (a corrupt row should not poison whole-table reads).
pub fn parse_ts(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, text, "corrupt timestamp column");
            DateTime::<Utc>::UNIX_EPOCH
        })
}

/// A session record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Session identifier.
    pub session_id: SessionId,
    /// Owning user.
    pub user_id: String,
    /// Worker bound to this session, once spawned.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Startup sub-state.
    pub startup_phase: StartupPhase,
    /// Prompt delivered to the worker as its first frame.
    pub initial_prompt: String,
    /// Free-form context forwarded to the worker environment.
    pub worker_context: Value,
    /// Capabilities reported by the worker's `system/init` frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
    /// Failure reason when `errored`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Count of persisted messages; equals the highest sequence number.
    pub message_count: i64,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last worker activity; monotonically non-decreasing.
    pub last_activity_at: DateTime<Utc>,
    /// Terminal instant, set exactly once.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
}

/// One persisted session message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    /// Owning session.
    pub session_id: SessionId,
    /// Dense per-session sequence, starting at 1.
    pub sequence: i64,
    /// Persistence instant.
    pub timestamp: DateTime<Utc>,
    /// Message kind.
    pub kind: MessageKind,
    /// Message body (may be large).
    pub content: String,
    /// Structured extras (the worker's raw frame, tool ids, …).
    pub metadata: Value,
}

/// A worker catalogue entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRecord {
    /// Worker identifier.
    pub worker_id: WorkerId,
    /// Display name.
    pub name: String,
    /// Current status.
    pub status: WorkerStatus,
    /// Registration instant.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// One selectable answer on a question.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    /// Option identifier.
    pub id: String,
    /// Display text.
    pub text: String,
}

/// A worker question awaiting (or holding) a human answer.
///
/// Once `status` is `answered` the record is immutable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQuestion {
    /// Question identifier.
    pub question_id: QuestionId,
    /// Worker that asked.
    pub worker_id: WorkerId,
    /// Question text.
    pub text: String,
    /// Declared options; empty means free-form.
    pub options: Vec<QuestionOption>,
    /// Lifecycle status.
    pub status: QuestionStatus,
    /// When the worker asked.
    pub asked_at: DateTime<Utc>,
    /// When the answer arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
    /// The accepted answer.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

/// A stored API key (secret material is hash-only).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    /// Public 8-character lookup prefix.
    pub prefix: String,
    /// SHA-256 of the full key, hex-encoded. Never serialized.
    #[serde(skip_serializing)]
    pub hash: String,
    /// Human-assigned name.
    pub name: String,
    /// Token-bucket refill per minute (burst equals this).
    pub rate_limit: u32,
    /// Issuance instant.
    pub created_at: DateTime<Utc>,
}

/// A read-grant over object-store path prefixes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRecord {
    /// Share identifier.
    pub share_id: ShareId,
    /// Granting user.
    pub owner_id: String,
    /// Receiving user.
    pub recipient_id: String,
    /// Non-empty set of path prefixes.
    pub paths: Vec<String>,
    /// Granted permissions (subset of {`read`}).
    pub permissions: Vec<String>,
    /// Lifecycle status.
    pub status: ShareStatus,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Optional expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ShareRecord {
    /// Status with lazy expiry applied: an `active` share past `expiresAt`
    /// reads as `expired`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ShareStatus {
        match (self.status, self.expires_at) {
            (ShareStatus::Active, Some(expiry)) if expiry <= now => ShareStatus::Expired,
            (status, _) => status,
        }
    }
}
