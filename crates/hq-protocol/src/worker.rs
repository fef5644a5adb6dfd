//! Worker-channel frames: newline-delimited, bare `type`-tagged JSON.
//!
//! Workers write one JSON object per line. Extra fields beyond the ones the
//! relay dispatches on are preserved in `data` so frames can be forwarded
//! verbatim (`session_stream`) or persisted (`raw`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;
use crate::browser::PermissionBehavior;

/// One selectable answer for a worker question.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    /// Option identifier; answers must match one of these when present.
    pub id: String,
    /// Display text.
    pub text: String,
}

/// Frames a worker emits, one per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// Worker lifecycle frame; `subtype: "init"` completes startup.
    System {
        /// Lifecycle sub-kind.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        /// Remaining frame fields (capabilities, versions, …).
        #[serde(flatten)]
        data: Map<String, Value>,
    },

    /// Echo of user input.
    User {
        /// Message text.
        content: String,
    },

    /// Model output.
    Assistant {
        /// Remaining frame fields (`content`, streaming metadata, …).
        #[serde(flatten)]
        data: Map<String, Value>,
    },

    /// Tool invocation.
    ToolUse {
        /// Remaining frame fields (`name`, `input`, `toolUseId`, …).
        #[serde(flatten)]
        data: Map<String, Value>,
    },

    /// Tool output.
    ToolResult {
        /// Remaining frame fields.
        #[serde(flatten)]
        data: Map<String, Value>,
    },

    /// Terminal result of the run.
    Result {
        /// Remaining frame fields.
        #[serde(flatten)]
        data: Map<String, Value>,
    },

    /// Request for human input; suspends the worker until answered.
    Question {
        /// Worker-chosen correlation ID, if any.
        #[serde(
            rename = "questionId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        question_id: Option<String>,
        /// The question text.
        text: String,
        /// Declared answer options; empty means free-form.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<QuestionOption>,
    },
}

impl WorkerFrame {
    /// Decode one newline-delimited worker line.
    ///
    /// Callers treat failures as droppable noise — workers may emit stderr
    /// garbage between frames — so this reports but never terminates.
    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line).map_err(ProtocolError::InvalidJson)?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("<missing>")
            .to_string();
        let mut frame: Self = serde_json::from_value(value)
            .map_err(|_| ProtocolError::UnknownType(frame_type))?;
        // Internally-tagged deserialization leaks the tag into flattened
        // maps; strip it so re-serialization emits `type` exactly once.
        match &mut frame {
            Self::System { data, .. }
            | Self::Assistant { data }
            | Self::ToolUse { data }
            | Self::ToolResult { data }
            | Self::Result { data } => {
                let _ = data.remove("type");
            }
            Self::User { .. } | Self::Question { .. } => {}
        }
        Ok(frame)
    }

    /// The best-effort text content of this frame, for persistence.
    pub fn content_text(&self) -> String {
        match self {
            Self::User { content } => content.clone(),
            Self::System { data, .. }
            | Self::Assistant { data }
            | Self::ToolUse { data }
            | Self::ToolResult { data }
            | Self::Result { data } => data
                .get("content")
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default(),
            Self::Question { text, .. } => text.clone(),
        }
    }
}

/// Frames the server sends a worker, one per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// User input (the initial prompt, forwarded messages, question answers).
    User {
        /// Message text.
        content: String,
    },

    /// Permission decision for a pending tool request.
    Permission {
        /// Request being decided.
        #[serde(rename = "requestId")]
        request_id: String,
        /// The decision.
        behavior: PermissionBehavior,
    },
}

impl WorkerCommand {
    /// Serialize as a newline-terminated wire line.
    pub fn encode_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to encode worker command");
            String::from("{\"type\":\"user\",\"content\":\"\"}")
        });
        line.push('\n');
        line
    }
}
