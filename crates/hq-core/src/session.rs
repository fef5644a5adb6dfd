//! Session, worker, question, and share vocabulary.
//!
//! These enums cross every layer: stored as TEXT columns, serialized onto
//! the wire in camel/snake case, and matched in the state machine. String
//! forms are the single source of truth for both serde and the database.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            /// The canonical string form (wire and database).
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

string_enum!(
    /// Session lifecycle status.
    SessionStatus {
        /// Created; worker not yet initialized.
        Starting => "starting",
        /// Worker sent `system/init`; relaying.
        Active => "active",
        /// Terminal: stopped by user, idle timeout, or worker disconnect.
        Stopped => "stopped",
        /// Terminal: spawn failure, startup timeout, or keepalive loss.
        Errored => "errored",
    }
);

impl SessionStatus {
    /// Whether this status ends the session's life.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }
}

string_enum!(
    /// Startup progress reported while `starting` and in the first moments
    /// of `active`.
    StartupPhase {
        /// Compute task submitted, container not yet running.
        Provisioning => "provisioning",
        /// Worker socket connected, no `system/init` yet.
        Initializing => "initializing",
        /// `system/init` received.
        Ready => "ready",
        /// Startup complete or not applicable.
        None => "none",
    }
);

string_enum!(
    /// Kind of a persisted session message.
    MessageKind {
        /// Browser-originated input.
        User => "user",
        /// Model output.
        Assistant => "assistant",
        /// Worker system frame.
        System => "system",
        /// Tool invocation.
        ToolUse => "tool_use",
        /// Tool output.
        ToolResult => "tool_result",
        /// Final result frame.
        Result => "result",
    }
);

string_enum!(
    /// Worker catalogue status, driven by registration and the question
    /// blocker.
    WorkerStatus {
        /// Registered, no active work.
        Idle => "idle",
        /// Processing.
        Running => "running",
        /// Suspended on a pending question.
        WaitingInput => "waiting_input",
        /// Answer delivered, resuming execution.
        Resuming => "resuming",
        /// No longer running.
        Stopped => "stopped",
    }
);

string_enum!(
    /// Pending-question lifecycle.
    QuestionStatus {
        /// Awaiting an answer.
        Pending => "pending",
        /// Answered; immutable from here.
        Answered => "answered",
    }
);

string_enum!(
    /// Share lifecycle.
    ShareStatus {
        /// Grants access.
        Active => "active",
        /// Explicitly revoked by the owner.
        Revoked => "revoked",
        /// Past `expiresAt`.
        Expired => "expired",
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_strings() {
        for status in [
            SessionStatus::Starting,
            SessionStatus::Active,
            SessionStatus::Stopped,
            SessionStatus::Errored,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        for phase in [
            StartupPhase::Provisioning,
            StartupPhase::Initializing,
            StartupPhase::Ready,
            StartupPhase::None,
        ] {
            assert_eq!(phase.as_str().parse::<StartupPhase>().unwrap(), phase);
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        assert_eq!(
            serde_json::to_string(&MessageKind::ToolUse).unwrap(),
            "\"tool_use\""
        );
        assert_eq!(
            serde_json::to_string(&WorkerStatus::WaitingInput).unwrap(),
            "\"waiting_input\""
        );
        let parsed: QuestionStatus = serde_json::from_str("\"answered\"").unwrap();
        assert_eq!(parsed, QuestionStatus::Answered);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!SessionStatus::Starting.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Errored.is_terminal());
    }

    #[test]
    fn unknown_string_is_rejected() {
        assert!("paused".parse::<SessionStatus>().is_err());
        assert!("maybe".parse::<QuestionStatus>().is_err());
    }
}
