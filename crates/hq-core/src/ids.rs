//! Branded ID newtypes.
//!
//! Every entity ID is a prefixed UUID v7 string (`sess_…`, `wrk_…`, `q_…`).
//! The prefix makes IDs self-describing in logs and wire payloads; the v7
//! timestamp prefix keeps database indexes append-friendly.
//!
//! [`DeviceId`] is the exception: it is chosen by the browser client and is
//! stored verbatim after validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh ID with the type prefix.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7()))
            }

            /// Wrap an existing ID string without validation.
            ///
            /// Used when reading back rows whose IDs were generated by
            /// [`generate`](Self::generate) or supplied by an external system.
            pub fn from_string(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// The underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// Session identifier (`sess_…`).
    SessionId,
    "sess"
);
branded_id!(
    /// Worker identifier (`wrk_…`). Externally registered workers may carry
    /// arbitrary IDs via [`WorkerId::from_string`].
    WorkerId,
    "wrk"
);
branded_id!(
    /// Pending-question identifier (`q_…`).
    QuestionId,
    "q"
);
branded_id!(
    /// Share identifier (`shr_…`).
    ShareId,
    "shr"
);

/// Browser device identifier, chosen by the client.
///
/// Doubles as the connection-registry key for browser sockets. Worker
/// sockets use `relay:<sessionId>` keys instead (see the server crate).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Maximum accepted length for a client-supplied device ID.
    pub const MAX_LEN: usize = 128;

    /// Validate and wrap a client-supplied device ID.
    ///
    /// Accepts non-empty strings of ASCII alphanumerics, `-` and `_`, up to
    /// [`MAX_LEN`](Self::MAX_LEN) bytes.
    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() || value.len() > Self::MAX_LEN {
            return None;
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return None;
        }
        Some(Self(value.to_string()))
    }

    /// The underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_prefix() {
        assert!(SessionId::generate().as_str().starts_with("sess_"));
        assert!(WorkerId::generate().as_str().starts_with("wrk_"));
        assert!(QuestionId::generate().as_str().starts_with("q_"));
        assert!(ShareId::generate().as_str().starts_with("shr_"));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn serde_is_transparent() {
        let id = SessionId::from_string("sess_fixed");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sess_fixed\"");
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn device_id_accepts_simple_names() {
        assert!(DeviceId::parse("same-device").is_some());
        assert!(DeviceId::parse("dev_01HX").is_some());
    }

    #[test]
    fn device_id_rejects_bad_input() {
        assert!(DeviceId::parse("").is_none());
        assert!(DeviceId::parse("has space").is_none());
        assert!(DeviceId::parse("path/../traversal").is_none());
        assert!(DeviceId::parse(&"x".repeat(DeviceId::MAX_LEN + 1)).is_none());
    }
}
