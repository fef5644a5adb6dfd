//! The `{type, payload, timestamp}` envelope.
//!
//! Every frame the server sends a browser is wrapped here, including frames
//! re-wrapped from bare worker output. Parse-then-serialize of an envelope
//! is a fixed point (§ tested below).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::browser::BrowserOutEvent;

/// An outbound browser frame with its emission timestamp.
///
/// Serializes flat: the event's `type`/`payload` fields sit alongside
/// `timestamp` in one JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The event, contributing `type` and `payload`.
    #[serde(flatten)]
    pub event: BrowserOutEvent,
    /// ISO-8601 emission instant.
    #[serde(with = "iso8601_millis")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap an event with the current instant.
    pub fn now(event: BrowserOutEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to a single JSON text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            // An envelope is always a JSON-representable struct; a failure
            // here is a programming error worth a loud log, not a panic in
            // the fan-out path.
            tracing::error!(error = %e, "failed to encode envelope");
            String::from("{\"type\":\"error\",\"payload\":{\"code\":\"INTERNAL\",\"message\":\"encode failure\"}}")
        })
    }
}

mod iso8601_millis {
    use super::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(de)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hq_core::ids::{DeviceId, SessionId};
    use serde_json::json;

    #[test]
    fn envelope_has_type_payload_timestamp() {
        let envelope = Envelope::now(BrowserOutEvent::Connected {
            device_id: DeviceId::parse("dev-1").unwrap(),
        });
        let value: serde_json::Value = serde_json::from_str(&envelope.encode()).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["payload"]["deviceId"], "dev-1");
        let ts = value["timestamp"].as_str().unwrap();
        assert!(ts.ends_with('Z'), "timestamp must be ISO-8601 UTC: {ts}");
    }

    #[test]
    fn parse_then_serialize_is_fixed_point() {
        let original = Envelope::now(BrowserOutEvent::SessionResult {
            session_id: SessionId::from_string("sess_rt"),
            result: json!({"outcome": "success", "turns": 4}),
        });
        let encoded = original.encode();
        let parsed: Envelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(parsed.event, original.event);
        // The wire form is a fixed point of parse-then-serialize.
        assert_eq!(parsed.encode(), encoded);
        let reparsed: Envelope = serde_json::from_str(&parsed.encode()).unwrap();
        assert_eq!(reparsed, parsed);
    }

    #[test]
    fn pong_round_trip() {
        let envelope = Envelope::now(BrowserOutEvent::Pong {
            timestamp: 1_754_000_000_123,
        });
        let value: serde_json::Value = serde_json::from_str(&envelope.encode()).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["payload"]["timestamp"], 1_754_000_000_123i64);
    }
}
