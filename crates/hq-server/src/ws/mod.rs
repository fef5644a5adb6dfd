//! WebSocket connection management, heartbeat, and the two socket
//! endpoints (browser fan-out and worker relay).

pub mod browser;
pub mod connection;
pub mod registry;
pub mod relay;

pub use connection::{Connection, ConnectionKind, Outbound};
pub use registry::ConnectionRegistry;

use hq_core::ids::SessionId;

/// Registry key for a session's worker socket.
pub fn relay_key(session_id: &SessionId) -> String {
    format!("relay:{session_id}")
}
