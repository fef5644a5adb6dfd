//! The process-wide connection registry.
//!
//! One map, one lock, brief critical sections, no I/O under the lock:
//! sending only enqueues onto a connection's own bounded queue, so
//! broadcast ordering is preserved per connection without any global
//! ordering across connections.

use hq_core::ids::SessionId;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::{Connection, ConnectionKind};
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_HEARTBEAT_REAPS_TOTAL};

/// Close reason used when a duplicate key displaces a connection.
pub const REPLACED_REASON: &str = "New connection established";

/// Process-wide mapping from connection key to live socket.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its key.
    ///
    /// Atomically replaces any prior connection under the same key; the
    /// displaced connection is closed with code `1000` and
    /// [`REPLACED_REASON`], and returned for inspection.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let displaced = {
            let mut connections = self.connections.write();
            let displaced = connections.insert(conn.key().to_string(), Arc::clone(&conn));
            gauge!(WS_CONNECTIONS_ACTIVE).set(connections.len() as f64);
            displaced
        };
        if let Some(ref old) = displaced {
            debug!(key = conn.key(), "displacing duplicate connection");
            old.close(1000, REPLACED_REASON);
        }
        displaced
    }

    /// Remove a connection, but only if `conn` is still the registered one.
    ///
    /// A stale close racing a fresh register must not evict the newer
    /// socket.
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut connections = self.connections.write();
        let is_current = connections
            .get(conn.key())
            .is_some_and(|current| Arc::ptr_eq(current, conn));
        if is_current {
            let _ = connections.remove(conn.key());
            gauge!(WS_CONNECTIONS_ACTIVE).set(connections.len() as f64);
        }
        is_current
    }

    /// Look up a connection by key.
    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.connections.read().get(key).cloned()
    }

    /// Snapshot of all connections.
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Live connection count.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Enqueue a frame onto every browser connection subscribed to the
    /// session. The shared `Arc` keeps the payload serialized once.
    pub fn broadcast_to_session(&self, session_id: &SessionId, text: &Arc<String>) {
        let connections = self.connections.read();
        let mut recipients = 0u32;
        for conn in connections.values() {
            if conn.kind() == ConnectionKind::Browser && conn.is_subscribed(session_id) {
                recipients += 1;
                if !conn.send_text(Arc::clone(text)) {
                    warn!(
                        key = conn.key(),
                        session_id = %session_id,
                        total_drops = conn.dropped_count(),
                        "browser queue overflow, oldest event dropped"
                    );
                }
            }
        }
        debug!(session_id = %session_id, recipients, "session broadcast");
    }

    /// Enqueue a frame onto every browser connection (catalogue
    /// notifications).
    pub fn broadcast_all(&self, text: &Arc<String>) {
        let connections = self.connections.read();
        for conn in connections.values() {
            if conn.kind() == ConnectionKind::Browser {
                let _ = conn.send_text(Arc::clone(text));
            }
        }
    }

    /// Enqueue a frame for one key. Returns whether the key was present.
    pub fn send_to_key(&self, key: &str, text: Arc<String>) -> bool {
        match self.get(key) {
            Some(conn) => {
                let _ = conn.send_text(text);
                true
            }
            None => false,
        }
    }
}

/// Spawn the heartbeat loop: ping every `interval`, reap connections whose
/// last two pings went unanswered.
pub fn spawn_heartbeat(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for conn in registry.all() {
                        let missed = conn.heartbeat_tick();
                        if missed >= 2 {
                            warn!(key = conn.key(), missed, "heartbeat timeout, reaping connection");
                            counter!(WS_HEARTBEAT_REAPS_TOTAL).increment(1);
                            conn.close(1001, "Heartbeat timeout");
                            let _ = registry.remove(&conn);
                        } else {
                            conn.send_ping();
                        }
                    }
                }
            }
        }
    })
}
