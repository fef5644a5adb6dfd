//! One registered connection: bounded outbound queue and liveness state.
//!
//! Slow consumers never backpressure producers: the outbound queue is
//! bounded and overflow drops the OLDEST queued event, bumping the
//! connection's drop counter. Control frames (ping, close) are never
//! dropped.

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::SinkExt;
use futures::stream::SplitSink;
use hq_core::ids::SessionId;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::metrics::WS_QUEUE_DROPS_TOTAL;

/// Which side of the relay a connection serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionKind {
    /// A browser device socket (`/ws?deviceId=…`).
    Browser,
    /// A worker relay socket (`/ws/relay/{sessionId}`).
    Worker,
}

/// One queued outbound item.
#[derive(Clone, Debug)]
pub enum Outbound {
    /// A text frame (already serialized).
    Text(Arc<String>),
    /// A liveness ping.
    Ping,
    /// Close the socket with a code and reason, then stop the writer.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable reason.
        reason: String,
    },
}

/// A live connection's server-side state.
#[derive(Debug)]
pub struct Connection {
    key: String,
    kind: ConnectionKind,
    capacity: usize,
    queue: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    dropped: AtomicU64,
    pong_seen: AtomicBool,
    missed_pongs: AtomicU32,
    close_requested: AtomicBool,
    subscriptions: RwLock<HashSet<SessionId>>,
}

impl Connection {
    /// New connection with a bounded outbound queue.
    pub fn new(key: impl Into<String>, kind: ConnectionKind, capacity: usize) -> Self {
        Self {
            key: key.into(),
            kind,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            // Registration counts as liveness until the first ping.
            pong_seen: AtomicBool::new(true),
            missed_pongs: AtomicU32::new(0),
            close_requested: AtomicBool::new(false),
            subscriptions: RwLock::new(HashSet::new()),
        }
    }

    /// The registry key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Which side this connection serves.
    pub fn kind(&self) -> ConnectionKind {
        self.kind
    }

    /// Enqueue a text frame.
    ///
    /// Returns `false` when the frame displaced an older queued event (or
    /// the connection is closing and the frame was discarded).
    pub fn send_text(&self, text: Arc<String>) -> bool {
        if self.close_requested.load(Ordering::SeqCst) {
            return false;
        }
        let mut queue = self.queue.lock();
        queue.push_back(Outbound::Text(text));
        let mut clean = true;
        while queue.len() > self.capacity {
            // Drop the oldest TEXT entry; control frames stay.
            if let Some(pos) = queue.iter().position(|o| matches!(o, Outbound::Text(_))) {
                let _ = queue.remove(pos);
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(WS_QUEUE_DROPS_TOTAL).increment(1);
                clean = false;
            } else {
                break;
            }
        }
        drop(queue);
        self.notify.notify_one();
        clean
    }

    /// Enqueue a liveness ping (never dropped).
    pub fn send_ping(&self) {
        if self.close_requested.load(Ordering::SeqCst) {
            return;
        }
        self.queue.lock().push_back(Outbound::Ping);
        self.notify.notify_one();
    }

    /// Request a close with a code and reason. Idempotent: only the first
    /// call enqueues the close frame.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        if self.close_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.lock().push_back(Outbound::Close {
            code,
            reason: reason.into(),
        });
        self.notify.notify_one();
    }

    /// Whether a close has been requested.
    pub fn is_closing(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }

    /// Await the next outbound item.
    pub async fn next_outbound(&self) -> Outbound {
        loop {
            if let Some(item) = self.queue.lock().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Record a received pong.
    pub fn mark_pong(&self) {
        self.pong_seen.store(true, Ordering::SeqCst);
        self.missed_pongs.store(0, Ordering::SeqCst);
    }

    /// Heartbeat accounting: returns how many consecutive pings have now
    /// gone unanswered.
    pub fn heartbeat_tick(&self) -> u32 {
        if self.pong_seen.swap(false, Ordering::SeqCst) {
            self.missed_pongs.store(0, Ordering::SeqCst);
            0
        } else {
            self.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    /// Events dropped from this connection's queue so far.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items currently queued.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Add a session to the subscription set (browser connections).
    pub fn subscribe(&self, session_id: SessionId) {
        let _ = self.subscriptions.write().insert(session_id);
    }

    /// Remove a session from the subscription set.
    pub fn unsubscribe(&self, session_id: &SessionId) {
        let _ = self.subscriptions.write().remove(session_id);
    }

    /// Whether this connection watches the session.
    pub fn is_subscribed(&self, session_id: &SessionId) -> bool {
        self.subscriptions.read().contains(session_id)
    }
}

/// Drain a connection's outbound queue into the socket sink.
///
/// Runs until a close is processed or the sink fails; per-connection
/// ordering is the queue order.
pub async fn run_writer(conn: Arc<Connection>, mut sink: SplitSink<WebSocket, Message>) {
    loop {
        match conn.next_outbound().await {
            Outbound::Text(text) => {
                if sink
                    .send(Message::Text(text.as_str().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Outbound::Ping => {
                if sink
                    .send(Message::Ping(Bytes::from_static(b"hq")))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}
