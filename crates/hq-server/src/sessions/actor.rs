//! The per-session actor: serialized mutations, timers, and fan-out.
//!
//! One task per live session owns every status mutation and every browser
//! broadcast for that session. Startup, idle, and grace deadlines are
//! expressed as `sleep_until` arms of the actor's select loop, so timer
//! firings serialize with command handling.

use hq_core::session::{MessageKind, SessionStatus, StartupPhase, WorkerStatus};
use hq_protocol::browser::{BrowserOutEvent, SessionStatusPayload};
use hq_protocol::envelope::Envelope;
use hq_protocol::worker::{WorkerCommand, WorkerFrame};
use hq_store::records::format_ts;
use metrics::counter;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use hq_core::ids::{SessionId, WorkerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SessionCommand;
use crate::metrics::{RELAY_FRAMES_TOTAL, SESSIONS_TERMINAL_TOTAL};
use crate::ws::relay_key;

/// Everything an actor needs, with no reference back to the service.
pub struct ActorContext {
    /// The session this actor owns.
    pub session_id: SessionId,
    /// Persistence.
    pub store: Arc<hq_store::Store>,
    /// Connection registry for worker sends and browser fan-out.
    pub registry: Arc<crate::ws::registry::ConnectionRegistry>,
    /// Question blocker.
    pub blocker: Arc<crate::blocker::QuestionBlocker>,
    /// Access tokens (revoked at terminal transitions).
    pub tokens: Arc<crate::auth::AccessTokenService>,
    /// Compute fleet (task cancellation).
    pub fleet: Arc<dyn hq_fleet::ComputeBackend>,
    /// Timer configuration.
    pub settings: Arc<hq_settings::HqSettings>,
    /// Actor directory; the actor removes itself on exit.
    pub actors:
        Arc<parking_lot::Mutex<std::collections::HashMap<String, mpsc::Sender<SessionCommand>>>>,
    /// Process shutdown.
    pub shutdown: CancellationToken,
}

/// Start the actor task.
pub fn spawn(ctx: ActorContext, inbox: mpsc::Receiver<SessionCommand>) {
    drop(tokio::spawn(run(ctx, inbox)));
}

struct Actor {
    ctx: ActorContext,
    status: SessionStatus,
    worker_id: Option<WorkerId>,
    tracking_id: Option<String>,
    last_activity: Instant,
    startup_deadline: Instant,
    terminal_at: Option<Instant>,
    /// Cancels question waits when the session terminates.
    answer_cancel: CancellationToken,
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(365 * 24 * 3600)
}

async fn run(ctx: ActorContext, mut inbox: mpsc::Receiver<SessionCommand>) {
    let record = match ctx.store.get_session(&ctx.session_id) {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!(session_id = %ctx.session_id, "actor started for unknown session");
            let _ = ctx.actors.lock().remove(ctx.session_id.as_str());
            return;
        }
        Err(e) => {
            warn!(session_id = %ctx.session_id, error = %e, "actor failed to load session");
            let _ = ctx.actors.lock().remove(ctx.session_id.as_str());
            return;
        }
    };

    let startup = Duration::from_millis(ctx.settings.timeouts.startup_ms);
    let shutdown = ctx.shutdown.clone();
    let now = Instant::now();
    let mut actor = Actor {
        status: record.status,
        worker_id: record.worker_id.clone(),
        tracking_id: None,
        last_activity: now,
        startup_deadline: now + startup,
        terminal_at: record.status.is_terminal().then_some(now),
        answer_cancel: CancellationToken::new(),
        ctx,
    };

    loop {
        // Deadlines snapshot per iteration so the select arms hold no
        // borrows on the actor while a handler mutates it.
        let startup_at = actor.startup_arm();
        let idle_at = actor.idle_arm();
        let gc_at = actor.gc_arm();
        tokio::select! {
            maybe_command = inbox.recv() => {
                match maybe_command {
                    Some(command) => actor.handle(command).await,
                    None => break,
                }
            }
            () = sleep_until(startup_at) => actor.on_startup_timeout().await,
            () = sleep_until(idle_at) => actor.on_idle_timeout().await,
            () = sleep_until(gc_at) => {
                if actor.try_collect() {
                    break;
                }
            }
            () = shutdown.cancelled() => break,
        }
    }

    actor.answer_cancel.cancel();
    let _ = actor.ctx.actors.lock().remove(actor.ctx.session_id.as_str());
    debug!(session_id = %actor.ctx.session_id, "actor exited");
}

impl Actor {
    fn startup_arm(&self) -> Instant {
        if self.status == SessionStatus::Starting {
            self.startup_deadline
        } else {
            far_future()
        }
    }

    fn idle_arm(&self) -> Instant {
        if self.status == SessionStatus::Active {
            self.last_activity + Duration::from_millis(self.ctx.settings.timeouts.idle_ms)
        } else {
            far_future()
        }
    }

    fn gc_arm(&self) -> Instant {
        match self.terminal_at {
            Some(at) => at + Duration::from_millis(self.ctx.settings.timeouts.grace_ttl_ms),
            None => far_future(),
        }
    }

    async fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::WorkerConnected => self.on_worker_connected(),
            SessionCommand::WorkerFrame(frame) => self.on_worker_frame(frame).await,
            SessionCommand::WorkerDisconnected => {
                if !self.status.is_terminal() {
                    self.transition(SessionStatus::Stopped, Some("Worker disconnected"));
                }
            }
            SessionCommand::WorkerKeepaliveLost => {
                if !self.status.is_terminal() {
                    self.close_worker(1001, "Keepalive timeout");
                    self.transition(SessionStatus::Errored, Some("Worker keepalive timeout"));
                }
            }
            SessionCommand::UserMessage { content } => self.on_user_message(content),
            SessionCommand::PermissionResponse {
                request_id,
                behavior,
            } => {
                self.send_worker(WorkerCommand::Permission {
                    request_id: request_id.clone(),
                    behavior,
                });
                self.broadcast(BrowserOutEvent::SessionPermissionResolved {
                    session_id: self.ctx.session_id.clone(),
                    request_id,
                    behavior,
                });
            }
            SessionCommand::Stop { reason } => {
                if !self.status.is_terminal() {
                    self.close_worker(1000, &reason);
                    self.stop_fleet_task().await;
                    self.transition(SessionStatus::Stopped, None);
                }
            }
            SessionCommand::SpawnFailed { error } => {
                if self.status == SessionStatus::Starting {
                    self.transition(SessionStatus::Errored, Some(&error));
                }
            }
            SessionCommand::SpawnTracked { tracking_id } => {
                debug!(session_id = %self.ctx.session_id, %tracking_id, "fleet task tracked");
                self.tracking_id = Some(tracking_id);
            }
        }
    }

    fn on_worker_connected(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        let _ = self
            .ctx
            .store
            .update_startup_phase(&self.ctx.session_id, StartupPhase::Initializing)
            .map_err(|e| warn!(error = %e, "failed to record startup phase"));
        self.broadcast_status_with_phase(StartupPhase::Initializing, None);
        if let Some(worker_id) = self.worker_id.clone() {
            let _ = self
                .ctx
                .store
                .update_worker_status(&worker_id, WorkerStatus::Running)
                .map_err(|e| debug!(error = %e, "worker status update failed"));
        }
    }

    async fn on_worker_frame(&mut self, frame: WorkerFrame) {
        if self.status.is_terminal() {
            debug!(session_id = %self.ctx.session_id, "frame after terminal status dropped");
            return;
        }
        counter!(RELAY_FRAMES_TOTAL, "direction" => "worker_to_browser").increment(1);
        self.touch_activity();

        match frame {
            WorkerFrame::System { subtype, data } => {
                if subtype.as_deref() == Some("init") {
                    self.on_worker_init(&data);
                } else {
                    // Non-init system frames carry the worker's streaming
                    // API; pass them through verbatim.
                    let mut event = Map::new();
                    let _ = event.insert("type".into(), Value::String("system".into()));
                    if let Some(subtype) = subtype {
                        let _ = event.insert("subtype".into(), Value::String(subtype));
                    }
                    event.extend(data);
                    self.broadcast(BrowserOutEvent::SessionStream {
                        session_id: self.ctx.session_id.clone(),
                        event: Value::Object(event),
                    });
                }
            }
            WorkerFrame::Assistant { data } => {
                self.persist_and_fanout(MessageKind::Assistant, data);
            }
            WorkerFrame::ToolUse { data } => {
                self.persist_and_fanout(MessageKind::ToolUse, data);
            }
            WorkerFrame::ToolResult { data } => {
                self.persist_and_fanout(MessageKind::ToolResult, data);
            }
            WorkerFrame::Question {
                text, options, ..
            } => self.on_worker_question(text, options),
            WorkerFrame::Result { data } => {
                let content = data
                    .get("content")
                    .map(value_to_text)
                    .unwrap_or_default();
                self.persist_message(MessageKind::Result, &content, &data);
                self.broadcast(BrowserOutEvent::SessionResult {
                    session_id: self.ctx.session_id.clone(),
                    result: Value::Object(data),
                });
                // Terminating status refresh clears any in-progress
                // streaming indicators on the browser side.
                self.broadcast_status(None);
            }
            WorkerFrame::User { .. } => {
                debug!(session_id = %self.ctx.session_id, "worker user echo dropped");
            }
        }
    }

    fn on_worker_init(&mut self, data: &Map<String, Value>) {
        if let Some(capabilities) = data.get("capabilities") {
            let _ = self
                .ctx
                .store
                .set_session_capabilities(&self.ctx.session_id, capabilities)
                .map_err(|e| warn!(error = %e, "failed to persist capabilities"));
        }
        let _ = self
            .ctx
            .store
            .update_startup_phase(&self.ctx.session_id, StartupPhase::Ready)
            .map_err(|e| warn!(error = %e, "failed to record startup phase"));
        let _ = self
            .ctx
            .store
            .update_session_status(&self.ctx.session_id, SessionStatus::Active, None)
            .map_err(|e| warn!(error = %e, "failed to record active status"));
        self.status = SessionStatus::Active;
        info!(session_id = %self.ctx.session_id, "worker initialized, session active");
        self.broadcast_status_with_phase(StartupPhase::Ready, None);
    }

    fn on_worker_question(
        &mut self,
        text: String,
        options: Vec<hq_protocol::worker::QuestionOption>,
    ) {
        let worker_id = match self.ensure_worker() {
            Some(worker_id) => worker_id,
            None => return,
        };
        let options: Vec<hq_store::QuestionOption> = options
            .into_iter()
            .map(|o| hq_store::QuestionOption {
                id: o.id,
                text: o.text,
            })
            .collect();
        match self.ctx.blocker.ask(&worker_id, &text, &options) {
            Ok(question) => {
                self.broadcast_status(None);
                // Watch for the answer so timeouts are visible in the log;
                // delivery itself rides the blocker's answered broadcast.
                let blocker = Arc::clone(&self.ctx.blocker);
                let question_id = question.question_id.clone();
                let timeout = Duration::from_millis(self.ctx.settings.timeouts.answer_ms);
                let cancel = self.answer_cancel.clone();
                let session_id = self.ctx.session_id.clone();
                drop(tokio::spawn(async move {
                    match blocker.await_answer(&question_id, timeout, cancel).await {
                        Ok(answered) => {
                            debug!(session_id = %session_id, question_id = %question_id,
                                answer = answered.answer.as_deref().unwrap_or(""), "question resolved");
                        }
                        Err(e) => {
                            warn!(session_id = %session_id, question_id = %question_id,
                                error = %e, "question wait ended without answer");
                        }
                    }
                }));
            }
            Err(e) => {
                warn!(session_id = %self.ctx.session_id, error = %e, "question rejected");
            }
        }
    }

    fn on_user_message(&mut self, content: String) {
        if self.status.is_terminal() {
            debug!(session_id = %self.ctx.session_id, "user message after terminal status dropped");
            return;
        }
        counter!(RELAY_FRAMES_TOTAL, "direction" => "browser_to_worker").increment(1);

        // A pending question swallows the next user message as its answer.
        if let Some(worker_id) = self.worker_id.clone() {
            match self.ctx.blocker.pending_for_worker(&worker_id) {
                Ok(Some(pending)) => {
                    match self
                        .ctx
                        .blocker
                        .provide_answer(&pending.question_id, &content)
                    {
                        // Delivery to the worker rides the answered broadcast.
                        Ok(_) => {}
                        Err(e) => {
                            warn!(session_id = %self.ctx.session_id, error = %e, "answer rejected")
                        }
                    }
                    return;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "pending-question lookup failed"),
            }
        }

        self.persist_message(MessageKind::User, &content, &Map::new());
        self.send_worker(WorkerCommand::User { content });
    }

    fn persist_and_fanout(&mut self, kind: MessageKind, data: Map<String, Value>) {
        let content = data.get("content").map(value_to_text).unwrap_or_default();
        self.persist_message(kind, &content, &data);
        self.broadcast(BrowserOutEvent::SessionMessage {
            session_id: self.ctx.session_id.clone(),
            message_type: kind.as_str().to_string(),
            content,
            raw: Some(Value::Object(data)),
        });
    }

    fn persist_message(&self, kind: MessageKind, content: &str, raw: &Map<String, Value>) {
        let metadata = if raw.is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::json!({"raw": Value::Object(raw.clone())})
        };
        if let Err(e) =
            self.ctx
                .store
                .append_message(&self.ctx.session_id, kind, content, metadata)
        {
            warn!(session_id = %self.ctx.session_id, error = %e, "failed to persist message");
        }
    }

    async fn on_startup_timeout(&mut self) {
        if self.status != SessionStatus::Starting {
            return;
        }
        warn!(session_id = %self.ctx.session_id, "startup timeout");
        self.close_worker(1001, "Worker failed to start");
        self.stop_fleet_task().await;
        self.transition(SessionStatus::Errored, Some("Worker failed to start"));
    }

    async fn on_idle_timeout(&mut self) {
        if self.status != SessionStatus::Active {
            return;
        }
        let idle = Duration::from_millis(self.ctx.settings.timeouts.idle_ms);
        if self.last_activity.elapsed() < idle {
            return;
        }
        info!(session_id = %self.ctx.session_id, "idle timeout");
        self.close_worker(1000, "Idle timeout");
        self.stop_fleet_task().await;
        self.transition(SessionStatus::Stopped, Some("Idle timeout"));
    }

    /// Garbage-collect the record once terminal for the grace period AND
    /// both sides are gone. Returns whether the actor should exit.
    fn try_collect(&mut self) -> bool {
        let worker_present = self
            .ctx
            .registry
            .get(&relay_key(&self.ctx.session_id))
            .is_some();
        let browser_watching = self
            .ctx
            .registry
            .all()
            .iter()
            .any(|conn| conn.is_subscribed(&self.ctx.session_id));
        if worker_present || browser_watching {
            // Re-arm: hold the record while anyone is still attached.
            self.terminal_at = Some(Instant::now());
            return false;
        }
        match self.ctx.store.delete_session(&self.ctx.session_id) {
            Ok(_) => info!(session_id = %self.ctx.session_id, "session record collected"),
            Err(e) => warn!(session_id = %self.ctx.session_id, error = %e, "session GC failed"),
        }
        true
    }

    async fn stop_fleet_task(&mut self) {
        if let Some(tracking_id) = self.tracking_id.take() {
            if let Err(e) = self.ctx.fleet.stop(&tracking_id).await {
                warn!(%tracking_id, error = %e, "failed to stop fleet task");
            }
        }
    }

    fn touch_activity(&mut self) {
        self.last_activity = Instant::now();
        let _ = self
            .ctx
            .store
            .touch_session_activity(&self.ctx.session_id, chrono::Utc::now())
            .map_err(|e| debug!(error = %e, "activity touch failed"));
    }

    fn ensure_worker(&mut self) -> Option<WorkerId> {
        if let Some(worker_id) = &self.worker_id {
            return Some(worker_id.clone());
        }
        let worker_id = WorkerId::generate();
        if let Err(e) = self.ctx.store.create_worker(
            &worker_id,
            &format!("session {}", self.ctx.session_id),
            WorkerStatus::Running,
        ) {
            warn!(error = %e, "failed to register worker");
            return None;
        }
        if let Err(e) = self
            .ctx
            .store
            .set_session_worker(&self.ctx.session_id, &worker_id)
        {
            warn!(error = %e, "failed to bind worker to session");
        }
        self.worker_id = Some(worker_id.clone());
        Some(worker_id)
    }

    fn transition(&mut self, status: SessionStatus, error: Option<&str>) {
        if let Err(e) = self
            .ctx
            .store
            .update_session_status(&self.ctx.session_id, status, error)
        {
            warn!(session_id = %self.ctx.session_id, error = %e, "status transition failed");
        }
        self.status = status;
        if status.is_terminal() {
            self.terminal_at = Some(Instant::now());
            self.answer_cancel.cancel();
            self.ctx.tokens.revoke_session(&self.ctx.session_id);
            if let Some(worker_id) = self.worker_id.clone() {
                let _ = self
                    .ctx
                    .store
                    .update_worker_status(&worker_id, WorkerStatus::Stopped)
                    .map_err(|e| debug!(error = %e, "worker status update failed"));
            }
            counter!(SESSIONS_TERMINAL_TOTAL, "status" => status.as_str()).increment(1);
        }
        self.broadcast_status(error);
    }

    fn close_worker(&self, code: u16, reason: &str) {
        if let Some(conn) = self.ctx.registry.get(&relay_key(&self.ctx.session_id)) {
            conn.close(code, reason);
        }
    }

    fn send_worker(&self, command: WorkerCommand) {
        let line = command.encode_line();
        if !self
            .ctx
            .registry
            .send_to_key(&relay_key(&self.ctx.session_id), Arc::new(line))
        {
            debug!(session_id = %self.ctx.session_id, "no worker socket for command");
        }
    }

    fn broadcast(&self, event: BrowserOutEvent) {
        let encoded = Arc::new(Envelope::now(event).encode());
        self.ctx
            .registry
            .broadcast_to_session(&self.ctx.session_id, &encoded);
    }

    fn broadcast_status(&self, error: Option<&str>) {
        self.broadcast_status_payload(None, error);
    }

    fn broadcast_status_with_phase(&self, phase: StartupPhase, error: Option<&str>) {
        self.broadcast_status_payload(Some(phase), error);
    }

    fn broadcast_status_payload(&self, phase: Option<StartupPhase>, error: Option<&str>) {
        let record = match self.ctx.store.get_session(&self.ctx.session_id) {
            Ok(Some(record)) => record,
            _ => return,
        };
        let phase = phase.or_else(|| {
            (record.startup_phase != StartupPhase::None).then_some(record.startup_phase)
        });
        let payload = SessionStatusPayload {
            startup_phase: phase,
            startup_timestamp: phase.map(|_| format_ts(chrono::Utc::now())),
            error: error
                .map(String::from)
                .or_else(|| record.error.clone()),
            last_activity_at: Some(format_ts(record.last_activity_at)),
            ..SessionStatusPayload::new(self.ctx.session_id.clone(), record.status)
        };
        self.broadcast(BrowserOutEvent::SessionStatus(payload));
    }
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
