//! Session lifecycle: creation, the per-session actor, and the commands
//! the relay and browser handlers feed it.
//!
//! All mutations and browser broadcasts for one session flow through that
//! session's actor, so status events reach every subscriber in the order
//! the state machine produced them. Across sessions there is no ordering
//! and full parallelism.

pub mod actor;

use hq_core::errors::HqError;
use hq_core::ids::{SessionId, WorkerId};
use hq_core::session::{SessionStatus, WorkerStatus};
use hq_fleet::{ComputeBackend, SpawnRequest};
use hq_protocol::browser::PermissionBehavior;
use hq_protocol::worker::{WorkerCommand, WorkerFrame};
use hq_settings::HqSettings;
use hq_store::{SessionRecord, Store, StoreError};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AccessTokenService;
use crate::blocker::QuestionBlocker;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::relay_key;

/// Commands delivered to a session's actor.
#[derive(Debug)]
pub enum SessionCommand {
    /// The worker socket attached.
    WorkerConnected,
    /// One decoded worker frame.
    WorkerFrame(WorkerFrame),
    /// The worker socket closed.
    WorkerDisconnected,
    /// The worker went silent past the keepalive window.
    WorkerKeepaliveLost,
    /// Browser input for the worker (or a pending question's answer).
    UserMessage {
        /// Message text.
        content: String,
    },
    /// Browser decision on a permission request.
    PermissionResponse {
        /// Request being decided.
        request_id: String,
        /// The decision.
        behavior: PermissionBehavior,
    },
    /// Explicit stop (API or shutdown).
    Stop {
        /// Close reason propagated to the worker socket.
        reason: String,
    },
    /// The fleet submission failed.
    SpawnFailed {
        /// Failure description.
        error: String,
    },
    /// The fleet submission succeeded.
    SpawnTracked {
        /// Fleet tracking id, used for cancellation.
        tracking_id: String,
    },
}

/// Owns session actors and the session-facing API.
pub struct SessionService {
    store: Arc<Store>,
    registry: Arc<ConnectionRegistry>,
    blocker: Arc<QuestionBlocker>,
    tokens: Arc<AccessTokenService>,
    fleet: Arc<dyn ComputeBackend>,
    settings: Arc<HqSettings>,
    actors: Arc<Mutex<HashMap<String, mpsc::Sender<SessionCommand>>>>,
    shutdown: CancellationToken,
}

impl SessionService {
    /// Build the service and start the answer forwarder.
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ConnectionRegistry>,
        blocker: Arc<QuestionBlocker>,
        tokens: Arc<AccessTokenService>,
        fleet: Arc<dyn ComputeBackend>,
        settings: Arc<HqSettings>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            store,
            registry,
            blocker,
            tokens,
            fleet,
            settings,
            actors: Arc::new(Mutex::new(HashMap::new())),
            shutdown,
        });
        service.spawn_answer_forwarder();
        service
    }

    /// Create a session: persist the record, bind a worker identity, mint
    /// the access token, start the actor, and submit the fleet task in the
    /// background.
    pub async fn create_session(
        &self,
        user_id: &str,
        prompt: &str,
        worker_context: Value,
    ) -> Result<(SessionRecord, String), HqError> {
        if prompt.trim().is_empty() {
            return Err(HqError::validation("Prompt is required"));
        }
        let record = self.store.create_session(&hq_store::store::CreateSession {
            user_id,
            initial_prompt: prompt,
            worker_context,
        })?;
        let session_id = record.session_id.clone();

        let worker_id = WorkerId::generate();
        let _ = self.store.create_worker(
            &worker_id,
            &format!("session {session_id}"),
            WorkerStatus::Idle,
        )?;
        let _ = self.store.set_session_worker(&session_id, &worker_id)?;

        let access_token = self.tokens.mint(&session_id);
        self.ensure_actor(&session_id);
        self.submit_spawn(&session_id, &worker_id, &access_token, &record);

        let record = self
            .store
            .get_session(&session_id)?
            .ok_or_else(|| HqError::internal("created session vanished"))?;
        info!(session_id = %session_id, "session created");
        Ok((record, access_token))
    }

    /// Submit the fleet task in a background task; failures feed
    /// `SpawnFailed` into the actor.
    fn submit_spawn(
        &self,
        session_id: &SessionId,
        worker_id: &WorkerId,
        access_token: &str,
        record: &SessionRecord,
    ) {
        if self.settings.fleet.endpoint.is_empty() {
            debug!(session_id = %session_id, "no fleet endpoint configured, expecting external worker");
            return;
        }
        let request = SpawnRequest {
            session_id: session_id.as_str().to_string(),
            worker_id: worker_id.as_str().to_string(),
            access_token: access_token.to_string(),
            api_url: self.settings.server.api_url.clone(),
            skill: self.settings.fleet.skill.clone(),
            parameters: record.worker_context.clone(),
            cpu: self.settings.fleet.cpu,
            memory: self.settings.fleet.memory,
        };
        let fleet = Arc::clone(&self.fleet);
        let actors = Arc::clone(&self.actors);
        let session_id = session_id.clone();
        drop(tokio::spawn(async move {
            let command = match fleet.spawn(&request).await {
                Ok(tracking) => SessionCommand::SpawnTracked {
                    tracking_id: tracking.tracking_id,
                },
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "fleet spawn failed");
                    SessionCommand::SpawnFailed {
                        error: e.to_string(),
                    }
                }
            };
            let sender = actors.lock().get(session_id.as_str()).cloned();
            if let Some(sender) = sender {
                let _ = sender.send(command).await;
            }
        }));
    }

    /// Start (or find) the actor for a session.
    pub fn ensure_actor(&self, session_id: &SessionId) -> mpsc::Sender<SessionCommand> {
        if let Some(sender) = self.actors.lock().get(session_id.as_str()) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::channel(64);
        let previous = self
            .actors
            .lock()
            .insert(session_id.as_str().to_string(), tx.clone());
        if let Some(previous) = previous {
            // Lost the race; reuse the winner.
            let _ = self
                .actors
                .lock()
                .insert(session_id.as_str().to_string(), previous.clone());
            return previous;
        }
        actor::spawn(
            actor::ActorContext {
                session_id: session_id.clone(),
                store: Arc::clone(&self.store),
                registry: Arc::clone(&self.registry),
                blocker: Arc::clone(&self.blocker),
                tokens: Arc::clone(&self.tokens),
                fleet: Arc::clone(&self.fleet),
                settings: Arc::clone(&self.settings),
                actors: Arc::clone(&self.actors),
                shutdown: self.shutdown.clone(),
            },
            rx,
        );
        tx
    }

    /// Route a command to the session's actor.
    pub async fn command(&self, session_id: &SessionId, command: SessionCommand) {
        let sender = self.ensure_actor(session_id);
        if sender.send(command).await.is_err() {
            debug!(session_id = %session_id, "actor gone, command dropped");
        }
    }

    /// Relay hook: the worker socket attached.
    pub async fn worker_connected(&self, session_id: &SessionId) {
        self.command(session_id, SessionCommand::WorkerConnected)
            .await;
    }

    /// Relay hook: one decoded worker frame.
    pub async fn worker_frame(&self, session_id: &SessionId, frame: WorkerFrame) {
        self.command(session_id, SessionCommand::WorkerFrame(frame))
            .await;
    }

    /// Relay hook: worker socket closed.
    pub async fn worker_disconnected(&self, session_id: &SessionId) {
        self.command(session_id, SessionCommand::WorkerDisconnected)
            .await;
    }

    /// Relay hook: worker silent past the keepalive window.
    pub async fn worker_keepalive_lost(&self, session_id: &SessionId) {
        self.command(session_id, SessionCommand::WorkerKeepaliveLost)
            .await;
    }

    /// Browser hook: user input for a session.
    pub async fn user_message(&self, session_id: &SessionId, content: String) {
        self.command(session_id, SessionCommand::UserMessage { content })
            .await;
    }

    /// Browser hook: permission decision.
    pub async fn permission_response(
        &self,
        session_id: &SessionId,
        request_id: String,
        behavior: PermissionBehavior,
    ) {
        self.command(
            session_id,
            SessionCommand::PermissionResponse {
                request_id,
                behavior,
            },
        )
        .await;
    }

    /// Stop a session via the API.
    pub async fn stop_session(&self, session_id: &SessionId) -> Result<SessionRecord, HqError> {
        let record = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| HqError::not_found(format!("session {session_id}")))?;
        if !record.status.is_terminal() {
            self.command(
                session_id,
                SessionCommand::Stop {
                    reason: "Stopped by user".into(),
                },
            )
            .await;
        }
        Ok(self
            .store
            .get_session(session_id)?
            .unwrap_or(record))
    }

    /// Consume the worker's access token for a session.
    pub fn consume_access_token(&self, token: &str, session_id: &SessionId) -> bool {
        self.tokens.consume(token, session_id)
    }

    /// Forward every answered question to its worker's relay socket.
    ///
    /// Covers all three answer paths (browser message, answer API,
    /// transport callback) with one delivery point, preserving ask → answer
    /// → resume causality.
    fn spawn_answer_forwarder(self: &Arc<Self>) {
        let mut answered_rx = self.blocker.on_question_answered();
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let shutdown = self.shutdown.clone();
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = answered_rx.recv() => {
                        let Ok(answered) = received else { break };
                        let Some(answer) = answered.answer.clone() else { continue };
                        match store.session_for_worker(&answered.worker_id) {
                            Ok(Some(session)) => {
                                let line = WorkerCommand::User { content: answer }.encode_line();
                                if !registry.send_to_key(
                                    &relay_key(&session.session_id),
                                    Arc::new(line),
                                ) {
                                    debug!(
                                        session_id = %session.session_id,
                                        "no worker socket for answer delivery"
                                    );
                                }
                            }
                            Ok(None) => {
                                debug!(worker_id = %answered.worker_id, "answered question has no live session");
                            }
                            Err(e) => warn!(error = %e, "answer forwarder store lookup failed"),
                        }
                    }
                }
            }
        }));
    }

    /// Store handle for read paths.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Count of sessions currently in a non-terminal status.
    pub fn active_session_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .store
            .list_sessions()?
            .iter()
            .filter(|s| !s.status.is_terminal())
            .count())
    }

    /// Whether a session is terminal (relay rejects such connects).
    pub fn is_terminal(&self, record: &SessionRecord) -> bool {
        matches!(
            record.status,
            SessionStatus::Stopped | SessionStatus::Errored
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hq_core::session::StartupPhase;
    use hq_fleet::MockComputeBackend;
    use hq_settings::HqSettings;
    use hq_store::{ConnectionConfig, new_in_memory};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        service: Arc<SessionService>,
        store: Arc<Store>,
        fleet: Arc<MockComputeBackend>,
    }

    fn harness(configure: impl FnOnce(&mut HqSettings)) -> Harness {
        let mut settings = HqSettings::default();
        configure(&mut settings);
        let settings = Arc::new(settings);
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let store = Arc::new(Store::open(pool).unwrap());
        let registry = Arc::new(ConnectionRegistry::new());
        let blocker = Arc::new(QuestionBlocker::new(Arc::clone(&store)));
        let tokens = Arc::new(AccessTokenService::new());
        let fleet = Arc::new(MockComputeBackend::new());
        let service = SessionService::new(
            Arc::clone(&store),
            registry,
            blocker,
            tokens,
            Arc::clone(&fleet) as Arc<dyn ComputeBackend>,
            settings,
            CancellationToken::new(),
        );
        Harness {
            service,
            store,
            fleet,
        }
    }

    async fn wait_for_status(
        store: &Arc<Store>,
        session_id: &SessionId,
        status: SessionStatus,
    ) -> SessionRecord {
        for _ in 0..500 {
            if let Some(record) = store.get_session(session_id).unwrap() {
                if record.status == status {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {status}");
    }

    #[tokio::test]
    async fn create_session_mints_token_and_binds_worker() {
        let h = harness(|_| {});
        let (record, token) = h
            .service
            .create_session("user1", "fix the tests", json!({"repo": "hq"}))
            .await
            .unwrap();
        assert_eq!(record.status, SessionStatus::Starting);
        assert_eq!(record.startup_phase, StartupPhase::Provisioning);
        assert!(record.worker_id.is_some());
        assert!(!token.is_empty());

        // The minted token consumes exactly once, for this session only.
        assert!(
            h.service
                .consume_access_token(&token, &record.session_id)
        );
        assert!(
            !h.service
                .consume_access_token(&token, &record.session_id)
        );
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected() {
        let h = harness(|_| {});
        let result = h.service.create_session("user1", "  ", json!({})).await;
        assert!(matches!(result, Err(HqError::Validation { .. })));
    }

    #[tokio::test]
    async fn spawn_failure_errors_the_session() {
        let h = harness(|settings| {
            settings.fleet.endpoint = "http://fleet.test".into();
        });
        h.fleet.fail_spawns(true);
        let (record, _token) = h
            .service
            .create_session("user1", "doomed", json!({}))
            .await
            .unwrap();

        let errored = wait_for_status(&h.store, &record.session_id, SessionStatus::Errored).await;
        assert!(errored.error.is_some());
        assert!(errored.stopped_at.is_some());
    }

    #[tokio::test]
    async fn successful_spawn_carries_session_environment() {
        let h = harness(|settings| {
            settings.fleet.endpoint = "http://fleet.test".into();
            settings.fleet.skill = "review".into();
        });
        let (record, token) = h
            .service
            .create_session("user1", "review my PR", json!({"pr": 42}))
            .await
            .unwrap();

        // Submission happens on a background task.
        for _ in 0..500 {
            if !h.fleet.spawned().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let spawned = h.fleet.spawned();
        assert_eq!(spawned.len(), 1);
        assert_eq!(spawned[0].session_id, record.session_id.as_str());
        assert_eq!(spawned[0].access_token, token);
        assert_eq!(spawned[0].skill, "review");
        assert_eq!(spawned[0].parameters["pr"], 42);
    }

    #[tokio::test]
    async fn stop_session_is_terminal_and_idempotent() {
        let h = harness(|_| {});
        let (record, _token) = h
            .service
            .create_session("user1", "stop me", json!({}))
            .await
            .unwrap();

        let _ = h.service.stop_session(&record.session_id).await.unwrap();
        let stopped =
            wait_for_status(&h.store, &record.session_id, SessionStatus::Stopped).await;
        let stamped = stopped.stopped_at.unwrap();

        // Stopping again changes nothing.
        let again = h.service.stop_session(&record.session_id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Stopped);
        assert_eq!(again.stopped_at.unwrap(), stamped);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_timeout_errors_with_canonical_reason() {
        let h = harness(|_| {});
        let (record, _token) = h
            .service
            .create_session("user1", "never starts", json!({}))
            .await
            .unwrap();

        // Default startup budget is five minutes; step past it.
        tokio::time::sleep(Duration::from_secs(301)).await;

        let errored = wait_for_status(&h.store, &record.session_id, SessionStatus::Errored).await;
        assert_eq!(errored.error.as_deref(), Some("Worker failed to start"));
    }

    #[tokio::test]
    async fn unknown_session_stop_is_not_found() {
        let h = harness(|_| {});
        let missing = SessionId::from_string("sess_missing");
        assert!(matches!(
            h.service.stop_session(&missing).await,
            Err(HqError::NotFound { .. })
        ));
    }
}
