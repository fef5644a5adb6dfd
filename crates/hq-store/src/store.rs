//! High-level transactional store API.
//!
//! Every write runs inside a SQLite transaction — callers never observe
//! partial state.
//!
//! INVARIANT: session writes are serialized per-session via in-process
//! mutex locks (`with_session_write_lock`). Global mutations use a separate
//! global lock. `PRIMARY KEY (session_id, sequence)` enforces message
//! ordering at the DB level as a second line of defense.

use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, instrument};

use chrono::{DateTime, Utc};
use hq_core::ids::{QuestionId, SessionId, ShareId, WorkerId};
use hq_core::session::{
    MessageKind, QuestionStatus, SessionStatus, ShareStatus, StartupPhase, WorkerStatus,
};
use serde_json::Value;

use crate::connection::{ConnectionPool, PooledConnection};
use crate::errors::{Result, StoreError};
use crate::migrations::run_migrations;
use crate::records::{
    ApiKeyRecord, PendingQuestion, QuestionOption, SessionMessage, SessionRecord, ShareRecord,
    WorkerRecord, format_ts, parse_ts,
};

/// Fields for creating a session.
#[derive(Debug)]
pub struct CreateSession<'a> {
    /// Owning user.
    pub user_id: &'a str,
    /// Prompt delivered to the worker as its first frame.
    pub initial_prompt: &'a str,
    /// Free-form context forwarded to the worker environment.
    pub worker_context: Value,
}

/// Patch for an existing share; `None` fields are left untouched.
#[derive(Debug, Default)]
pub struct UpdateShare {
    /// Replacement path prefixes.
    pub paths: Option<Vec<String>>,
    /// Replacement permissions.
    pub permissions: Option<Vec<String>>,
    /// Replacement expiry (`Some(None)` clears it).
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

/// High-level store wrapping a connection pool.
pub struct Store {
    pool: ConnectionPool,
    global_write_lock: Mutex<()>,
    session_write_locks: Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl Store {
    const SQLITE_BUSY_MAX_RETRIES: u32 = 32;

    /// Open a store over a pool, running migrations.
    pub fn open(pool: ConnectionPool) -> Result<Self> {
        {
            let conn = pool.get()?;
            run_migrations(&conn)?;
        }
        Ok(Self {
            pool,
            global_write_lock: Mutex::new(()),
            session_write_locks: Mutex::new(HashMap::new()),
        })
    }

    fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }

    fn acquire_session_write_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .session_write_locks
            .lock()
            .map_err(|_| StoreError::Internal("session lock map poisoned".into()))?;

        // Opportunistically prune dead weak refs when the map grows.
        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(session_id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let lock = Arc::new(Mutex::new(()));
        let _ = locks.insert(session_id.to_string(), Arc::downgrade(&lock));
        Ok(lock)
    }

    fn with_session_write_lock<T>(
        &self,
        session_id: &str,
        f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let session_lock = self.acquire_session_write_lock(session_id)?;
        let _guard: MutexGuard<'_, ()> = session_lock
            .lock()
            .map_err(|_| StoreError::Internal("session write lock poisoned".into()))?;
        self.retry_on_sqlite_busy(f)
    }

    fn with_global_write_lock<T>(&self, f: impl FnMut() -> Result<T>) -> Result<T> {
        let _guard = self
            .global_write_lock
            .lock()
            .map_err(|_| StoreError::Internal("global write lock poisoned".into()))?;
        self.retry_on_sqlite_busy(f)
    }

    /// Retry an operation on SQLite BUSY/LOCKED with linear backoff + jitter.
    #[allow(clippy::unused_self)]
    fn retry_on_sqlite_busy<T>(&self, mut f: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempts = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err)
                    if Self::is_sqlite_busy_or_locked(&err)
                        && attempts < Self::SQLITE_BUSY_MAX_RETRIES =>
                {
                    attempts += 1;
                    let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                    let jitter_range = base_ms / 4;
                    let jitter = if jitter_range > 0 {
                        rand::random::<u64>() % (jitter_range * 2 + 1)
                    } else {
                        0
                    };
                    let backoff_ms = base_ms.saturating_sub(jitter_range) + jitter;
                    std::thread::sleep(Duration::from_millis(backoff_ms));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_sqlite_busy_or_locked(err: &StoreError) -> bool {
        match err {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    fn is_unique_violation(err: &StoreError) -> bool {
        matches!(
            err,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(code, _))
                if code.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────

    /// Create a session in `starting`/`provisioning`.
    #[instrument(skip(self, opts), fields(user_id = opts.user_id))]
    pub fn create_session(&self, opts: &CreateSession<'_>) -> Result<SessionRecord> {
        let session_id = SessionId::generate();
        let now = format_ts(Utc::now());
        let context = serde_json::to_string(&opts.worker_context)?;
        self.with_global_write_lock(|| {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO sessions (id, user_id, status, startup_phase, initial_prompt,
                    worker_context, message_count, created_at, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
                rusqlite::params![
                    session_id.as_str(),
                    opts.user_id,
                    SessionStatus::Starting.as_str(),
                    StartupPhase::Provisioning.as_str(),
                    opts.initial_prompt,
                    context,
                    now,
                ],
            )
            .map(|_| ())?;
            Ok(())
        })?;
        debug!(session_id = %session_id, "session created");
        self.get_session(&session_id)?
            .ok_or_else(|| StoreError::Internal("created session vanished".into()))
    }

    /// Fetch a session by ID.
    pub fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, user_id, worker_id, status, startup_phase, initial_prompt,
                        worker_context, capabilities, error, message_count, created_at,
                        last_activity_at, stopped_at
                 FROM sessions WHERE id = ?1",
                rusqlite::params![session_id.as_str()],
                session_row,
            )
            .optional()?;
        row.map(raw_to_session).transpose()
    }

    /// All sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, worker_id, status, startup_phase, initial_prompt,
                    worker_context, capabilities, error, message_count, created_at,
                    last_activity_at, stopped_at
             FROM sessions ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], session_row)?;
        rows.map(|r| raw_to_session(r?)).collect()
    }

    /// The non-terminal session bound to `worker_id`, if any.
    pub fn session_for_worker(&self, worker_id: &WorkerId) -> Result<Option<SessionRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, user_id, worker_id, status, startup_phase, initial_prompt,
                        worker_context, capabilities, error, message_count, created_at,
                        last_activity_at, stopped_at
                 FROM sessions
                 WHERE worker_id = ?1 AND status IN ('starting', 'active')
                 ORDER BY created_at DESC LIMIT 1",
                rusqlite::params![worker_id.as_str()],
                session_row,
            )
            .optional()?;
        row.map(raw_to_session).transpose()
    }

    /// Bind a worker to a session.
    pub fn set_session_worker(
        &self,
        session_id: &SessionId,
        worker_id: &WorkerId,
    ) -> Result<bool> {
        self.with_session_write_lock(session_id.as_str(), || {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE sessions SET worker_id = ?2 WHERE id = ?1",
                rusqlite::params![session_id.as_str(), worker_id.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Terminal sessions whose `stoppedAt` is at or before `cutoff` (GC sweep).
    pub fn terminal_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<SessionId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM sessions
             WHERE status IN ('stopped', 'errored') AND stopped_at IS NOT NULL
               AND stopped_at <= ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![format_ts(cutoff)], |row| {
            row.get::<_, String>(0)
        })?;
        rows.map(|r| Ok(SessionId::from_string(r?))).collect()
    }

    /// Transition a session's status.
    ///
    /// Entering a terminal status stamps `stoppedAt` exactly once and stores
    /// the error reason, when given.
    pub fn update_session_status(
        &self,
        session_id: &SessionId,
        status: SessionStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        self.with_session_write_lock(session_id.as_str(), || {
            let conn = self.conn()?;
            let now = format_ts(Utc::now());
            let changed = if status.is_terminal() {
                conn.execute(
                    "UPDATE sessions
                     SET status = ?2, startup_phase = 'none',
                         stopped_at = COALESCE(stopped_at, ?3),
                         error = COALESCE(?4, error)
                     WHERE id = ?1",
                    rusqlite::params![session_id.as_str(), status.as_str(), now, error],
                )?
            } else {
                conn.execute(
                    "UPDATE sessions SET status = ?2 WHERE id = ?1",
                    rusqlite::params![session_id.as_str(), status.as_str()],
                )?
            };
            Ok(changed > 0)
        })
    }

    /// Advance the startup phase.
    pub fn update_startup_phase(
        &self,
        session_id: &SessionId,
        phase: StartupPhase,
    ) -> Result<bool> {
        self.with_session_write_lock(session_id.as_str(), || {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE sessions SET startup_phase = ?2 WHERE id = ?1",
                rusqlite::params![session_id.as_str(), phase.as_str()],
            )?;
            Ok(changed > 0)
        })
    }

    /// Store the worker's reported capabilities.
    pub fn set_session_capabilities(
        &self,
        session_id: &SessionId,
        capabilities: &Value,
    ) -> Result<bool> {
        let text = serde_json::to_string(capabilities)?;
        self.with_session_write_lock(session_id.as_str(), || {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE sessions SET capabilities = ?2 WHERE id = ?1",
                rusqlite::params![session_id.as_str(), text],
            )?;
            Ok(changed > 0)
        })
    }

    /// Record worker activity.
    ///
    /// `lastActivityAt` never moves backwards: the stored value is the max
    /// of the existing and supplied instants.
    pub fn touch_session_activity(
        &self,
        session_id: &SessionId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_session_write_lock(session_id.as_str(), || {
            let conn = self.conn()?;
            let changed = conn.execute(
                "UPDATE sessions SET last_activity_at = MAX(last_activity_at, ?2) WHERE id = ?1",
                rusqlite::params![session_id.as_str(), format_ts(at)],
            )?;
            Ok(changed > 0)
        })
    }

    /// Delete a session and (by cascade) its messages.
    pub fn delete_session(&self, session_id: &SessionId) -> Result<bool> {
        let deleted = self.with_session_write_lock(session_id.as_str(), || {
            let conn = self.conn()?;
            let deleted = conn.execute(
                "DELETE FROM sessions WHERE id = ?1",
                rusqlite::params![session_id.as_str()],
            )?;
            Ok(deleted > 0)
        })?;
        if deleted {
            let mut locks = self
                .session_write_locks
                .lock()
                .map_err(|_| StoreError::Internal("session lock map poisoned".into()))?;
            let _ = locks.remove(session_id.as_str());
        }
        Ok(deleted)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session messages
    // ─────────────────────────────────────────────────────────────────────

    /// Append a message with the next dense sequence number.
    ///
    /// Atomic: sequence generation, insertion, and the session's
    /// `messageCount`/`lastActivityAt` bump happen in one transaction.
    #[instrument(skip(self, content, metadata), fields(session_id = %session_id, kind = %kind))]
    pub fn append_message(
        &self,
        session_id: &SessionId,
        kind: MessageKind,
        content: &str,
        metadata: Value,
    ) -> Result<SessionMessage> {
        let metadata_text = serde_json::to_string(&metadata)?;
        self.with_session_write_lock(session_id.as_str(), || {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    rusqlite::params![session_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::NotFound(format!("session {session_id}")));
            }

            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM session_messages
                 WHERE session_id = ?1",
                rusqlite::params![session_id.as_str()],
                |row| row.get(0),
            )?;
            let now = Utc::now();
            let now_text = format_ts(now);
            tx.execute(
                "INSERT INTO session_messages (session_id, sequence, timestamp, kind, content, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    session_id.as_str(),
                    sequence,
                    now_text,
                    kind.as_str(),
                    content,
                    metadata_text,
                ],
            )
            .map(|_| ())?;
            tx.execute(
                "UPDATE sessions
                 SET message_count = message_count + 1,
                     last_activity_at = MAX(last_activity_at, ?2)
                 WHERE id = ?1",
                rusqlite::params![session_id.as_str(), now_text],
            )
            .map(|_| ())?;
            tx.commit()?;

            Ok(SessionMessage {
                session_id: session_id.clone(),
                sequence,
                timestamp: now,
                kind,
                content: content.to_string(),
                metadata: serde_json::from_str(&metadata_text)?,
            })
        })
    }

    /// Messages with sequence strictly greater than `after`, in order.
    pub fn messages_after(
        &self,
        session_id: &SessionId,
        after: i64,
    ) -> Result<Vec<SessionMessage>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT session_id, sequence, timestamp, kind, content, metadata
             FROM session_messages
             WHERE session_id = ?1 AND sequence > ?2
             ORDER BY sequence ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![session_id.as_str(), after], message_row)?;
        rows.map(|r| raw_to_message(r?)).collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Workers
    // ─────────────────────────────────────────────────────────────────────

    /// Register a worker. Conflicts if the ID is taken.
    pub fn create_worker(
        &self,
        worker_id: &WorkerId,
        name: &str,
        status: WorkerStatus,
    ) -> Result<WorkerRecord> {
        let now = format_ts(Utc::now());
        let result = self.with_global_write_lock(|| {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO workers (id, name, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![worker_id.as_str(), name, status.as_str(), now],
            )
            .map(|_| ())?;
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(err) if Self::is_unique_violation(&err) => {
                return Err(StoreError::Conflict(format!(
                    "worker {worker_id} already exists"
                )));
            }
            Err(err) => return Err(err),
        }
        self.get_worker(worker_id)?
            .ok_or_else(|| StoreError::Internal("created worker vanished".into()))
    }

    /// Fetch a worker.
    pub fn get_worker(&self, worker_id: &WorkerId) -> Result<Option<WorkerRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, status, created_at, updated_at FROM workers WHERE id = ?1",
                rusqlite::params![worker_id.as_str()],
                worker_row,
            )
            .optional()?;
        row.map(raw_to_worker).transpose()
    }

    /// All workers, oldest first.
    pub fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, status, created_at, updated_at FROM workers ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], worker_row)?;
        rows.map(|r| raw_to_worker(r?)).collect()
    }

    /// Update a worker's status.
    pub fn update_worker_status(
        &self,
        worker_id: &WorkerId,
        status: WorkerStatus,
    ) -> Result<WorkerRecord> {
        let changed = self.with_global_write_lock(|| {
            let conn = self.conn()?;
            Ok(conn.execute(
                "UPDATE workers SET status = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![worker_id.as_str(), status.as_str(), format_ts(Utc::now())],
            )?)
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("worker {worker_id}")));
        }
        self.get_worker(worker_id)?
            .ok_or_else(|| StoreError::Internal("updated worker vanished".into()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pending questions
    // ─────────────────────────────────────────────────────────────────────

    /// Persist a new pending question for a worker.
    ///
    /// The partial unique index enforces at most one `pending` question per
    /// worker; a second insert surfaces as [`StoreError::Conflict`].
    pub fn insert_question(
        &self,
        worker_id: &WorkerId,
        text: &str,
        options: &[QuestionOption],
    ) -> Result<PendingQuestion> {
        if self.get_worker(worker_id)?.is_none() {
            return Err(StoreError::NotFound(format!("worker {worker_id}")));
        }
        let question_id = QuestionId::generate();
        let options_text = serde_json::to_string(options)?;
        let now = format_ts(Utc::now());
        let result = self.with_global_write_lock(|| {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO pending_questions (id, worker_id, text, options, status, asked_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
                rusqlite::params![
                    question_id.as_str(),
                    worker_id.as_str(),
                    text,
                    options_text,
                    now,
                ],
            )
            .map(|_| ())?;
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(err) if Self::is_unique_violation(&err) => {
                return Err(StoreError::Conflict(format!(
                    "worker {worker_id} already has a pending question"
                )));
            }
            Err(err) => return Err(err),
        }
        self.get_question(&question_id)?
            .ok_or_else(|| StoreError::Internal("created question vanished".into()))
    }

    /// Fetch a question.
    pub fn get_question(&self, question_id: &QuestionId) -> Result<Option<PendingQuestion>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, worker_id, text, options, status, asked_at, answered_at, answer
                 FROM pending_questions WHERE id = ?1",
                rusqlite::params![question_id.as_str()],
                question_row,
            )
            .optional()?;
        row.map(raw_to_question).transpose()
    }

    /// The worker's currently pending question, if any.
    pub fn pending_question_for_worker(
        &self,
        worker_id: &WorkerId,
    ) -> Result<Option<PendingQuestion>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, worker_id, text, options, status, asked_at, answered_at, answer
                 FROM pending_questions WHERE worker_id = ?1 AND status = 'pending'",
                rusqlite::params![worker_id.as_str()],
                question_row,
            )
            .optional()?;
        row.map(raw_to_question).transpose()
    }

    /// Questions for a worker, optionally filtered by status, oldest first.
    pub fn list_questions(
        &self,
        worker_id: &WorkerId,
        status: Option<QuestionStatus>,
    ) -> Result<Vec<PendingQuestion>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, worker_id, text, options, status, asked_at, answered_at, answer
             FROM pending_questions
             WHERE worker_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY asked_at ASC",
        )?;
        let status_text = status.map(QuestionStatus::as_str);
        let rows = stmt.query_map(
            rusqlite::params![worker_id.as_str(), status_text],
            question_row,
        )?;
        rows.map(|r| raw_to_question(r?)).collect()
    }

    /// Mark a question answered.
    ///
    /// Fails `NotFound` for unknown IDs and `Conflict` for already-answered
    /// questions. The answered tuple is immutable afterwards.
    #[instrument(skip(self, answer), fields(question_id = %question_id))]
    pub fn answer_question(
        &self,
        question_id: &QuestionId,
        answer: &str,
    ) -> Result<PendingQuestion> {
        self.with_global_write_lock(|| {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM pending_questions WHERE id = ?1",
                    rusqlite::params![question_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            match status.as_deref() {
                None => {
                    return Err(StoreError::NotFound(format!("question {question_id}")));
                }
                Some("answered") => {
                    return Err(StoreError::Conflict(format!(
                        "question {question_id} already answered"
                    )));
                }
                Some(_) => {}
            }
            tx.execute(
                "UPDATE pending_questions
                 SET status = 'answered', answer = ?2, answered_at = ?3
                 WHERE id = ?1",
                rusqlite::params![question_id.as_str(), answer, format_ts(Utc::now())],
            )
            .map(|_| ())?;
            tx.commit()?;
            Ok(())
        })?;
        self.get_question(question_id)?
            .ok_or_else(|| StoreError::Internal("answered question vanished".into()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // API keys
    // ─────────────────────────────────────────────────────────────────────

    /// Store a freshly issued key. Conflicts on prefix collision.
    pub fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<()> {
        let result = self.with_global_write_lock(|| {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO api_keys (prefix, hash, name, rate_limit, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    record.prefix,
                    record.hash,
                    record.name,
                    record.rate_limit,
                    format_ts(record.created_at),
                ],
            )
            .map(|_| ())?;
            Ok(())
        });
        match result {
            Err(err) if Self::is_unique_violation(&err) => Err(StoreError::Conflict(format!(
                "api key prefix {} already exists",
                record.prefix
            ))),
            other => other,
        }
    }

    /// Look up a key by its public prefix.
    pub fn get_api_key(&self, prefix: &str) -> Result<Option<ApiKeyRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT prefix, hash, name, rate_limit, created_at FROM api_keys
                 WHERE prefix = ?1",
                rusqlite::params![prefix],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        Ok(row.map(|(prefix, hash, name, rate_limit, created_at)| ApiKeyRecord {
            prefix,
            hash,
            name,
            rate_limit,
            created_at: parse_ts(&created_at),
        }))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Shares
    // ─────────────────────────────────────────────────────────────────────

    /// Create a share.
    pub fn create_share(
        &self,
        owner_id: &str,
        recipient_id: &str,
        paths: &[String],
        permissions: &[String],
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ShareRecord> {
        let share_id = ShareId::generate();
        let paths_text = serde_json::to_string(paths)?;
        let permissions_text = serde_json::to_string(permissions)?;
        let now = format_ts(Utc::now());
        self.with_global_write_lock(|| {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO shares (id, owner_id, recipient_id, paths, permissions, status,
                    created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?7)",
                rusqlite::params![
                    share_id.as_str(),
                    owner_id,
                    recipient_id,
                    paths_text,
                    permissions_text,
                    now,
                    expires_at.map(format_ts),
                ],
            )
            .map(|_| ())?;
            Ok(())
        })?;
        self.get_share(&share_id)?
            .ok_or_else(|| StoreError::Internal("created share vanished".into()))
    }

    /// Fetch a share.
    pub fn get_share(&self, share_id: &ShareId) -> Result<Option<ShareRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, owner_id, recipient_id, paths, permissions, status, created_at,
                        expires_at
                 FROM shares WHERE id = ?1",
                rusqlite::params![share_id.as_str()],
                share_row,
            )
            .optional()?;
        row.map(raw_to_share).transpose()
    }

    /// Shares, optionally filtered by owner / recipient / status.
    pub fn list_shares(
        &self,
        owner_id: Option<&str>,
        recipient_id: Option<&str>,
        status: Option<ShareStatus>,
    ) -> Result<Vec<ShareRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, recipient_id, paths, permissions, status, created_at, expires_at
             FROM shares
             WHERE (?1 IS NULL OR owner_id = ?1)
               AND (?2 IS NULL OR recipient_id = ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY created_at DESC",
        )?;
        let status_text = status.map(ShareStatus::as_str);
        let rows = stmt.query_map(
            rusqlite::params![owner_id, recipient_id, status_text],
            share_row,
        )?;
        rows.map(|r| raw_to_share(r?)).collect()
    }

    /// Patch a share's paths / permissions / expiry.
    pub fn update_share(&self, share_id: &ShareId, patch: &UpdateShare) -> Result<ShareRecord> {
        let existing = self
            .get_share(share_id)?
            .ok_or_else(|| StoreError::NotFound(format!("share {share_id}")))?;
        let paths = patch.paths.as_ref().unwrap_or(&existing.paths);
        let permissions = patch.permissions.as_ref().unwrap_or(&existing.permissions);
        let expires_at = match patch.expires_at {
            Some(value) => value,
            None => existing.expires_at,
        };
        let paths_text = serde_json::to_string(paths)?;
        let permissions_text = serde_json::to_string(permissions)?;
        self.with_global_write_lock(|| {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE shares SET paths = ?2, permissions = ?3, expires_at = ?4 WHERE id = ?1",
                rusqlite::params![
                    share_id.as_str(),
                    paths_text,
                    permissions_text,
                    expires_at.map(format_ts),
                ],
            )
            .map(|_| ())?;
            Ok(())
        })?;
        self.get_share(share_id)?
            .ok_or_else(|| StoreError::Internal("updated share vanished".into()))
    }

    /// Revoke a share.
    ///
    /// Idempotent: revoking an already-revoked share returns the record
    /// unchanged.
    pub fn revoke_share(&self, share_id: &ShareId) -> Result<ShareRecord> {
        let existing = self
            .get_share(share_id)?
            .ok_or_else(|| StoreError::NotFound(format!("share {share_id}")))?;
        if existing.status == ShareStatus::Revoked {
            return Ok(existing);
        }
        self.with_global_write_lock(|| {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE shares SET status = 'revoked' WHERE id = ?1",
                rusqlite::params![share_id.as_str()],
            )
            .map(|_| ())?;
            Ok(())
        })?;
        self.get_share(share_id)?
            .ok_or_else(|| StoreError::Internal("revoked share vanished".into()))
    }

    /// Delete a share.
    pub fn delete_share(&self, share_id: &ShareId) -> Result<bool> {
        self.with_global_write_lock(|| {
            let conn = self.conn()?;
            let deleted = conn.execute(
                "DELETE FROM shares WHERE id = ?1",
                rusqlite::params![share_id.as_str()],
            )?;
            Ok(deleted > 0)
        })
    }

    /// Shares currently granting access to `recipient_id`.
    pub fn shares_accessible_to(&self, recipient_id: &str) -> Result<Vec<ShareRecord>> {
        let now = Utc::now();
        Ok(self
            .list_shares(None, Some(recipient_id), Some(ShareStatus::Active))?
            .into_iter()
            .filter(|share| share.effective_status(now) == ShareStatus::Active)
            .collect())
    }

    /// Whether `recipient_id` may read `path` under `owner_id`'s prefix
    /// grants.
    pub fn check_share_access(
        &self,
        recipient_id: &str,
        owner_id: &str,
        path: &str,
    ) -> Result<bool> {
        let now = Utc::now();
        let shares = self.list_shares(Some(owner_id), Some(recipient_id), None)?;
        Ok(shares.iter().any(|share| {
            share.effective_status(now) == ShareStatus::Active
                && share.permissions.iter().any(|p| p == "read")
                && share.paths.iter().any(|prefix| path.starts_with(prefix))
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping
// ─────────────────────────────────────────────────────────────────────────────

type RawSession = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    i64,
    String,
    String,
    Option<String>,
);

fn session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
    ))
}

fn raw_to_session(raw: RawSession) -> Result<SessionRecord> {
    let (
        id,
        user_id,
        worker_id,
        status,
        startup_phase,
        initial_prompt,
        worker_context,
        capabilities,
        error,
        message_count,
        created_at,
        last_activity_at,
        stopped_at,
    ) = raw;
    Ok(SessionRecord {
        session_id: SessionId::from_string(id),
        user_id,
        worker_id: worker_id.map(WorkerId::from_string),
        status: status.parse().map_err(StoreError::Internal)?,
        startup_phase: startup_phase.parse().map_err(StoreError::Internal)?,
        initial_prompt,
        worker_context: serde_json::from_str(&worker_context)?,
        capabilities: capabilities.map(|c| serde_json::from_str(&c)).transpose()?,
        error,
        message_count,
        created_at: parse_ts(&created_at),
        last_activity_at: parse_ts(&last_activity_at),
        stopped_at: stopped_at.map(|s| parse_ts(&s)),
    })
}

type RawMessage = (String, i64, String, String, String, String);

fn message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessage> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn raw_to_message(raw: RawMessage) -> Result<SessionMessage> {
    let (session_id, sequence, timestamp, kind, content, metadata) = raw;
    Ok(SessionMessage {
        session_id: SessionId::from_string(session_id),
        sequence,
        timestamp: parse_ts(&timestamp),
        kind: kind.parse().map_err(StoreError::Internal)?,
        content,
        metadata: serde_json::from_str(&metadata)?,
    })
}

type RawWorker = (String, String, String, String, String);

fn worker_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawWorker> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn raw_to_worker(raw: RawWorker) -> Result<WorkerRecord> {
    let (id, name, status, created_at, updated_at) = raw;
    Ok(WorkerRecord {
        worker_id: WorkerId::from_string(id),
        name,
        status: status.parse().map_err(StoreError::Internal)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

type RawQuestion = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
);

fn question_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawQuestion> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn raw_to_question(raw: RawQuestion) -> Result<PendingQuestion> {
    let (id, worker_id, text, options, status, asked_at, answered_at, answer) = raw;
    Ok(PendingQuestion {
        question_id: QuestionId::from_string(id),
        worker_id: WorkerId::from_string(worker_id),
        text,
        options: serde_json::from_str(&options)?,
        status: status.parse().map_err(StoreError::Internal)?,
        asked_at: parse_ts(&asked_at),
        answered_at: answered_at.map(|s| parse_ts(&s)),
        answer,
    })
}

type RawShare = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
);

fn share_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawShare> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn raw_to_share(raw: RawShare) -> Result<ShareRecord> {
    let (id, owner_id, recipient_id, paths, permissions, status, created_at, expires_at) = raw;
    Ok(ShareRecord {
        share_id: ShareId::from_string(id),
        owner_id,
        recipient_id,
        paths: serde_json::from_str(&paths)?,
        permissions: serde_json::from_str(&permissions)?,
        status: status.parse().map_err(StoreError::Internal)?,
        created_at: parse_ts(&created_at),
        expires_at: expires_at.map(|s| parse_ts(&s)),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionConfig, new_in_memory};
    use assert_matches::assert_matches;
    use serde_json::json;

    fn setup() -> Store {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        Store::open(pool).unwrap()
    }

    fn make_session(store: &Store) -> SessionRecord {
        store
            .create_session(&CreateSession {
                user_id: "user1",
                initial_prompt: "fix the flaky test",
                worker_context: json!({"repo": "hq"}),
            })
            .unwrap()
    }

    // ── Sessions ──────────────────────────────────────────────────────

    #[test]
    fn session_worker_binding() {
        let store = setup();
        let session = make_session(&store);
        assert!(session.worker_id.is_none());
        let worker = make_worker(&store);
        assert!(store.set_session_worker(&session.session_id, &worker).unwrap());
        let bound = store.session_for_worker(&worker).unwrap().unwrap();
        assert_eq!(bound.session_id, session.session_id);
        // Terminal sessions no longer resolve.
        store
            .update_session_status(&session.session_id, SessionStatus::Stopped, None)
            .unwrap();
        assert!(store.session_for_worker(&worker).unwrap().is_none());
    }

    #[test]
    fn create_session_defaults() {
        let store = setup();
        let session = make_session(&store);
        assert!(session.session_id.as_str().starts_with("sess_"));
        assert_eq!(session.status, SessionStatus::Starting);
        assert_eq!(session.startup_phase, StartupPhase::Provisioning);
        assert_eq!(session.message_count, 0);
        assert!(session.stopped_at.is_none());
        assert_eq!(session.worker_context["repo"], "hq");
    }

    #[test]
    fn status_transition_to_terminal_sets_stopped_at_once() {
        let store = setup();
        let session = make_session(&store);
        assert!(
            store
                .update_session_status(&session.session_id, SessionStatus::Errored, Some("Worker failed to start"))
                .unwrap()
        );
        let first = store.get_session(&session.session_id).unwrap().unwrap();
        assert_eq!(first.status, SessionStatus::Errored);
        assert_eq!(first.error.as_deref(), Some("Worker failed to start"));
        let stamped = first.stopped_at.unwrap();

        // A second terminal transition must not move the stamp.
        std::thread::sleep(Duration::from_millis(5));
        store
            .update_session_status(&session.session_id, SessionStatus::Stopped, None)
            .unwrap();
        let second = store.get_session(&session.session_id).unwrap().unwrap();
        assert_eq!(second.stopped_at.unwrap(), stamped);
    }

    #[test]
    fn last_activity_is_monotonic() {
        let store = setup();
        let session = make_session(&store);
        let future = Utc::now() + chrono::Duration::seconds(30);
        store
            .touch_session_activity(&session.session_id, future)
            .unwrap();
        // An older touch must not move the clock backwards.
        store
            .touch_session_activity(&session.session_id, future - chrono::Duration::seconds(20))
            .unwrap();
        let record = store.get_session(&session.session_id).unwrap().unwrap();
        assert_eq!(record.last_activity_at, future);
    }

    #[test]
    fn terminal_sessions_before_cutoff() {
        let store = setup();
        let session = make_session(&store);
        store
            .update_session_status(&session.session_id, SessionStatus::Stopped, None)
            .unwrap();
        let found = store
            .terminal_sessions_before(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(found, vec![session.session_id.clone()]);
        // Cutoff in the past excludes it.
        let found = store
            .terminal_sessions_before(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn delete_session_cascades_messages() {
        let store = setup();
        let session = make_session(&store);
        store
            .append_message(&session.session_id, MessageKind::User, "hello", json!({}))
            .unwrap();
        assert!(store.delete_session(&session.session_id).unwrap());
        assert!(store.get_session(&session.session_id).unwrap().is_none());
        let messages = store.messages_after(&session.session_id, 0).unwrap();
        assert!(messages.is_empty());
    }

    // ── Messages ──────────────────────────────────────────────────────

    #[test]
    fn sequences_are_dense_from_one() {
        let store = setup();
        let session = make_session(&store);
        for i in 1..=4 {
            let msg = store
                .append_message(
                    &session.session_id,
                    MessageKind::Assistant,
                    &format!("msg {i}"),
                    json!({}),
                )
                .unwrap();
            assert_eq!(msg.sequence, i);
        }
        let record = store.get_session(&session.session_id).unwrap().unwrap();
        assert_eq!(record.message_count, 4);
    }

    #[test]
    fn concurrent_appends_stay_dense() {
        let store = Arc::new(setup());
        let session = make_session(&store);
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            let session_id = session.session_id.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..5 {
                    store
                        .append_message(
                            &session_id,
                            MessageKind::ToolResult,
                            &format!("t{t} m{i}"),
                            json!({}),
                        )
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let messages = store.messages_after(&session.session_id, 0).unwrap();
        assert_eq!(messages.len(), 20);
        for (idx, msg) in messages.iter().enumerate() {
            assert_eq!(msg.sequence, idx as i64 + 1, "sequences must be dense");
        }
    }

    #[test]
    fn messages_after_filters_strictly() {
        let store = setup();
        let session = make_session(&store);
        for i in 1..=3 {
            store
                .append_message(
                    &session.session_id,
                    MessageKind::User,
                    &format!("m{i}"),
                    json!({}),
                )
                .unwrap();
        }
        let tail = store.messages_after(&session.session_id, 1).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 2);
        assert_eq!(tail[1].sequence, 3);
    }

    #[test]
    fn append_to_unknown_session_fails() {
        let store = setup();
        let missing = SessionId::from_string("sess_missing");
        assert_matches!(
            store.append_message(&missing, MessageKind::User, "x", json!({})),
            Err(StoreError::NotFound(_))
        );
    }

    // ── Workers & questions ───────────────────────────────────────────

    fn make_worker(store: &Store) -> WorkerId {
        let id = WorkerId::from_string("test-worker");
        store
            .create_worker(&id, "Test Worker", WorkerStatus::Running)
            .unwrap();
        id
    }

    #[test]
    fn worker_create_and_conflict() {
        let store = setup();
        let id = make_worker(&store);
        assert_matches!(
            store.create_worker(&id, "dup", WorkerStatus::Idle),
            Err(StoreError::Conflict(_))
        );
        let record = store.get_worker(&id).unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Running);
    }

    #[test]
    fn one_pending_question_per_worker() {
        let store = setup();
        let worker = make_worker(&store);
        store
            .insert_question(&worker, "What branch?", &[])
            .unwrap();
        assert_matches!(
            store.insert_question(&worker, "Another?", &[]),
            Err(StoreError::Conflict(_))
        );
    }

    #[test]
    fn question_answer_flow() {
        let store = setup();
        let worker = make_worker(&store);
        let question = store
            .insert_question(&worker, "What branch?", &[])
            .unwrap();
        assert_eq!(question.status, QuestionStatus::Pending);

        let answered = store.answer_question(&question.question_id, "main").unwrap();
        assert_eq!(answered.status, QuestionStatus::Answered);
        assert_eq!(answered.answer.as_deref(), Some("main"));
        assert!(answered.answered_at.is_some());

        // Answered tuples are immutable: a second answer conflicts.
        assert_matches!(
            store.answer_question(&question.question_id, "develop"),
            Err(StoreError::Conflict(_))
        );
        let unchanged = store.get_question(&question.question_id).unwrap().unwrap();
        assert_eq!(unchanged.answer.as_deref(), Some("main"));
    }

    #[test]
    fn answer_unknown_question_is_not_found() {
        let store = setup();
        assert_matches!(
            store.answer_question(&QuestionId::from_string("q_missing"), "x"),
            Err(StoreError::NotFound(_))
        );
    }

    #[test]
    fn answered_worker_can_ask_again() {
        let store = setup();
        let worker = make_worker(&store);
        let q1 = store.insert_question(&worker, "First?", &[]).unwrap();
        store.answer_question(&q1.question_id, "yes").unwrap();
        // Pending slot is free again.
        let q2 = store.insert_question(&worker, "Second?", &[]).unwrap();
        assert_ne!(q1.question_id, q2.question_id);

        let pending = store.pending_question_for_worker(&worker).unwrap().unwrap();
        assert_eq!(pending.question_id, q2.question_id);

        let all = store.list_questions(&worker, None).unwrap();
        assert_eq!(all.len(), 2);
        let answered = store
            .list_questions(&worker, Some(QuestionStatus::Answered))
            .unwrap();
        assert_eq!(answered.len(), 1);
    }

    #[test]
    fn question_options_round_trip() {
        let store = setup();
        let worker = make_worker(&store);
        let options = vec![
            QuestionOption {
                id: "opt-a".into(),
                text: "Option A".into(),
            },
            QuestionOption {
                id: "opt-b".into(),
                text: "Option B".into(),
            },
        ];
        let question = store.insert_question(&worker, "Pick", &options).unwrap();
        assert_eq!(question.options, options);
    }

    // ── API keys ──────────────────────────────────────────────────────

    #[test]
    fn api_key_round_trip_and_prefix_conflict() {
        let store = setup();
        let record = ApiKeyRecord {
            prefix: "ab12cd34".into(),
            hash: "0".repeat(64),
            name: "ci".into(),
            rate_limit: 120,
            created_at: Utc::now(),
        };
        store.insert_api_key(&record).unwrap();
        let loaded = store.get_api_key("ab12cd34").unwrap().unwrap();
        assert_eq!(loaded.hash, record.hash);
        assert_eq!(loaded.rate_limit, 120);
        assert_matches!(
            store.insert_api_key(&record),
            Err(StoreError::Conflict(_))
        );
        assert!(store.get_api_key("zzzzzzzz").unwrap().is_none());
    }

    // ── Shares ────────────────────────────────────────────────────────

    fn make_share(store: &Store) -> ShareRecord {
        store
            .create_share(
                "user1",
                "user2",
                &["user1/hq/".to_string()],
                &["read".to_string()],
                None,
            )
            .unwrap()
    }

    #[test]
    fn share_lifecycle() {
        let store = setup();
        let share = make_share(&store);
        assert_eq!(share.status, ShareStatus::Active);

        let revoked = store.revoke_share(&share.share_id).unwrap();
        assert_eq!(revoked.status, ShareStatus::Revoked);

        // Idempotent revoke returns the revoked record.
        let again = store.revoke_share(&share.share_id).unwrap();
        assert_eq!(again, revoked);
    }

    #[test]
    fn share_access_check_honors_prefix_and_status() {
        let store = setup();
        let share = make_share(&store);
        assert!(
            store
                .check_share_access("user2", "user1", "user1/hq/notes.txt")
                .unwrap()
        );
        assert!(
            !store
                .check_share_access("user2", "user1", "user1/private/secret.txt")
                .unwrap()
        );
        assert!(
            !store
                .check_share_access("user3", "user1", "user1/hq/notes.txt")
                .unwrap()
        );
        store.revoke_share(&share.share_id).unwrap();
        assert!(
            !store
                .check_share_access("user2", "user1", "user1/hq/notes.txt")
                .unwrap()
        );
    }

    #[test]
    fn expired_share_denies_access() {
        let store = setup();
        let share = store
            .create_share(
                "user1",
                "user2",
                &["user1/hq/".to_string()],
                &["read".to_string()],
                Some(Utc::now() - chrono::Duration::minutes(1)),
            )
            .unwrap();
        assert_eq!(share.status, ShareStatus::Active);
        assert!(
            !store
                .check_share_access("user2", "user1", "user1/hq/notes.txt")
                .unwrap()
        );
        assert!(store.shares_accessible_to("user2").unwrap().is_empty());
    }

    #[test]
    fn share_update_patches_fields() {
        let store = setup();
        let share = make_share(&store);
        let updated = store
            .update_share(
                &share.share_id,
                &UpdateShare {
                    paths: Some(vec!["user1/hq/".into(), "user1/docs/".into()]),
                    ..UpdateShare::default()
                },
            )
            .unwrap();
        assert_eq!(updated.paths.len(), 2);
        // Untouched fields survive.
        assert_eq!(updated.permissions, share.permissions);

        let filtered = store
            .list_shares(Some("user1"), None, Some(ShareStatus::Active))
            .unwrap();
        assert_eq!(filtered.len(), 1);
    }
}
