//! The question blocker: suspends a worker pending human input.
//!
//! A worker asking a question transitions to `waiting_input` and gets a
//! persisted [`PendingQuestion`]; at most one may be pending per worker.
//! Answers arrive from any of three paths — a browser `session_user_message`
//! while a question is pending, the answer API, or a transport-provider
//! callback — and all funnel through [`QuestionBlocker::provide_answer`].
//!
//! Waiting is expressed as a completion source:
//! [`QuestionBlocker::await_answer`] resolves when the matching answer
//! lands, rejects with "Answer timeout" after `answer_timeout` (leaving the
//! question pending for later inspection), and cancels with the session's
//! termination.

use hq_core::errors::HqError;
use hq_core::ids::{QuestionId, WorkerId};
use hq_core::session::{QuestionStatus, WorkerStatus};
use hq_store::{PendingQuestion, QuestionOption, Store, StoreError};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::metrics::{QUESTIONS_ANSWERED_TOTAL, QUESTIONS_PENDING};

/// Blocker failures.
#[derive(Debug, thiserror::Error)]
pub enum BlockerError {
    /// Input rejected (empty text, duplicate/unknown option ids).
    #[error("{0}")]
    Validation(String),

    /// Unknown worker or question.
    #[error("{0} not found")]
    NotFound(String),

    /// Second pending question, or answering an answered question.
    #[error("{0}")]
    Conflict(String),

    /// No answer arrived within the configured window.
    #[error("Answer timeout")]
    AnswerTimeout,

    /// The owning session terminated while waiting.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<BlockerError> for HqError {
    fn from(err: BlockerError) -> Self {
        match err {
            BlockerError::Validation(message) => Self::Validation {
                message,
                validation_errors: None,
            },
            BlockerError::NotFound(resource) => Self::NotFound { resource },
            BlockerError::Conflict(message) => Self::Conflict { message },
            BlockerError::AnswerTimeout => Self::Conflict {
                message: "Answer timeout".into(),
            },
            BlockerError::Cancelled(_) => Self::Cancelled,
            BlockerError::Store(store) => store.into(),
        }
    }
}

/// Result alias for blocker operations.
pub type Result<T> = std::result::Result<T, BlockerError>;

/// Suspends workers on questions and resumes them on answers.
pub struct QuestionBlocker {
    store: Arc<Store>,
    waiters: Mutex<HashMap<String, oneshot::Sender<PendingQuestion>>>,
    answered_tx: broadcast::Sender<PendingQuestion>,
}

impl QuestionBlocker {
    /// New blocker over the store.
    pub fn new(store: Arc<Store>) -> Self {
        let (answered_tx, _) = broadcast::channel(64);
        Self {
            store,
            waiters: Mutex::new(HashMap::new()),
            answered_tx,
        }
    }

    /// Subscribe to answered-question notifications.
    pub fn on_question_answered(&self) -> broadcast::Receiver<PendingQuestion> {
        self.answered_tx.subscribe()
    }

    /// Record a question for a worker and suspend it.
    ///
    /// Validates the text and options, persists the pending record, and
    /// moves the worker to `waiting_input`.
    #[instrument(skip(self, text, options), fields(worker_id = %worker_id))]
    pub fn ask(
        &self,
        worker_id: &WorkerId,
        text: &str,
        options: &[QuestionOption],
    ) -> Result<PendingQuestion> {
        if text.trim().is_empty() {
            return Err(BlockerError::Validation("Question text is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for option in options {
            if option.id.trim().is_empty() {
                return Err(BlockerError::Validation("Option ID is required".into()));
            }
            if !seen.insert(option.id.as_str()) {
                return Err(BlockerError::Validation(format!(
                    "Duplicate option ID: {}",
                    option.id
                )));
            }
        }

        let question = match self.store.insert_question(worker_id, text, options) {
            Ok(question) => question,
            Err(StoreError::NotFound(resource)) => return Err(BlockerError::NotFound(resource)),
            Err(StoreError::Conflict(message)) => return Err(BlockerError::Conflict(message)),
            Err(other) => return Err(other.into()),
        };
        let _ = self
            .store
            .update_worker_status(worker_id, WorkerStatus::WaitingInput)?;
        gauge!(QUESTIONS_PENDING).increment(1.0);
        debug!(question_id = %question.question_id, "question pending");
        Ok(question)
    }

    /// Wait for a question's answer.
    ///
    /// Resolves with the answered record; rejects with
    /// [`BlockerError::AnswerTimeout`] after `timeout` (the question stays
    /// pending for later inspection) or [`BlockerError::Cancelled`] when
    /// `cancel` fires (session termination).
    pub async fn await_answer(
        &self,
        question_id: &QuestionId,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<PendingQuestion> {
        // Already answered? Resolve immediately.
        let existing = self
            .store
            .get_question(question_id)?
            .ok_or_else(|| BlockerError::NotFound(format!("question {question_id}")))?;
        if existing.status == QuestionStatus::Answered {
            return Ok(existing);
        }

        let (tx, rx) = oneshot::channel();
        let _ = self
            .waiters
            .lock()
            .insert(question_id.as_str().to_string(), tx);

        let outcome = tokio::select! {
            answered = rx => answered.map_err(|_| BlockerError::Cancelled("waiter dropped".into())),
            () = tokio::time::sleep(timeout) => Err(BlockerError::AnswerTimeout),
            () = cancel.cancelled() => Err(BlockerError::Cancelled("session terminated".into())),
        };
        if outcome.is_err() {
            let _ = self.waiters.lock().remove(question_id.as_str());
        }
        outcome
    }

    /// Accept an answer for a pending question.
    ///
    /// Rejects unknown ids (`NotFound`), already-answered questions
    /// (`Conflict`), empty answers and answers outside the declared option
    /// ids (`Validation`). On success the record is immutable, the worker
    /// moves `resuming` → `running`, and subscribers are notified.
    #[instrument(skip(self, answer), fields(question_id = %question_id))]
    pub fn provide_answer(
        &self,
        question_id: &QuestionId,
        answer: &str,
    ) -> Result<PendingQuestion> {
        if answer.trim().is_empty() {
            return Err(BlockerError::Validation("Answer text is required".into()));
        }
        let question = self
            .store
            .get_question(question_id)?
            .ok_or_else(|| BlockerError::NotFound(format!("question {question_id}")))?;
        if question.status == QuestionStatus::Answered {
            return Err(BlockerError::Conflict(format!(
                "question {question_id} already answered"
            )));
        }
        if !question.options.is_empty()
            && !question.options.iter().any(|option| option.id == answer)
        {
            return Err(BlockerError::Validation(format!(
                "Answer must be one of the option IDs: {}",
                question
                    .options
                    .iter()
                    .map(|o| o.id.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let answered = match self.store.answer_question(question_id, answer) {
            Ok(answered) => answered,
            Err(StoreError::NotFound(resource)) => return Err(BlockerError::NotFound(resource)),
            Err(StoreError::Conflict(message)) => return Err(BlockerError::Conflict(message)),
            Err(other) => return Err(other.into()),
        };

        // Resume the worker: briefly `resuming`, then `running`.
        let _ = self
            .store
            .update_worker_status(&answered.worker_id, WorkerStatus::Resuming)?;
        let _ = self
            .store
            .update_worker_status(&answered.worker_id, WorkerStatus::Running)?;

        gauge!(QUESTIONS_PENDING).decrement(1.0);
        counter!(QUESTIONS_ANSWERED_TOTAL).increment(1);

        if let Some(waiter) = self.waiters.lock().remove(question_id.as_str()) {
            let _ = waiter.send(answered.clone());
        }
        let _ = self.answered_tx.send(answered.clone());
        debug!(question_id = %question_id, "question answered");
        Ok(answered)
    }

    /// The worker's pending question, if any.
    pub fn pending_for_worker(&self, worker_id: &WorkerId) -> Result<Option<PendingQuestion>> {
        Ok(self.store.pending_question_for_worker(worker_id)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
