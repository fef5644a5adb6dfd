//! Worker catalogue and question endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use hq_core::errors::HqError;
use hq_core::ids::{QuestionId, WorkerId};
use hq_core::session::{QuestionStatus, WorkerStatus};
use hq_protocol::browser::BrowserOutEvent;
use hq_protocol::envelope::Envelope;
use hq_store::QuestionOption;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::services::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct CreateWorkerRequest {
    id: String,
    name: String,
    #[serde(default)]
    status: Option<WorkerStatus>,
}

/// `POST /api/workers`
pub async fn create_worker(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkerRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.id.trim().is_empty() {
        return Err(ApiError(HqError::validation("Worker id is required")));
    }
    if request.name.trim().is_empty() {
        return Err(ApiError(HqError::validation("Worker name is required")));
    }
    let worker_id = WorkerId::from_string(request.id.trim());
    let record = state.services.store.create_worker(
        &worker_id,
        request.name.trim(),
        request.status.unwrap_or(WorkerStatus::Idle),
    )?;
    state.services.registry.broadcast_all(&Arc::new(
        Envelope::now(BrowserOutEvent::AgentCreated(json!({ "worker": record }))).encode(),
    ));
    Ok((StatusCode::CREATED, Json(json!({ "worker": record }))))
}

/// `GET /api/workers/{id}`
pub async fn get_worker(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let worker_id = WorkerId::from_string(id);
    let record = state
        .services
        .store
        .get_worker(&worker_id)?
        .ok_or_else(|| ApiError(HqError::not_found(format!("worker {worker_id}"))))?;
    Ok(Json(json!({ "worker": record })))
}

/// `GET /api/workers`
pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let workers = state.services.store.list_workers()?;
    Ok(Json(json!({
        "count": workers.len(),
        "workers": workers,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateQuestionRequest {
    text: String,
    #[serde(default)]
    options: Vec<QuestionOption>,
}

/// `POST /api/workers/{id}/questions`
pub async fn create_question(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<CreateQuestionRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let worker_id = WorkerId::from_string(id);
    let question = state
        .services
        .blocker
        .ask(&worker_id, &request.text, &request.options)?;
    Ok((StatusCode::CREATED, Json(json!({ "question": question }))))
}

#[derive(Debug, Deserialize)]
pub(crate) struct AnswerRequest {
    answer: String,
}

/// `POST /api/workers/{id}/questions/{qid}/answer`
pub async fn answer_question(
    State(state): State<AppState>,
    Path((id, qid)): Path<(String, String)>,
    Json(request): Json<AnswerRequest>,
) -> ApiResult<Json<Value>> {
    let worker_id = WorkerId::from_string(id);
    let question_id = QuestionId::from_string(qid);
    // The question must belong to the addressed worker.
    let question = state
        .services
        .store
        .get_question(&question_id)?
        .ok_or_else(|| ApiError(HqError::not_found(format!("question {question_id}"))))?;
    if question.worker_id != worker_id {
        return Err(ApiError(HqError::not_found(format!(
            "question {question_id}"
        ))));
    }
    let answered = state
        .services
        .blocker
        .provide_answer(&question_id, &request.answer)?;
    // The worker's status changed (waiting_input → running); notify
    // catalogue watchers.
    if let Some(worker) = state.services.store.get_worker(&worker_id)? {
        state.services.registry.broadcast_all(&Arc::new(
            Envelope::now(BrowserOutEvent::AgentUpdated(json!({ "worker": worker }))).encode(),
        ));
    }
    Ok(Json(json!({ "question": answered })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct QuestionsQuery {
    #[serde(default)]
    status: Option<String>,
}

/// `GET /api/workers/{id}/questions?status=pending|answered`
pub async fn list_questions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<QuestionsQuery>,
) -> ApiResult<Json<Value>> {
    let worker_id = WorkerId::from_string(id);
    if state.services.store.get_worker(&worker_id)?.is_none() {
        return Err(ApiError(HqError::not_found(format!("worker {worker_id}"))));
    }
    let status = match query.status.as_deref() {
        None => None,
        Some(text) => Some(text.parse::<QuestionStatus>().map_err(|_| {
            ApiError(HqError::validation(format!(
                "status must be 'pending' or 'answered', got '{text}'"
            )))
        })?),
    };
    let questions = state.services.store.list_questions(&worker_id, status)?;
    Ok(Json(json!({
        "count": questions.len(),
        "questions": questions,
    })))
}
