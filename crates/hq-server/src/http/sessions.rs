//! Session endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use hq_core::errors::HqError;
use hq_core::ids::SessionId;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::services::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateSessionRequest {
    prompt: String,
    #[serde(default)]
    worker_context: Option<Value>,
}

/// `POST /api/sessions`
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (record, access_token) = state
        .services
        .sessions
        .create_session(
            "default",
            &request.prompt,
            request.worker_context.unwrap_or_else(|| json!({})),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "sessionId": record.session_id,
            "accessToken": access_token,
            "status": record.status,
        })),
    ))
}

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sessions = state.services.store.list_sessions()?;
    Ok(Json(json!({
        "count": sessions.len(),
        "sessions": sessions,
    })))
}

/// `GET /api/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session_id = SessionId::from_string(id);
    let record = state
        .services
        .store
        .get_session(&session_id)?
        .ok_or_else(|| ApiError(HqError::not_found(format!("session {session_id}"))))?;
    Ok(Json(json!({ "session": record })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesQuery {
    #[serde(default)]
    after: i64,
}

/// `GET /api/sessions/{id}/messages?after=<seq>`
pub async fn list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let session_id = SessionId::from_string(id);
    if state.services.store.get_session(&session_id)?.is_none() {
        return Err(ApiError(HqError::not_found(format!(
            "session {session_id}"
        ))));
    }
    let messages = state.services.store.messages_after(&session_id, query.after)?;
    Ok(Json(json!({
        "count": messages.len(),
        "messages": messages,
    })))
}

/// `POST /api/sessions/{id}/stop`
pub async fn stop_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session_id = SessionId::from_string(id);
    let record = state.services.sessions.stop_session(&session_id).await?;
    Ok(Json(json!({ "session": record })))
}
