//! Health, metrics, and setup status.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::error::ApiResult;
use crate::services::AppState;

/// `GET /healthz`
pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.services.started_at.elapsed().as_secs(),
    }))
}

/// `GET /metrics` (Prometheus text format)
pub async fn render_metrics(State(state): State<AppState>) -> String {
    state.services.metrics_handle.render()
}

/// `GET /api/auth/setup-status`
pub async fn setup_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let prefix = state.services.settings.storage.prefix.clone();
    let file_count = match &state.services.sync {
        Some(sync) => sync.tracked_files().await,
        None => 0,
    };
    Ok(Json(json!({
        "setupComplete": !prefix.is_empty(),
        "s3Prefix": if prefix.is_empty() { Value::Null } else { Value::String(prefix) },
        "fileCount": file_count,
    })))
}
