//! API-key issuance (the one unauthenticated mutation).

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use hq_store::records::format_ts;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::ApiResult;
use crate::services::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct GenerateKeyRequest {
    name: String,
}

/// `POST /api/auth/keys/generate`
pub async fn generate_key(
    State(state): State<AppState>,
    Json(request): Json<GenerateKeyRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let generated = state.services.api_keys.generate(&request.name)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "key": generated.key,
            "prefix": generated.record.prefix,
            "name": generated.record.name,
            "rateLimit": generated.record.rate_limit,
            "createdAt": format_ts(generated.record.created_at),
            "message": "Store this key securely; it will not be shown again.",
        })),
    ))
}
