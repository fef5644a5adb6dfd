//! API-key middleware for the protected HTTP surface.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hq_core::errors::HqError;

use crate::error::ApiError;
use crate::services::AppState;

/// The verified key's prefix, inserted into request extensions.
#[derive(Clone, Debug)]
pub struct AuthenticatedKey(pub String);

/// Require a valid, un-rate-limited API key.
///
/// Accepts the key in `x-api-key` or as an `Authorization: Bearer` value.
/// Skipped entirely when `SKIP_AUTH` is configured (test environments).
pub async fn require_api_key(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if state.services.settings.server.skip_auth {
        return next.run(request).await;
    }

    let presented = extract_key(&request);
    let Some(presented) = presented else {
        return ApiError(HqError::Unauthorized).into_response();
    };

    let record = match state.services.api_keys.verify(&presented) {
        Ok(record) => record,
        Err(err) => return ApiError(err).into_response(),
    };
    if let Err(err) = state.services.api_keys.check_rate(&record) {
        return ApiError(err).into_response();
    }

    let _ = request
        .extensions_mut()
        .insert(AuthenticatedKey(record.prefix));
    next.run(request).await
}

fn extract_key(request: &Request<Body>) -> Option<String> {
    let headers = request.headers();
    if let Some(value) = headers.get("x-api-key") {
        return value.to_str().ok().map(str::to_string);
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}
