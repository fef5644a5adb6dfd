//! HTTP error responses.
//!
//! Every handler error funnels through [`ApiError`], which renders the
//! taxonomy's status code with the documented JSON body shape.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hq_core::errors::HqError;
use serde_json::json;

/// Wrapper turning [`HqError`] into an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub HqError);

/// Result alias for HTTP handlers.
pub type ApiResult<T> = Result<T, ApiError>;

impl From<HqError> for ApiError {
    fn from(err: HqError) -> Self {
        Self(err)
    }
}

impl From<hq_store::StoreError> for ApiError {
    fn from(err: hq_store::StoreError) -> Self {
        Self(err.into())
    }
}

impl From<hq_fleet::FleetError> for ApiError {
    fn from(err: hq_fleet::FleetError) -> Self {
        Self(err.into())
    }
}

impl From<crate::blocker::BlockerError> for ApiError {
    fn from(err: crate::blocker::BlockerError) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self.0 {
            HqError::Validation {
                message,
                validation_errors,
            } => {
                let mut body = json!({"error": "Bad Request", "message": message});
                if let Some(errors) = validation_errors {
                    body["validationErrors"] = json!(errors);
                }
                body
            }
            HqError::Protocol { message } => {
                json!({"error": "Bad Request", "message": message})
            }
            HqError::Unauthorized => json!({"error": "Unauthorized"}),
            HqError::Forbidden { message } => json!({"error": "Forbidden", "message": message}),
            HqError::NotFound { resource } => {
                json!({"error": "Not Found", "message": format!("{resource} not found")})
            }
            HqError::Conflict { message } => json!({"error": "Conflict", "message": message}),
            HqError::RateLimit { retry_after_ms } => {
                json!({"error": "Too Many Requests", "retryAfterMs": retry_after_ms})
            }
            HqError::Transport { .. } | HqError::Internal { .. } | HqError::Cancelled => {
                tracing::error!(error = %self.0, "internal error serving request");
                json!({"error": "Internal Server Error"})
            }
        };
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body_of(err: HqError) -> (StatusCode, serde_json::Value) {
        let response = ApiError(err).into_response();
        let status = response.status();
        // Extract body synchronously for assertions.
        let bytes = futures::executor::block_on(async {
            axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap()
        });
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn validation_renders_400_with_message() {
        let (status, body) = body_of(HqError::Validation {
            message: "Duplicate option ID: a".into(),
            validation_errors: Some(vec!["options[1].id".into()]),
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Bad Request");
        assert!(body["message"].as_str().unwrap().contains("Duplicate option ID"));
        assert_eq!(body["validationErrors"][0], "options[1].id");
    }

    #[test]
    fn unauthorized_renders_bare_body() {
        let (status, body) = body_of(HqError::Unauthorized);
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"error": "Unauthorized"}));
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let (status, body) = body_of(HqError::RateLimit {
            retry_after_ms: 750,
        });
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "Too Many Requests");
        assert_eq!(body["retryAfterMs"], 750);
    }

    #[test]
    fn internal_hides_detail() {
        let (status, body) = body_of(HqError::internal("connection pool exploded"));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"error": "Internal Server Error"}));
    }

    #[test]
    fn not_found_and_conflict() {
        let (status, body) = body_of(HqError::not_found("worker wrk_9"));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not Found");

        let (status, body) = body_of(HqError::conflict("question already answered"));
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "Conflict");
    }
}
