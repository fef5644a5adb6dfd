//! Share endpoints.
//!
//! Shares gate object-store access, not relay access: the relay never
//! consults them. The policy endpoint renders the document enforcement
//! systems consume.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use hq_core::errors::HqError;
use hq_core::ids::ShareId;
use hq_core::session::ShareStatus;
use hq_store::ShareRecord;
use hq_store::store::UpdateShare;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::services::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateShareRequest {
    owner_id: String,
    recipient_id: String,
    paths: Vec<String>,
    #[serde(default)]
    permissions: Option<Vec<String>>,
    #[serde(default)]
    expires_at: Option<String>,
}

fn parse_expiry(text: Option<&str>) -> ApiResult<Option<DateTime<Utc>>> {
    match text {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| {
                ApiError(HqError::validation(format!(
                    "expiresAt must be an RFC 3339 timestamp, got '{raw}'"
                )))
            }),
    }
}

fn validate_permissions(permissions: &[String]) -> ApiResult<()> {
    for permission in permissions {
        if permission != "read" {
            return Err(ApiError(HqError::validation(format!(
                "unsupported permission '{permission}'; only 'read' is supported"
            ))));
        }
    }
    Ok(())
}

/// `POST /api/shares`
pub async fn create_share(
    State(state): State<AppState>,
    Json(request): Json<CreateShareRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.owner_id.trim().is_empty() || request.recipient_id.trim().is_empty() {
        return Err(ApiError(HqError::validation(
            "ownerId and recipientId are required",
        )));
    }
    if request.paths.is_empty() || request.paths.iter().any(|p| p.trim().is_empty()) {
        return Err(ApiError(HqError::validation(
            "paths must be a non-empty list of prefixes",
        )));
    }
    let permissions = request.permissions.unwrap_or_else(|| vec!["read".into()]);
    validate_permissions(&permissions)?;
    let expires_at = parse_expiry(request.expires_at.as_deref())?;

    let record = state.services.store.create_share(
        request.owner_id.trim(),
        request.recipient_id.trim(),
        &request.paths,
        &permissions,
        expires_at,
    )?;
    Ok((StatusCode::CREATED, Json(json!({ "share": record }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ListSharesQuery {
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    recipient_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

/// `GET /api/shares[?ownerId=&recipientId=&status=]`
pub async fn list_shares(
    State(state): State<AppState>,
    Query(query): Query<ListSharesQuery>,
) -> ApiResult<Json<Value>> {
    let status = match query.status.as_deref() {
        None => None,
        Some(text) => Some(text.parse::<ShareStatus>().map_err(|_| {
            ApiError(HqError::validation(format!("unknown share status '{text}'")))
        })?),
    };
    let shares = state.services.store.list_shares(
        query.owner_id.as_deref(),
        query.recipient_id.as_deref(),
        status,
    )?;
    Ok(Json(json!({
        "count": shares.len(),
        "shares": shares,
    })))
}

fn load_share(state: &AppState, id: String) -> ApiResult<ShareRecord> {
    let share_id = ShareId::from_string(id);
    state
        .services
        .store
        .get_share(&share_id)?
        .ok_or_else(|| ApiError(HqError::not_found(format!("share {share_id}"))))
}

/// `GET /api/shares/{id}`
pub async fn get_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = load_share(&state, id)?;
    Ok(Json(json!({ "share": record })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UpdateShareRequest {
    #[serde(default)]
    paths: Option<Vec<String>>,
    #[serde(default)]
    permissions: Option<Vec<String>>,
    #[serde(default, with = "double_option")]
    expires_at: Option<Option<String>>,
}

/// Distinguishes an absent `expiresAt` (leave unchanged) from an explicit
/// `null` (clear it).
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

/// `PATCH /api/shares/{id}`
pub async fn update_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateShareRequest>,
) -> ApiResult<Json<Value>> {
    if let Some(paths) = &request.paths {
        if paths.is_empty() || paths.iter().any(|p| p.trim().is_empty()) {
            return Err(ApiError(HqError::validation(
                "paths must be a non-empty list of prefixes",
            )));
        }
    }
    if let Some(permissions) = &request.permissions {
        validate_permissions(permissions)?;
    }
    let expires_at = match &request.expires_at {
        None => None,
        Some(inner) => Some(parse_expiry(inner.as_deref())?),
    };
    let share_id = ShareId::from_string(id);
    let record = state.services.store.update_share(
        &share_id,
        &UpdateShare {
            paths: request.paths,
            permissions: request.permissions,
            expires_at,
        },
    )?;
    Ok(Json(json!({ "share": record })))
}

/// `POST /api/shares/{id}/revoke` — idempotent.
pub async fn revoke_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let share_id = ShareId::from_string(id);
    let record = state.services.store.revoke_share(&share_id)?;
    Ok(Json(json!({ "share": record })))
}

/// `DELETE /api/shares/{id}`
pub async fn delete_share(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let share_id = ShareId::from_string(id);
    if !state.services.store.delete_share(&share_id)? {
        return Err(ApiError(HqError::not_found(format!("share {share_id}"))));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CheckAccessQuery {
    recipient_id: String,
    owner_id: String,
    path: String,
}

/// `GET /api/shares/access/check?recipientId&ownerId&path`
pub async fn check_access(
    State(state): State<AppState>,
    Query(query): Query<CheckAccessQuery>,
) -> ApiResult<Json<Value>> {
    let has_access = state.services.store.check_share_access(
        &query.recipient_id,
        &query.owner_id,
        &query.path,
    )?;
    Ok(Json(json!({ "hasAccess": has_access })))
}

/// `GET /api/shares/accessible/{userId}`
pub async fn accessible(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let shares = state.services.store.shares_accessible_to(&user_id)?;
    Ok(Json(json!({
        "count": shares.len(),
        "shares": shares,
    })))
}

/// `GET /api/shares/{id}/policy`
///
/// Renders a read-only prefix policy document for the share's paths.
pub async fn share_policy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let record = load_share(&state, id)?;
    let bucket = &state.services.settings.storage.bucket;
    let resources: Vec<String> = record
        .paths
        .iter()
        .map(|prefix| format!("arn:aws:s3:::{bucket}/{}*", prefix.trim_start_matches('/')))
        .collect();
    Ok(Json(json!({
        "shareId": record.share_id,
        "status": record.effective_status(Utc::now()),
        "policy": {
            "Version": "2012-10-17",
            "Statement": [{
                "Sid": "SharedPrefixRead",
                "Effect": "Allow",
                "Action": ["s3:GetObject"],
                "Resource": resources,
            }],
        },
    })))
}
