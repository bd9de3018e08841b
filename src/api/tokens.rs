//! Token management endpoints.
//!
//! ```text
//! GET  /api/tokens?action=health             per-token health + summary counts
//! GET  /api/tokens?action=rotation-status    credentials due for rotation
//! GET  /api/tokens?action=encryption-status  crypto engine report
//! POST /api/tokens {"action": "rotate" | "revoke" | "store" | "validate", ...}
//! ```
//!
//! Every request needs `Authorization: Bearer <token>`; the token resolves to
//! a caller and only that caller's credentials are visible.

use crate::auth::{Caller, CallerRegistry};
use crate::credentials::{
    CredentialError, CredentialLifecycleManager, CredentialRecord, StoreTokenRequest,
};
use crate::crypto::CryptoEngine;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, warn};


/// Shared state for the token API
#[derive(Clone)]
pub struct TokenAppState {
    pub manager: Arc<CredentialLifecycleManager>,
    pub crypto: Arc<CryptoEngine>,
    pub callers: Arc<CallerRegistry>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    ServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: error_message })).into_response()
    }
}

impl From<CredentialError> for AppError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::NotFound(_) => AppError::NotFound("Account not found".to_string()),
            CredentialError::InvalidInput(msg) => AppError::BadRequest(msg),
            CredentialError::Conflict(_) => {
                AppError::Conflict("Account was modified concurrently; retry".to_string())
            }
            // Crypto, storage and timeout details stay in the server log
            other => {
                error!(error = %other, "Token operation failed");
                AppError::ServerError("Internal server error".to_string())
            }
        }
    }
}

/// GET query parameters
#[derive(Deserialize)]
struct ActionQuery {
    action: Option<String>,
}

/// POST body. Which fields are required depends on `action`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenActionRequest {
    action: String,
    account_id: Option<String>,
    platform: Option<String>,
    username: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    scopes: Vec<String>,
    reason: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenHealthEntry {
    account_id: String,
    platform: String,
    username: String,
    status: String,
    #[serde(flatten)]
    health: crate::credentials::TokenHealth,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct HealthSummary {
    total: usize,
    healthy: usize,
    expired: usize,
    needs_rotation: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RotationCandidate {
    account_id: String,
    platform: String,
    username: String,
    expires_at: DateTime<Utc>,
    days_until_expiry: i64,
}

/// Create token API router
pub fn create_token_router(state: TokenAppState) -> Router {
    Router::new()
        .route("/api/tokens", get(get_tokens).post(post_tokens))
        .with_state(Arc::new(state))
}

/// GET /api/tokens?action=...
async fn get_tokens(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
    Query(query): Query<ActionQuery>,
) -> Result<Response, AppError> {
    let caller = authenticate(&state, &headers)?;

    match query.action.as_deref() {
        Some("health") => token_health(&state, &caller).await,
        Some("rotation-status") => rotation_status(&state, &caller).await,
        Some("encryption-status") => Ok(Json(state.crypto.health_status()).into_response()),
        Some(other) => Err(AppError::BadRequest(format!("Unknown action '{}'", other))),
        None => Err(AppError::BadRequest("Missing 'action' query parameter".to_string())),
    }
}

/// POST /api/tokens
async fn post_tokens(
    State(state): State<Arc<TokenAppState>>,
    headers: HeaderMap,
    body: Result<Json<TokenActionRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let caller = authenticate(&state, &headers)?;
    let Json(request) = body.map_err(|e| AppError::BadRequest(e.body_text()))?;

    match request.action.as_str() {
        "rotate" => rotate(&state, &caller, request).await,
        "revoke" => revoke(&state, &caller, request).await,
        "store" => store(&state, &caller, request).await,
        "validate" => validate(&state, &caller, request).await,
        other => Err(AppError::BadRequest(format!("Unknown action '{}'", other))),
    }
}

fn authenticate(state: &TokenAppState, headers: &HeaderMap) -> Result<Caller, AppError> {
    state.callers.authenticate(headers).map_err(|e| {
        debug!(error = %e, "Rejected token API request");
        AppError::Unauthorized(e.to_string())
    })
}

fn owns(caller: &Caller, record: &CredentialRecord) -> bool {
    record.owner_user_id == caller.user_id
        && match &caller.organization_id {
            Some(org) => record.organization_id.as_deref() == Some(org.as_str()),
            None => true,
        }
}

/// Resolves `accountId` to a record the caller owns. Other callers' records
/// are indistinguishable from missing ones.
async fn owned_account(
    state: &TokenAppState,
    caller: &Caller,
    request: &TokenActionRequest,
) -> Result<String, AppError> {
    let account_id = request
        .account_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("accountId is required".to_string()))?;

    match state.manager.find_record(account_id).await? {
        Some(record) if owns(caller, &record) => Ok(record.id),
        Some(_) => {
            warn!(account_id = %account_id, user_id = %caller.user_id, "Caller does not own account");
            Err(AppError::NotFound("Account not found".to_string()))
        }
        None => Err(AppError::NotFound("Account not found".to_string())),
    }
}

async fn token_health(state: &TokenAppState, caller: &Caller) -> Result<Response, AppError> {
    let now = Utc::now();
    let credentials = state
        .manager
        .list_owner_tokens(&caller.user_id, caller.organization_id.as_deref())
        .await?;

    let mut summary = HealthSummary::default();
    let tokens: Vec<TokenHealthEntry> = credentials
        .into_iter()
        .map(|credential| {
            let health = state.manager.health_of(&credential, now);
            summary.total += 1;
            if health.is_valid && !health.needs_rotation {
                summary.healthy += 1;
            }
            if health.is_expired {
                summary.expired += 1;
            }
            if health.needs_rotation {
                summary.needs_rotation += 1;
            }
            TokenHealthEntry {
                account_id: credential.id,
                platform: credential.platform,
                username: credential.external_username,
                status: credential.status.to_string(),
                health,
            }
        })
        .collect();

    Ok(Json(json!({ "tokens": tokens, "summary": summary })).into_response())
}

async fn rotation_status(state: &TokenAppState, caller: &Caller) -> Result<Response, AppError> {
    let now = Utc::now();
    let due = state
        .manager
        .list_tokens_needing_rotation(&caller.user_id, caller.organization_id.as_deref())
        .await?;

    let tokens: Vec<RotationCandidate> = due
        .into_iter()
        .map(|credential| RotationCandidate {
            days_until_expiry: state.manager.health_of(&credential, now).days_until_expiry,
            expires_at: credential.metadata.expires_at,
            account_id: credential.id,
            platform: credential.platform,
            username: credential.external_username,
        })
        .collect();

    Ok(Json(json!({
        "count": tokens.len(),
        "tokens": tokens,
        "autoRotateEnabled": state.manager.policy().auto_rotate_enabled,
    }))
    .into_response())
}

async fn rotate(
    state: &TokenAppState,
    caller: &Caller,
    request: TokenActionRequest,
) -> Result<Response, AppError> {
    let account_id = owned_account(state, caller, &request).await?;
    let result = state.manager.rotate_token(&account_id).await?;

    let status = if result.success {
        StatusCode::OK
    } else if result.requires_reauth {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Ok((status, Json(result)).into_response())
}

async fn revoke(
    state: &TokenAppState,
    caller: &Caller,
    request: TokenActionRequest,
) -> Result<Response, AppError> {
    let account_id = owned_account(state, caller, &request).await?;
    let revoked = state
        .manager
        .revoke_token(&account_id, request.reason.as_deref())
        .await?;

    Ok(Json(json!({ "success": revoked, "accountId": account_id })).into_response())
}

async fn store(
    state: &TokenAppState,
    caller: &Caller,
    request: TokenActionRequest,
) -> Result<Response, AppError> {
    let platform = required(request.platform, "platform")?;
    let username = required(request.username, "username")?;
    let access_token = required(request.access_token, "accessToken")?;

    let account_id = state
        .manager
        .store_token(StoreTokenRequest {
            owner_user_id: caller.user_id.clone(),
            organization_id: caller.organization_id.clone(),
            platform,
            username,
            access_token,
            refresh_token: request.refresh_token,
            expires_in_seconds: request.expires_in,
            scopes: request.scopes,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "accountId": account_id })),
    )
        .into_response())
}

async fn validate(
    state: &TokenAppState,
    caller: &Caller,
    request: TokenActionRequest,
) -> Result<Response, AppError> {
    let account_id = owned_account(state, caller, &request).await?;
    let health = state.manager.validate_token_health(&account_id).await?;
    Ok(Json(health).into_response())
}

fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("{} is required", field)))
}
