//! Admin API: pricing tables, channels, users, tokens and audit logs.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::routes::AppState;
use crate::account::{ApiToken, Channel, NewChannel, NewToken, NewUser, Status, User};
use crate::billing::ledger::{self, LedgerError, LogRecord};
use crate::billing::PricingTable;

const USERNAME_PATTERN: &str = r"^[A-Za-z0-9_.-]{1,64}$";
const DEFAULT_LOG_LIMIT: i64 = 100;
const MAX_LOG_LIMIT: i64 = 1000;

// ─────────────────────────────────────────────────────────────────────────────
// Request/Response Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChannelStatusRequest {
    pub status: Status,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct TopUpResponse {
    pub user_id: i64,
    pub quota: i64,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub user_id: Option<i64>,
    pub limit: Option<i64>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn internal(e: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

/// Constraint violations (duplicate names, unknown owners) are the caller's fault.
fn storage_error(e: rusqlite::Error) -> (StatusCode, String) {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            (StatusCode::CONFLICT, e.to_string())
        }
        _ => internal(e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pricing
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/admin/pricing
pub async fn get_pricing(State(state): State<Arc<AppState>>) -> ApiResult<PricingTable> {
    Ok(Json(state.pricing.snapshot().await))
}

/// PUT /api/admin/pricing - replace all tables at once.
pub async fn put_pricing(
    State(state): State<Arc<AppState>>,
    Json(table): Json<PricingTable>,
) -> ApiResult<PricingTable> {
    let invalid = table
        .model_price
        .iter()
        .chain(table.model_ratio.iter())
        .chain(table.group_ratio.iter())
        .find(|(_, v)| !v.is_finite() || **v < 0.0);
    if let Some((key, value)) = invalid {
        return Err(bad_request(format!("Invalid price for {}: {}", key, value)));
    }

    state
        .pricing
        .replace(table)
        .await
        .map_err(|e| internal(format!("Failed to save pricing: {}", e)))?;
    Ok(Json(state.pricing.snapshot().await))
}

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/admin/channels
pub async fn create_channel(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewChannel>,
) -> ApiResult<Channel> {
    if req.name.trim().is_empty() {
        return Err(bad_request("Channel name is required"));
    }
    match url::Url::parse(&req.base_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => return Err(bad_request(format!("Invalid base_url: {}", req.base_url))),
    }
    if req.api_key.trim().is_empty() {
        return Err(bad_request("api_key is required"));
    }
    if let Some(mapping) = &req.model_mapping {
        let raw = match mapping {
            serde_json::Value::String(raw) => raw.clone(),
            other => other.to_string(),
        };
        crate::billing::parse_mapping_table(&raw).map_err(|e| bad_request(e.to_string()))?;
    }

    let channel = state.channels.create(&req).map_err(storage_error)?;
    Ok(Json(channel))
}

/// POST /api/admin/channels/:id/status
pub async fn set_channel_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<ChannelStatusRequest>,
) -> ApiResult<Channel> {
    if !state.channels.set_status(id, req.status).map_err(internal)? {
        return Err((StatusCode::NOT_FOUND, format!("Channel {} not found", id)));
    }
    let channel = state
        .channels
        .get(id)
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Channel {} not found", id)))?;
    Ok(Json(channel))
}

// ─────────────────────────────────────────────────────────────────────────────
// Users and tokens
// ─────────────────────────────────────────────────────────────────────────────

/// POST /api/admin/users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewUser>,
) -> ApiResult<User> {
    let pattern = Regex::new(USERNAME_PATTERN).map_err(internal)?;
    if !pattern.is_match(&req.username) {
        return Err(bad_request(
            "Username must be 1-64 characters of letters, digits, '_', '.' or '-'",
        ));
    }
    if req.quota < 0 {
        return Err(bad_request("Initial quota cannot be negative"));
    }
    let user = state.accounts.create_user(&req).map_err(storage_error)?;
    Ok(Json(user))
}

/// POST /api/admin/users/:id/topup
pub async fn top_up_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<TopUpRequest>,
) -> ApiResult<TopUpResponse> {
    if req.amount <= 0 {
        return Err(bad_request("amount must be positive"));
    }
    let conn = state.db.lock();
    let quota = ledger::top_up(&conn, id, req.amount).map_err(|e| match e {
        LedgerError::UserNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        other => internal(other),
    })?;
    tracing::info!("Topped up user {} by {} (balance {})", id, req.amount, quota);
    Ok(Json(TopUpResponse { user_id: id, quota }))
}

/// POST /api/admin/tokens
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewToken>,
) -> ApiResult<ApiToken> {
    if state.accounts.get_user(req.user_id).map_err(internal)?.is_none() {
        return Err((StatusCode::NOT_FOUND, format!("User {} not found", req.user_id)));
    }
    let token = state.accounts.create_token(&req).map_err(storage_error)?;
    tracing::info!("Issued token {} for user {}", token.id, token.user_id);
    Ok(Json(token))
}

// ─────────────────────────────────────────────────────────────────────────────
// Audit logs
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/admin/logs?user_id=&limit=
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Vec<LogRecord>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let conn = state.db.lock();
    let logs = ledger::list_logs(&conn, query.user_id, limit).map_err(internal)?;
    Ok(Json(logs))
}
