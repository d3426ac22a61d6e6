//! Authentication for the two route families.
//!
//! - Relay routes take an API token (`Authorization: Bearer sk-...`) issued
//!   through the admin API; the resolved user and token ride along as a
//!   [`Caller`] request extension.
//! - Admin routes take a JWT obtained from `/api/auth/login` with
//!   `ADMIN_PASSWORD`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::routes::AppState;
use crate::config::AdminAuth;
use crate::error::GatewayError;
use crate::relay::Caller;

const ADMIN_SUBJECT: &str = "admin";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    /// Issued-at unix seconds
    iat: i64,
    /// Expiration unix seconds
    exp: i64,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub exp: i64,
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a_bytes = a.as_bytes();
    let b_bytes = b.as_bytes();
    if a_bytes.len() != b_bytes.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a_bytes.len() {
        diff |= a_bytes[i] ^ b_bytes[i];
    }
    diff == 0
}

fn issue_jwt(secret: &str, ttl_days: i64) -> anyhow::Result<(String, i64)> {
    let now = Utc::now();
    let exp = now + Duration::days(ttl_days.max(1));
    let claims = Claims {
        sub: ADMIN_SUBJECT.to_string(),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };
    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok((token, claims.exp))
}

fn verify_jwt(token: &str, secret: &str) -> anyhow::Result<Claims> {
    let token_data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

fn bearer(req: &Request<Body>) -> &str {
    let header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .unwrap_or("")
        .trim()
}

fn admin_config(state: &AppState) -> Result<&AdminAuth, (StatusCode, String)> {
    state.config.admin.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Admin routes are disabled (ADMIN_PASSWORD not set)".to_string(),
        )
    })
}

/// POST /api/auth/login - exchange the admin password for a JWT.
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    let admin = admin_config(&state)?;
    if !constant_time_eq(req.password.trim(), admin.password.trim()) {
        tracing::warn!("Rejected admin login attempt");
        return Err((StatusCode::UNAUTHORIZED, "Invalid password".to_string()));
    }

    let (token, exp) = issue_jwt(&admin.jwt_secret, admin.jwt_ttl_days)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(LoginResponse { token, exp }))
}

pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let admin = match admin_config(&state) {
        Ok(admin) => admin,
        Err(rejection) => return rejection.into_response(),
    };

    let token = bearer(&req);
    if token.is_empty() {
        return (StatusCode::UNAUTHORIZED, "Missing Authorization header").into_response();
    }

    match verify_jwt(token, &admin.jwt_secret) {
        Ok(claims) if claims.sub == ADMIN_SUBJECT => next.run(req).await,
        _ => (StatusCode::UNAUTHORIZED, "Invalid or expired token").into_response(),
    }
}

/// Resolve the API token and attach the [`Caller`].
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let key = bearer(&req);
    if key.is_empty() {
        return GatewayError::Unauthorized("missing api token".into()).into_response();
    }

    match state.accounts.authenticate(key) {
        Ok(Some((user, token))) => {
            req.extensions_mut().insert(Caller { user, token });
            next.run(req).await
        }
        Ok(None) => GatewayError::Unauthorized("invalid or exhausted api token".into()).into_response(),
        Err(e) => GatewayError::from(e).into_response(),
    }
}
