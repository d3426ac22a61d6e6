//! Crate-wide error type for the submission and fetch boundaries.
//!
//! Every variant maps to a stable machine-readable code and an HTTP status so
//! handlers can return `Result<_, GatewayError>` directly.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::{LedgerError, MappingError};
use crate::provider::ProviderError;
use crate::task::StoreError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request rejected before any charge (bad shape, missing media, ...).
    #[error("{message}")]
    Validation { code: &'static str, message: String },

    #[error("model mapping contains cycle: {from} -> {to}")]
    ModelMappingCycle { from: String, to: String },

    #[error("user quota is not enough")]
    InsufficientQuota,

    #[error("task_not_exist")]
    TaskNotFound,

    #[error("{0}")]
    Unauthorized(String),

    /// Upstream submission failure; the task was never created.
    #[error("upstream error ({status}): {message}")]
    Upstream {
        status: u16,
        code: &'static str,
        message: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("{0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code,
            Self::ModelMappingCycle { .. } => "model_mapping_failed",
            Self::InsufficientQuota => "quota_not_enough",
            Self::TaskNotFound => "task_not_exist",
            Self::Unauthorized(_) => "unauthorized",
            Self::Upstream { code, .. } => code,
            Self::Storage(_) => "storage_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } | Self::ModelMappingCycle { .. } | Self::TaskNotFound => {
                StatusCode::BAD_REQUEST
            }
            Self::InsufficientQuota => StatusCode::FORBIDDEN,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_server_error())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MappingError> for GatewayError {
    fn from(err: MappingError) -> Self {
        match err {
            MappingError::Cycle { from, to } => Self::ModelMappingCycle { from, to },
            MappingError::InvalidTable(msg) => Self::validation("model_mapping_failed", msg),
        }
    }
}

impl From<LedgerError> for GatewayError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientQuota { .. } => Self::InsufficientQuota,
            LedgerError::UserNotFound(id) => Self::Internal(format!("user {} not found", id)),
            LedgerError::Storage(e) => Self::Storage(e),
            LedgerError::Json(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Storage(e) => Self::Storage(e),
            StoreError::Ledger(e) => e.into(),
            StoreError::Json(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        Self::Upstream {
            status: err.status_code.unwrap_or(500),
            code: "do_request_failed",
            message: err.message,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = json!({
            "code": self.code(),
            "message": self.to_string(),
            "data": null,
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::validation("invalid_request", "bad").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::InsufficientQuota.status(), StatusCode::FORBIDDEN);
        let cycle = GatewayError::ModelMappingCycle {
            from: "a".into(),
            to: "b".into(),
        };
        assert_eq!(cycle.status(), StatusCode::BAD_REQUEST);
        assert_eq!(cycle.code(), "model_mapping_failed");
    }

    #[test]
    fn test_upstream_status_is_always_server_error() {
        let err = GatewayError::Upstream {
            status: 429,
            code: "do_request_failed",
            message: "slow down".into(),
        };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = GatewayError::Upstream {
            status: 503,
            code: "do_request_failed",
            message: "down".into(),
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
