//! Upstream provider errors, classified so callers can tell transient
//! failures (retry on the next sweep) from permanent ones.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Connection refused, DNS, reset.
    Network,
    /// Request exceeded the upstream timeout.
    Timeout,
    /// HTTP 429.
    RateLimited,
    /// Other 4xx.
    ClientError,
    /// 5xx.
    ServerError,
    /// Body could not be interpreted.
    Parse,
}

/// Map an HTTP status code to an error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimited,
        400..=499 => ProviderErrorKind::ClientError,
        _ => ProviderErrorKind::ServerError,
    }
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Network,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Timeout,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Parse,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        Self {
            kind: classify_http_status(status),
            status_code: Some(status),
            message: format!("upstream returned HTTP {}: {}", status, body),
        }
    }

    /// Map a reqwest transport error.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::timeout(format!("Request timeout: {}", e))
        } else if e.is_connect() {
            Self::network_error(format!("Connection failed: {}", e))
        } else if e.is_decode() {
            Self::parse_error(format!("Failed to decode response: {}", e))
        } else {
            Self::network_error(format!("Request failed: {}", e))
        }
    }

    /// Worth retrying on the next sweep.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Network
                | ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::ServerError
        )
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProviderError {}
