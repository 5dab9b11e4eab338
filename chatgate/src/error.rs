//! Error types for the security layer.
//!
//! Three families with different audiences:
//! - [`SecurityError`] is client-caused and becomes a structured 403.
//! - [`StoreError`] stays inside the session store; callers only ever see it
//!   through [`crate::session::BackendHealth`].
//! - [`ConfigError`] is fatal at startup.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Request-level security failures surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    /// No CSRF token in the header, form body, or JSON body.
    #[error("CSRF token missing")]
    CsrfTokenMissing,
    /// A token was supplied but did not match the session's live token.
    #[error("CSRF token invalid or expired")]
    CsrfTokenInvalid,
}

impl SecurityError {
    /// Stable machine-readable code for the JSON payload.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::CsrfTokenMissing => "CSRF_TOKEN_MISSING",
            Self::CsrfTokenInvalid => "CSRF_TOKEN_INVALID",
        }
    }

    /// HTTP status for this error. CSRF failures are never 5xx.
    #[must_use]
    pub const fn status(self) -> StatusCode {
        StatusCode::FORBIDDEN
    }
}

/// JSON body for client-visible errors.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code.
    pub code: &'static str,
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Session backend failures. Never leaves the session store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend did not answer within its socket timeout.
    #[error("backend operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The backend driver reported an error.
    #[error("backend error: {0}")]
    Backend(String),
    /// Filesystem error in the fallback backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Client-safe one-line category, free of hostnames and paths.
    #[must_use]
    pub const fn summary(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timed out",
            Self::Backend(_) => "unreachable",
            Self::Io(_) => "storage I/O failed",
            Self::Serialization(_) => "returned undecodable data",
        }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<deadpool_redis::PoolError> for StoreError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Startup configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `secret_key` is empty.
    #[error("secret_key is not set")]
    MissingSecret,
    /// `secret_key` is shorter than the minimum.
    #[error("secret_key must be at least {min} bytes, got {actual}")]
    WeakSecret {
        /// Required minimum length.
        min: usize,
        /// Actual length.
        actual: usize,
    },
    /// Figment could not extract the configuration.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    /// The filesystem fallback directory cannot be used.
    #[error("session fallback directory unusable: {0}")]
    FallbackDir(#[source] std::io::Error),
    /// Any other invalid setting.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
