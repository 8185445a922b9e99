//! # Error Handling and Response Types
//!
//! Errors raised anywhere in the proxy funnel into [`AppError`]. On the
//! registry listener they render as JSON:
//!
//! ```json
//! {
//!   "error": "Human-readable error message",
//!   "code": "machine_readable_error_code",
//!   "details": {...},
//!   "timestamp": "2024-01-01T12:00:00Z"
//! }
//! ```
//!
//! The web listener renders the same errors as HTML pages (see [`crate::ui`]).
//!
//! ## Error Classifications
//!
//! - **Not Acceptable** (406): the client cannot take JSON
//! - **Not Found** (404): unknown package or version
//! - **Upstream** (500): transport failure or non-2xx from the registry
//! - **Malformed Archive** (500): a tarball's `package.json` or
//!   `npm-shrinkwrap.json` does not parse
//! - **Not Cached** (504): offline mode and nothing cached for the request

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

/// Standardized error response structure for consistent API error handling
#[derive(Serialize, Debug)]
pub struct ApiErrorResponse {
    pub error: String,          // Human-readable error message
    pub code: String,           // Machine-readable error code
    pub details: Option<Value>, // Additional error details
    pub timestamp: String,      // ISO 8601 timestamp
}

/// Error code classification for machine-readable error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationError,
    NotFound,
    NotAcceptable,
    UpstreamError,
    NotCached,
    MalformedArchive,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::NotAcceptable => "not_acceptable",
            ErrorCode::UpstreamError => "upstream_error",
            ErrorCode::NotCached => "not_cached",
            ErrorCode::MalformedArchive => "malformed_archive",
            ErrorCode::InternalError => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            ErrorCode::NotCached => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::UpstreamError
            | ErrorCode::MalformedArchive
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Application-specific error types with error codes
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Template render error: {0}")]
    Template(#[from] askama::Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Not Acceptable: {0}")]
    NotAcceptable(String),

    #[error("Upstream request failed: {message}")]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    #[error("Integrity check failed for {url}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("Request not cached and offline mode is enabled: {0}")]
    NotCached(String),

    #[error("Malformed archive entry {path}: {source}")]
    MalformedArchiveEntry {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn upstream(message: impl Into<String>) -> Self {
        AppError::Upstream {
            status: None,
            message: message.into(),
        }
    }

    /// Get the appropriate error code for this error type
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::BadRequest(_) => ErrorCode::ValidationError,
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::NotAcceptable(_) => ErrorCode::NotAcceptable,
            AppError::Upstream { .. } | AppError::IntegrityMismatch { .. } => {
                ErrorCode::UpstreamError
            }
            AppError::NotCached(_) => ErrorCode::NotCached,
            AppError::MalformedArchiveEntry { .. } => ErrorCode::MalformedArchive,
            AppError::Io(_)
            | AppError::Json(_)
            | AppError::Template(_)
            | AppError::InternalError(_)
            | AppError::Anyhow(_) => ErrorCode::InternalError,
        }
    }

    /// Get additional error details if available
    pub fn details(&self) -> Option<Value> {
        match self {
            AppError::Upstream {
                status: Some(status),
                ..
            } => Some(json!({ "upstream_status": status })),
            AppError::MalformedArchiveEntry { path, .. } => Some(json!({ "entry": path })),
            AppError::IntegrityMismatch {
                expected, actual, ..
            } => Some(json!({ "expected": expected, "actual": actual })),
            AppError::Anyhow(e) => e
                .source()
                .map(|source| json!({ "source": source.to_string() })),
            _ => None,
        }
    }

    /// Create a standardized error response
    pub fn to_error_response(&self) -> ApiErrorResponse {
        ApiErrorResponse {
            error: self.to_string(),
            code: self.error_code().as_str().to_string(),
            details: self.details(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Upstream {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.error_code().http_status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "Request rejected");
        }

        (status, axum::Json(self.to_error_response())).into_response()
    }
}

/// Convenient result type for application operations.
pub type AppResult<T> = Result<T, AppError>;
