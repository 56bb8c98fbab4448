//! # Error Handling and Response Types
//!
//! Every failure in the registry is an [`AppError`]. Each variant maps to one
//! HTTP status and one npm-compatible JSON document, so handlers can simply
//! return `AppResult<T>` and let [`IntoResponse`] do the rest.
//!
//! ## Error Classifications
//!
//! - **Validation** (400): malformed archive, name/version mismatch, bad range
//! - **NotFound** (404): unknown package, version, or unsatisfiable range
//! - **Unauthorized / Forbidden** (401 / 403): failed login or missing session
//! - **Conflict** (409): same version republished with different content
//! - **PayloadTooLarge** (413): upload over the configured limit
//! - **Storage** (500): disk I/O failure
//!
//! Not-found results are routine for npm clients probing ranges, so they are
//! logged at INFO. Storage failures are logged at ERROR.

use axum::{
    extract::rejection::BytesRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

/// Machine-readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Validation,
    NotFound,
    Unauthorized,
    Forbidden,
    Conflict,
    PayloadTooLarge,
    Storage,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "bad_request",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::Conflict => "conflict",
            ErrorCode::PayloadTooLarge => "payload_too_large",
            ErrorCode::Storage => "internal_server_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::Storage => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Application-specific error types
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decoding error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AppError {
    /// Get the error code for this error type
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::Validation(_) | AppError::Json(_) | AppError::Base64(_) => {
                ErrorCode::Validation
            }
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::Unauthorized(_) => ErrorCode::Unauthorized,
            AppError::Forbidden(_) => ErrorCode::Forbidden,
            AppError::Conflict(_) => ErrorCode::Conflict,
            AppError::PayloadTooLarge(_) => ErrorCode::PayloadTooLarge,
            AppError::Io(_) | AppError::Storage(_) => ErrorCode::Storage,
        }
    }

    /// The npm-compatible JSON body for this error.
    pub fn to_document(&self) -> Value {
        let code = self.error_code();
        match code {
            // npm treats exactly this shape as "package does not exist"
            ErrorCode::NotFound => json!({
                "error": "not_found",
                "reason": "document not found",
            }),
            ErrorCode::Unauthorized | ErrorCode::Forbidden => json!({
                "ok": false,
                "error": code.as_str(),
                "reason": self.to_string(),
                "id": "-",
                "rev": "1-0",
            }),
            _ => json!({
                "error": code.as_str(),
                "reason": self.to_string(),
            }),
        }
    }
}

impl From<BytesRejection> for AppError {
    fn from(rejection: BytesRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(rejection.body_text())
        } else {
            AppError::Validation(rejection.body_text())
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        match code {
            ErrorCode::NotFound => tracing::info!(reason = %self, "Document not found"),
            ErrorCode::Storage => tracing::error!(error = %self, "Request failed"),
            _ => tracing::warn!(error = %self, code = code.as_str(), "Request rejected"),
        }

        let status = code.http_status();
        tracing::debug!(status = %status, code = code.as_str(), "Returning error document");

        (status, Json(self.to_document())).into_response()
    }
}

/// Convenient result type for application operations.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_statuses() {
        assert_eq!(
            AppError::Validation("x".into()).error_code().http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Conflict("x".into()).error_code().http_status(),
            StatusCode::CONFLICT
        );
        let io = std::io::Error::other("disk gone");
        assert_eq!(AppError::from(io).error_code(), ErrorCode::Storage);
    }

    #[test]
    fn test_not_found_document_shape() {
        let doc = AppError::NotFound("left-pad".into()).to_document();
        assert_eq!(doc, json!({"error": "not_found", "reason": "document not found"}));
    }

    #[test]
    fn test_forbidden_document_shape() {
        let doc = AppError::Forbidden("no session".into()).to_document();
        assert_eq!(doc["ok"], false);
        assert_eq!(doc["error"], "forbidden");
        assert_eq!(doc["id"], "-");
        assert_eq!(doc["rev"], "1-0");
    }
}
