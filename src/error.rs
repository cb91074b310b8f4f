use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error types with appropriate HTTP status codes.
///
/// The governance pipeline distinguishes two error families here:
///
/// - `ConfigError` and `KeyExtraction` indicate deployment defects (a bad
///   environment variable, a custom key extractor that fails). They surface
///   as 500s because no request-level retry can fix them.
/// - `BadRequest` covers malformed request shapes encountered while the
///   limiter inspects a request (e.g. an unreadable body during identity
///   extraction) and maps to 400.
///
/// Quota exhaustion (429) and CSRF rejection (403) are deliberately NOT
/// variants of this enum: they are normal protocol outcomes produced inline
/// by the middleware, not application errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Rate limit key extraction failed: {0}")]
    KeyExtraction(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Stable machine-readable error body shared by all rejection responses.
///
/// The middleware layers (429, 403) reuse this shape directly so clients can
/// switch on `error` without parsing human-readable text.
#[derive(Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl ErrorBody {
    pub fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log full details server-side; expose only sanitized messages.
        tracing::error!(error = %self, "Request failed");

        let (status, body) = match &self {
            AppError::ConfigError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new(
                    "config_error",
                    "Service configuration error. Please contact support.",
                ),
            ),
            AppError::KeyExtraction(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody::new(
                    "internal_error",
                    "An internal error occurred. Please contact support if the issue persists.",
                ),
            ),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorBody::new("bad_request", msg.as_str()),
            ),
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_is_500() {
        let resp = AppError::ConfigError("bad PORT".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_key_extraction_is_500() {
        let resp = AppError::KeyExtraction("extractor failed".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_bad_request_is_400() {
        let resp = AppError::BadRequest("unreadable body".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_body_serializes_stable_code() {
        let body = ErrorBody::new("rate_limited", "slow down");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"], "rate_limited");
        assert_eq!(json["message"], "slow down");
    }
}
