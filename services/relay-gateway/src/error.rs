//! Relay rejection taxonomy
//!
//! Every terminal non-upstream outcome maps to one variant. Upstream 2xx/4xx
//! responses are passed through verbatim and never become a `RelayError`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Invalid or expired API key. Check your Authorization header.")]
    Authentication,

    #[error("Rate limit exceeded. Try again in {retry_after_secs}s.")]
    RateLimited { retry_after_secs: u64 },

    #[error("Usage quota exceeded for this API key.")]
    QuotaExceeded,

    #[error("No available upstream tokens. Please contact the administrator.")]
    NoTokensAvailable,

    #[error("Upstream request failed after {attempts} attempts: {message}")]
    UpstreamFailure { attempts: u32, message: String },

    #[error("{0}")]
    InvalidRequest(String),

    #[error("No relay route for {0}")]
    NotFound(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::Authentication => StatusCode::UNAUTHORIZED,
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::QuotaExceeded => StatusCode::FORBIDDEN,
            RelayError::NoTokensAvailable => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    /// `error.type` field of the payload
    pub fn error_type(&self) -> &'static str {
        match self {
            RelayError::Authentication => "authentication_error",
            RelayError::RateLimited { .. } => "rate_limit_error",
            RelayError::QuotaExceeded => "quota_error",
            RelayError::NoTokensAvailable => "service_error",
            RelayError::UpstreamFailure { .. } => "upstream_error",
            RelayError::InvalidRequest(_) | RelayError::NotFound(_) => "invalid_request_error",
        }
    }

    /// `error.code` field of the payload
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Authentication => "invalid_api_key",
            RelayError::RateLimited { .. } => "rate_limit_exceeded",
            RelayError::QuotaExceeded => "quota_exceeded",
            RelayError::NoTokensAvailable => "no_tokens_available",
            RelayError::UpstreamFailure { .. } => "upstream_failure",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::NotFound(_) => "not_found",
        }
    }

    /// JSON error response: {"error":{"message","type","code","request_id"}}
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
                "request_id": request_id,
            }
        });
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}
