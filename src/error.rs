//! API-facing error taxonomy.
//!
//! Every failure that surfaces to an HTTP client is expressed as an
//! [`ApiError`] carrying one of the stable [`ErrorCode`]s. Codes are rendered
//! verbatim in the error envelope:
//!
//! ```json
//! { "error": { "code": "REFUND_EXCEEDS_AMOUNT", "message": "...", "details": {...} } }
//! ```
//!
//! Internal subsystems keep their own `thiserror` enums and convert at the
//! handler boundary; anything without an explicit mapping becomes
//! `INTERNAL_ERROR` with the original error logged.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use std::fmt::{Display, Formatter};

use crate::provider::ProviderError;

/// Stable machine-readable error codes, surfaced to clients verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthRequired,
    InvalidCredentials,
    TokenExpired,
    TokenInvalid,
    InsufficientPermissions,
    ApiKeyInvalid,
    RateLimitExceeded,
    ValidationError,
    PaymentNotFound,
    PaymentExpired,
    RefundNotAllowed,
    RefundExceedsAmount,
    IdempotencyConflict,
    ProviderError,
    ProviderTimeout,
    ProviderUnavailable,
    InternalError,
}

impl ErrorCode {
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired
            | ErrorCode::InvalidCredentials
            | ErrorCode::TokenExpired
            | ErrorCode::TokenInvalid
            | ErrorCode::ApiKeyInvalid => StatusCode::UNAUTHORIZED,
            ErrorCode::InsufficientPermissions => StatusCode::FORBIDDEN,
            ErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::PaymentNotFound => StatusCode::NOT_FOUND,
            ErrorCode::PaymentExpired => StatusCode::GONE,
            ErrorCode::RefundNotAllowed | ErrorCode::RefundExceedsAmount => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ErrorCode::IdempotencyConflict => StatusCode::CONFLICT,
            ErrorCode::ProviderError => StatusCode::BAD_GATEWAY,
            ErrorCode::ProviderTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Leverage serde to render the SCREAMING_SNAKE_CASE name.
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        write!(f, "{}", json.trim_matches('"'))
    }
}

/// An error ready to be rendered into the public envelope.
#[derive(Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn payment_not_found() -> Self {
        Self::new(ErrorCode::PaymentNotFound, "No such payment")
    }

    pub fn internal() -> Self {
        Self::new(ErrorCode::InternalError, "Internal server error")
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(error: sqlx::Error) -> Self {
        tracing::error!(error = %error, "database failure");
        ApiError::internal()
    }
}

impl From<ProviderError> for ApiError {
    fn from(error: ProviderError) -> Self {
        let code = match &error {
            ProviderError::Timeout { .. } => ErrorCode::ProviderTimeout,
            ProviderError::NotConfigured(_) => ErrorCode::ProviderUnavailable,
            ProviderError::Unsupported { .. } => ErrorCode::ValidationError,
            ProviderError::InvalidCallback(_) => ErrorCode::ValidationError,
            _ => ErrorCode::ProviderError,
        };
        ApiError::new(code, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.http_status();
        if status.is_server_error() {
            tracing::error!(code = %self.code, message = %self.message, "request failed");
        }
        let mut body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        if let Some(details) = self.details {
            body["error"]["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_render_in_screaming_snake_case() {
        assert_eq!(ErrorCode::RefundExceedsAmount.to_string(), "REFUND_EXCEEDS_AMOUNT");
        assert_eq!(ErrorCode::ApiKeyInvalid.to_string(), "API_KEY_INVALID");
        assert_eq!(ErrorCode::ProviderTimeout.to_string(), "PROVIDER_TIMEOUT");
    }

    #[test]
    fn codes_map_to_the_documented_statuses() {
        assert_eq!(ErrorCode::AuthRequired.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::ValidationError.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::PaymentNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::PaymentExpired.http_status(), StatusCode::GONE);
        assert_eq!(
            ErrorCode::RefundNotAllowed.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(ErrorCode::IdempotencyConflict.http_status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::ProviderError.http_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(ErrorCode::ProviderTimeout.http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            ErrorCode::ProviderUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn envelope_shape() {
        let error = ApiError::validation("amount must be positive")
            .with_details(json!({ "field": "amount" }));
        let body = json!({
            "error": {
                "code": error.code,
                "message": error.message,
                "details": error.details,
            }
        });
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["details"]["field"], "amount");
    }
}
