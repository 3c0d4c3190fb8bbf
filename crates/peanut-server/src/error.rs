use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use peanut_store::StoreError;

/// Domain errors crossing the HTTP boundary. Every variant maps to exactly
/// one status code and error code in the response envelope.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("{service}: {detail}")]
    ExternalService { service: String, detail: String },

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            ApiError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        let (message, details) = match &self {
            // Internal causes are logged, never surfaced.
            ApiError::Internal(detail) => {
                tracing::error!(detail = %detail, "internal error");
                ("Internal server error".to_string(), None)
            }
            ApiError::ExternalService { service, .. } => (
                self.to_string(),
                Some(serde_json::json!({ "service": service })),
            ),
            ApiError::RateLimited { retry_after_secs } => (
                self.to_string(),
                Some(serde_json::json!({ "retry_after": retry_after_secs })),
            ),
            other => (other.to_string(), None),
        };

        let mut error = serde_json::json!({
            "code": self.code(),
            "message": message,
        });
        if let Some(details) = details {
            error["details"] = details;
        }
        let body = axum::Json(serde_json::json!({ "error": error }));

        if let ApiError::RateLimited { retry_after_secs } = self {
            return (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response();
        }

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ApiError::NotFound("Record not found".into()),
            StoreError::DuplicateEmail => ApiError::Conflict("Email already registered".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<peanut_shared::CryptoError> for ApiError {
    fn from(e: peanut_shared::CryptoError) -> Self {
        ApiError::Internal(e.to_string())
    }
}
