//! Wire error taxonomy.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use featuregate_store::StoreError;
use serde::Serialize;
use serde_json::json;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    FlagNotFound,
    InvalidFlagType,
    InvalidInput,
    ValidationError,
    InvalidSampleRate,
    InvalidDateRange,
    DateRangeTooLarge,
    EvaluationError,
    UnauthorizedAccess,
    AdminAccessDisabled,
    OrganizationRequired,
    StorageError,
    Conflict,
    RateLimitExceeded,
    QuotaExceeded,
    ExportError,
    AuditNotFound,
    OverrideNotFound,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::FlagNotFound
            | ErrorCode::AuditNotFound
            | ErrorCode::OverrideNotFound => StatusCode::NOT_FOUND,
            ErrorCode::InvalidFlagType
            | ErrorCode::InvalidInput
            | ErrorCode::ValidationError
            | ErrorCode::InvalidSampleRate
            | ErrorCode::InvalidDateRange
            | ErrorCode::DateRangeTooLarge => StatusCode::BAD_REQUEST,
            ErrorCode::UnauthorizedAccess => StatusCode::FORBIDDEN,
            ErrorCode::AdminAccessDisabled | ErrorCode::OrganizationRequired => {
                StatusCode::FORBIDDEN
            }
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::RateLimitExceeded | ErrorCode::QuotaExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ErrorCode::EvaluationError
            | ErrorCode::StorageError
            | ErrorCode::ExportError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An error response: `{"error": {"code", "message"}}` with the status
/// implied by the code.
#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    /// Overrides the code's default status; used for `401` vs `403`.
    status: Option<StatusCode>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }

    /// Missing session: same code as a role failure, different status.
    pub fn unauthenticated() -> Self {
        Self {
            code: ErrorCode::UnauthorizedAccess,
            message: "authentication required".to_string(),
            status: Some(StatusCode::UNAUTHORIZED),
        }
    }

    /// The masking not-found used when a caller addresses a flag it
    /// does not own.
    pub fn flag_not_found() -> Self {
        Self::new(ErrorCode::FlagNotFound, "flag not found")
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.code.status())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::FlagNotFound => ApiError::flag_not_found(),
            StoreError::RuleNotFound => {
                ApiError::new(ErrorCode::FlagNotFound, "rule not found")
            }
            StoreError::OverrideNotFound => {
                ApiError::new(ErrorCode::OverrideNotFound, "override not found")
            }
            StoreError::AuditNotFound => {
                ApiError::new(ErrorCode::AuditNotFound, "audit entry not found")
            }
            StoreError::EnvironmentNotFound => {
                ApiError::new(ErrorCode::FlagNotFound, "environment not found")
            }
            StoreError::Conflict(key) => ApiError::new(
                ErrorCode::Conflict,
                format!("duplicate key {key:?} in scope"),
            ),
            StoreError::InvalidInput(message) => {
                ApiError::new(ErrorCode::InvalidInput, message)
            }
            StoreError::InvalidFlagType(message) => {
                ApiError::new(ErrorCode::InvalidFlagType, message)
            }
            StoreError::UnknownFlag(key) => {
                ApiError::new(ErrorCode::FlagNotFound, format!("unknown flag {key:?}"))
            }
            StoreError::Backend(message) => {
                ApiError::new(ErrorCode::StorageError, message)
            }
        }
    }
}

impl From<featuregate_engine::ValidationError> for ApiError {
    fn from(err: featuregate_engine::ValidationError) -> Self {
        ApiError::validation(err.to_string())
    }
}
