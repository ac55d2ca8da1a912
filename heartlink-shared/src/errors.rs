use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::types::ApiErrorResponse;

/// Application error codes following the pattern E{area}{sequence}
///
/// Ranges:
/// - E0xxx: Shared/infrastructure errors
/// - E1xxx: Pairing errors
/// - E2xxx: Session errors
/// - E3xxx: Realtime gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Shared (E0xxx)
    InternalError,
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    ServiceUnavailable,
    BadRequest,
    TokenExpired,
    TokenInvalid,

    // Pairing (E1xxx)
    DuplicateRequest,
    AlreadyMatched,
    RequestNotFound,
    AccountRestricted,

    // Session (E2xxx)
    SessionNotFound,
    NotSessionParticipant,
    SessionNotActive,
    SessionEnded,

    // Gateway (E3xxx)
    MalformedEnvelope,
    PayloadTooLarge,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            // Shared
            Self::InternalError => "E0001",
            Self::ValidationError => "E0002",
            Self::NotFound => "E0003",
            Self::Unauthorized => "E0004",
            Self::Forbidden => "E0005",
            Self::ServiceUnavailable => "E0006",
            Self::BadRequest => "E0007",
            Self::TokenExpired => "E0008",
            Self::TokenInvalid => "E0009",

            // Pairing
            Self::DuplicateRequest => "E1001",
            Self::AlreadyMatched => "E1002",
            Self::RequestNotFound => "E1003",
            Self::AccountRestricted => "E1004",

            // Session
            Self::SessionNotFound => "E2001",
            Self::NotSessionParticipant => "E2002",
            Self::SessionNotActive => "E2003",
            Self::SessionEnded => "E2004",

            // Gateway
            Self::MalformedEnvelope => "E3001",
            Self::PayloadTooLarge => "E3002",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ValidationError | Self::BadRequest | Self::MalformedEnvelope => {
                StatusCode::BAD_REQUEST
            }
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound | Self::RequestNotFound | Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized | Self::TokenExpired | Self::TokenInvalid => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::NotSessionParticipant | Self::AccountRestricted => {
                StatusCode::FORBIDDEN
            }
            Self::DuplicateRequest
            | Self::AlreadyMatched
            | Self::SessionNotActive
            | Self::SessionEnded => StatusCode::CONFLICT,
        }
    }

    /// Short machine-readable name, used on the realtime channel where there is
    /// no HTTP status to carry the meaning.
    pub fn name(&self) -> &'static str {
        match self {
            Self::InternalError => "internal_error",
            Self::ValidationError => "validation_error",
            Self::NotFound => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::ServiceUnavailable => "service_unavailable",
            Self::BadRequest => "bad_request",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::DuplicateRequest => "duplicate_request",
            Self::AlreadyMatched => "already_matched",
            Self::RequestNotFound => "request_not_found",
            Self::AccountRestricted => "account_restricted",
            Self::SessionNotFound => "session_not_found",
            Self::NotSessionParticipant => "not_session_participant",
            Self::SessionNotActive => "session_not_active",
            Self::SessionEnded => "session_ended",
            Self::MalformedEnvelope => "malformed_envelope",
            Self::PayloadTooLarge => "payload_too_large",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Known {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// The error code this error reports to clients.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::Known { code, .. } => *code,
            AppError::Internal(_) => ErrorCode::InternalError,
            AppError::Validation(_) => ErrorCode::ValidationError,
        }
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.error_code() == code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            AppError::Known { code, message, details } => {
                let status = code.status_code();
                if status.is_server_error() {
                    tracing::error!(code = code.code(), error = %message, "request failed");
                }
                let mut resp = ApiErrorResponse::new(code.code(), message);
                if let Some(d) = details {
                    resp = resp.with_details(d.clone());
                }
                (status, resp)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new("E0001", "internal server error"),
                )
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ApiErrorResponse::new("E0002", msg),
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
