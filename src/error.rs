use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::roster::RosterError;
use crate::watermark::ProcessingFailed;

/// Request problems the caller can fix; surfaced verbatim.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Only teachers can upload videos")]
    RoleMismatch,

    #[error("Missing video file")]
    MissingFile,

    #[error("Missing title")]
    MissingTitle,

    #[error("File too large")]
    FileTooLarge,

    #[error("Video is not processed yet")]
    NotReady,

    #[error("Only failed or stalled videos can be retried")]
    NotRetryable,

    #[error("{0}")]
    Invalid(String),
}

/// Error type for HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    ProcessingFailed(#[from] ProcessingFailed),

    #[error("student roster unavailable: {0}")]
    UpstreamUnavailable(#[from] RosterError),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("queue error: {0}")]
    Queue(#[from] redis::RedisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(ValidationError::RoleMismatch) => {
                (StatusCode::FORBIDDEN, "VALIDATION_ERROR", self.to_string())
            }
            AppError::Validation(ValidationError::FileTooLarge) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "VALIDATION_ERROR", self.to_string())
            }
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", self.to_string()),
            AppError::NotFound(entity) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{entity} not found"),
            ),
            AppError::ProcessingFailed(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "PROCESSING_FAILED",
                "Video processing failed".to_string(),
            ),
            AppError::UpstreamUnavailable(_) => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_UNAVAILABLE",
                "Student roster unavailable".to_string(),
            ),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Database(_) | AppError::Queue(_) | AppError::Io(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        if status.is_server_error() {
            // Detail stays in the logs.
            tracing::error!(error = %self, code, "Request failed");
            tracing::Span::current().record("error", tracing::field::display(&self));
        } else {
            tracing::Span::current().record("error", code);
        }

        (status, Json(json!({ "error": message, "code": code }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watermark::FailureReason;

    #[test]
    fn role_mismatch_is_forbidden_validation() {
        let (status, code, message) = AppError::from(ValidationError::RoleMismatch).parts();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(code, "VALIDATION_ERROR");
        assert_eq!(message, "Only teachers can upload videos");
    }

    #[test]
    fn processing_failure_hides_stderr() {
        let err = AppError::from(ProcessingFailed {
            reason: FailureReason::Exit(1),
            stderr: "/srv/uploads/raw/secret.mp4: Invalid data".to_string(),
        });
        let (status, code, message) = err.parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "PROCESSING_FAILED");
        assert!(!message.contains("secret"));
    }

    #[test]
    fn not_found_names_entity() {
        let (status, _, message) = AppError::NotFound("Video").parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(message, "Video not found");
    }
}
