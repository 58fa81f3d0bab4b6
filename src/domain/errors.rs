use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::persistence::DatabaseError;
use crate::queue::QueueError;

/// Failure inside per-deal reconciliation.
///
/// Never aborts the containing batch: the caller catches these per deal and
/// routes them to the quarantine queue.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("ledger error: {0}")]
    Ledger(#[from] DatabaseError),

    #[error("deal {ticket} is missing required field `{field}`")]
    MissingField { ticket: i64, field: &'static str },

    #[error("unparseable timestamp on deal {ticket}")]
    BadTimestamp { ticket: i64 },
}

/// Failure in terminal lifecycle orchestration. Provisioning and teardown
/// errors are terminal for that attempt; a fresh enable call retries.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("account not found")]
    AccountNotFound,

    #[error("auto-sync is already enabled")]
    AlreadyEnabled,

    #[error("auto-sync is not enabled")]
    NotEnabled,

    #[error("terminal is not running")]
    NotRunning,

    #[error("unknown terminal: {0}")]
    UnknownTerminal(String),

    #[error("orchestrator error: {0}")]
    Orchestrator(String),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// API-boundary error with an HTTP mapping.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("internal server error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<LifecycleError> for ApiError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::AccountNotFound | LifecycleError::NotEnabled => {
                ApiError::NotFound(e.to_string())
            }
            LifecycleError::UnknownTerminal(_) => ApiError::NotFound(e.to_string()),
            LifecycleError::AlreadyEnabled | LifecycleError::NotRunning => {
                ApiError::BadRequest(e.to_string())
            }
            LifecycleError::Orchestrator(_)
            | LifecycleError::Storage(_)
            | LifecycleError::Queue(_) => ApiError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_error_http_mapping() {
        assert!(matches!(
            ApiError::from(LifecycleError::AccountNotFound),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(LifecycleError::AlreadyEnabled),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(LifecycleError::Orchestrator("down".into())),
            ApiError::Internal(_)
        ));
    }

    #[test]
    fn test_process_error_display() {
        let e = ProcessError::MissingField {
            ticket: 7,
            field: "positionId",
        };
        assert!(e.to_string().contains("positionId"));
    }
}
