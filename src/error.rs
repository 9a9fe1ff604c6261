//! Error taxonomy for the engine's HTTP surface.
//!
//! The design stance is graceful degradation over all-or-nothing: failures
//! local to one fan-out branch (a notification channel, one targeted user)
//! are caught and logged where they happen and never reach this type. What
//! does surface here is the caller-visible taxonomy: missing entities,
//! ownership violations, illegal state-machine transitions, bad input.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Caller-visible errors, mapped to HTTP status codes.
#[derive(Debug, Error)]
pub enum AppError {
    /// A disaster, alert, SOS request or user does not exist.
    #[error("{0}")]
    NotFound(String),

    /// Ownership or role mismatch on a mutation.
    #[error("{0}")]
    Forbidden(String),

    /// The SOS state machine rejected a transition.
    #[error("{0}")]
    InvalidTransition(String),

    /// Malformed input rejected at the boundary.
    #[error("{0}")]
    Validation(String),

    /// Too many SOS submissions from one caller.
    #[error("too many requests, slow down")]
    RateLimited,

    /// Anything unexpected from storage or a collaborator.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::InvalidTransition(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal errors are logged server-side; the payload stays generic.
        let message = match &self {
            AppError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "success": false,
            "error": { "message": message },
        }));

        (status, body).into_response()
    }
}

/// Convenience alias for handler and service results.
pub type Result<T> = std::result::Result<T, AppError>;
