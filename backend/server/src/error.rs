use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::envelope::{Envelope, FailureReason};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("You need to log in")]
    LoginRequired,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not claimable: {0}")]
    NotClaimable(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),
}

impl AppError {
    pub fn reason(&self) -> FailureReason {
        match self {
            AppError::LoginRequired => FailureReason::LoginRequired,
            AppError::Validation(_) => FailureReason::Validation,
            AppError::Unauthorized(_) => FailureReason::Unauthorized,
            AppError::NotFound(_) => FailureReason::NotFound,
            AppError::NotClaimable(_) => FailureReason::NotClaimable,
            AppError::Persistence(_) => FailureReason::Persistence,
        }
    }

    /// Store failures are not leaked to the caller verbatim.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Persistence(_) => "Error: the operation could not be completed".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Persistence(e) = &self {
            error!("Store failure surfaced to caller: {e}");
        }

        Envelope::<()>::failure(&self).into_response()
    }
}

impl FailureReason {
    pub fn status(&self) -> StatusCode {
        match self {
            FailureReason::LoginRequired => StatusCode::UNAUTHORIZED,
            FailureReason::Validation => StatusCode::BAD_REQUEST,
            FailureReason::Unauthorized => StatusCode::FORBIDDEN,
            FailureReason::NotFound => StatusCode::NOT_FOUND,
            FailureReason::NotClaimable => StatusCode::CONFLICT,
            FailureReason::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
