//! # Response Envelope
//!
//! Every lifecycle response carries `success` and a human readable `message`.
//!
//! - Success: `{ "success": true, "message": ..., "payload": ... }`
//! - Failure: `{ "success": false, "reason": "not_found", "message": ... }`
//!
//! Failures always name one [`FailureReason`]. The UI branches on it, e.g.
//! `login_required` sends the user to the login page.
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Serialize, Serializer, ser::SerializeStruct};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    LoginRequired,
    Validation,
    Unauthorized,
    NotFound,
    NotClaimable,
    Persistence,
}

#[derive(Debug)]
pub enum Envelope<T> {
    Success { message: String, payload: T },
    Failure { reason: FailureReason, message: String },
}

impl<T> Envelope<T> {
    pub fn success(message: impl Into<String>, payload: T) -> Self {
        Envelope::Success {
            message: message.into(),
            payload,
        }
    }

    pub fn failure(error: &AppError) -> Self {
        Envelope::Failure {
            reason: error.reason(),
            message: error.public_message(),
        }
    }
}

impl<T: Serialize> Serialize for Envelope<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Envelope", 3)?;

        match self {
            Envelope::Success { message, payload } => {
                state.serialize_field("success", &true)?;
                state.serialize_field("message", message)?;
                state.serialize_field("payload", payload)?;
            }
            Envelope::Failure { reason, message } => {
                state.serialize_field("success", &false)?;
                state.serialize_field("reason", reason)?;
                state.serialize_field("message", message)?;
            }
        }

        state.end()
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        let status = match &self {
            Envelope::Success { .. } => StatusCode::OK,
            Envelope::Failure { reason, .. } => reason.status(),
        };

        (status, Json(self)).into_response()
    }
}
