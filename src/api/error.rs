use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

use crate::error::SchedulerError;

/// Scheduler error rendered as an `{ "error": ... }` body.
pub struct ApiError(pub SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::DuplicateKey(_) => StatusCode::CONFLICT,
            SchedulerError::InvalidSchedule { .. } | SchedulerError::InvalidJob(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, %status, "Request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}
