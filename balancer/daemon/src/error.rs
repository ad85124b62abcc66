//! Mapping of scheduling failures to HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use balancer_core::{SchedulerError, StoreError};

/// Failure returned by a handler
#[derive(Debug, Error)]
pub enum ApiError {
    /// Terminal scheduling failure
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Forced registry reload failed; the previous snapshot is still served
    #[error("registry refresh failed: {0}")]
    Registry(#[from] StoreError),

    /// Admin lookup of a server id that is not in the registry
    #[error("no server with id {0}")]
    UnknownServer(u64),
}

impl ApiError {
    /// HTTP status for this failure
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Scheduler(SchedulerError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            Self::Scheduler(SchedulerError::NotFound { .. }) | Self::UnknownServer(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Scheduler(SchedulerError::NoAvailableServer { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Scheduler(SchedulerError::TruncatedResponse { .. }) => StatusCode::BAD_GATEWAY,
            Self::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = self.to_string();
        let body = match self {
            Self::Scheduler(SchedulerError::NotFound { virtual_model }) => json!({
                "error": message,
                "virtual_model": virtual_model,
            }),
            Self::Scheduler(SchedulerError::NoAvailableServer {
                virtual_model,
                attempts,
            }) => json!({
                "error": message,
                "virtual_model": virtual_model,
                "attempts": attempts,
            }),
            _ => json!({ "error": message }),
        };
        (status, Json(body)).into_response()
    }
}
