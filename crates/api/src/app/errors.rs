use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::{error, warn};

use parley_infra::{ProducerError, StatusError};

/// Errors surfaced by the session handlers.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    NotFound,
    StoreUnavailable(String),
    BrokerUnavailable(String),
}

impl From<ProducerError> for ApiError {
    fn from(e: ProducerError) -> Self {
        match e {
            ProducerError::Validation(msg) => ApiError::Validation(msg),
            ProducerError::StoreUnavailable(msg) => ApiError::StoreUnavailable(msg),
            ProducerError::BrokerUnavailable { session_id, message } => {
                warn!(%session_id, error = %message, "session stored but task not enqueued");
                ApiError::BrokerUnavailable(message)
            }
        }
    }
}

impl From<StatusError> for ApiError {
    fn from(e: StatusError) -> Self {
        match e {
            StatusError::NotFound => ApiError::NotFound,
            StatusError::StoreUnavailable(msg) => ApiError::StoreUnavailable(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
            ApiError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "session not found"),
            ApiError::StoreUnavailable(msg) => {
                error!(error = %msg, "session store unavailable");
                json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", "session store unavailable")
            }
            ApiError::BrokerUnavailable(_) => json_error(
                StatusCode::BAD_GATEWAY,
                "broker_unavailable",
                "task broker unavailable; the session stays queued",
            ),
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
