use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tracing::info;

use parley_core::SessionId;

use crate::app::{dto, errors::ApiError};
use crate::app::services::AppServices;
use crate::context::CallerContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_sessions).post(submit_session))
        .route("/:session_id", get(get_session))
}

pub async fn submit_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    body: Result<Json<dto::SubmitSessionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(body) = body.map_err(|e| ApiError::Validation(e.body_text()))?;

    let receipt = services.producer().submit(caller.user_id(), &body.message).await?;
    info!(session_id = %receipt.session_id, user_id = %caller.user_id(), "session submitted");

    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn get_session(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    // An id that does not parse cannot name one of the caller's sessions.
    let session_id: SessionId = session_id.parse().map_err(|_| ApiError::NotFound)?;

    let view = services.status().get_status(session_id, caller.user_id()).await?;
    Ok(Json(view))
}

pub async fn list_sessions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = services.status().list_sessions(caller.user_id()).await?;
    Ok(Json(dto::SessionListResponse { sessions }))
}
