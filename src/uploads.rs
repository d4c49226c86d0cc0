use crate::{
    AppError, AppState, error::ServiceError, http::ensure_image_url, metrics, security::Session,
    storage::StoredObject,
};
use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::info;

const STAGE: &str = "upload";

/// Stores a room photo sent as the raw request body.
///
/// - Method: `POST`
/// - Path: `/api/upload`
/// - Body: image bytes, typed by `Content-Type`
pub async fn upload(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<StoredObject>, AppError> {
    metrics::inc_requests("/api/upload");
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::invalid_input(STAGE, "Content-Type is required"))?;
    let size = body.len();
    let stored = state
        .storage
        .put(&session.user_id, content_type, body)
        .await
        .map_err(ServiceError::from)?;
    info!(target = "designgenius.storage", user_id = %session.user_id, key = %stored.key, size, "upload stored");
    Ok(Json(stored))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyRequest {
    image_url: String,
}

/// Copies a remote image (typically a generated output) into our bucket.
pub async fn copy_to_cloud(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<CopyRequest>,
) -> Result<Json<StoredObject>, AppError> {
    metrics::inc_requests("/api/cloud/post-history");
    let url = ensure_image_url(STAGE, &req.image_url)?;
    let stored = state
        .storage
        .copy_remote(&session.user_id, url.as_str())
        .await
        .map_err(ServiceError::from)?;
    Ok(Json(stored))
}

/// Serves objects held by the in-memory bucket.
pub async fn serve(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    match state.storage.get(&key).await {
        Some((content_type, bytes)) => {
            ([(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
