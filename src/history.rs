use crate::{AppError, AppState, error::ServiceError, metrics, security::Session, store::HistoryEntry};
use axum::{Extension, Json, extract::State};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

const STAGE: &str = "history";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    image_url: String,
}

/// Stores a finished design in the caller's history.
pub async fn save(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<SaveRequest>,
) -> Result<Json<HistoryEntry>, AppError> {
    metrics::inc_requests("/api/history/save");
    let image_url = req.image_url.trim();
    if image_url.is_empty() {
        return Err(ServiceError::invalid_input(STAGE, "imageUrl is required").into());
    }
    let entry = state
        .store
        .create_history(&session.user_id, image_url)
        .await
        .map_err(|err| err.service_error(STAGE))?;
    Ok(Json(entry))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    metrics::inc_requests("/api/history/get");
    let entries = state
        .store
        .list_history(&session.user_id)
        .await
        .map_err(|err| err.service_error(STAGE))?;
    Ok(Json(entries))
}

/// Either a single `imageId` or a batch of `imageIds`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    #[serde(default)]
    image_id: Option<String>,
    #[serde(default)]
    image_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    deleted: Vec<Uuid>,
}

/// Deletes history entries owned by the caller.
///
/// A single id that is unknown or foreign answers 404. In batch mode such ids
/// are skipped and only the removed ones are reported.
pub async fn delete(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<DeleteRequest>,
) -> Result<Json<DeleteResponse>, AppError> {
    metrics::inc_requests("/api/history/delete");
    let deleted = match (req.image_id, req.image_ids) {
        (Some(single), None) => {
            let id = Uuid::parse_str(single.trim())
                .map_err(|_| ServiceError::not_found(STAGE, "not_found"))?;
            state
                .store
                .delete_history(&session.user_id, id)
                .await
                .map_err(|err| err.service_error(STAGE))?;
            vec![id]
        }
        (None, Some(ids)) => {
            let parsed: Vec<Uuid> = ids
                .iter()
                .filter_map(|raw| Uuid::parse_str(raw.trim()).ok())
                .collect();
            if parsed.is_empty() {
                Vec::new()
            } else {
                state
                    .store
                    .delete_history_many(&session.user_id, &parsed)
                    .await
                    .map_err(|err| err.service_error(STAGE))?
            }
        }
        _ => {
            return Err(
                ServiceError::invalid_input(STAGE, "provide exactly one of imageId or imageIds")
                    .into(),
            );
        }
    };
    info!(
        target = "designgenius.history",
        user_id = %session.user_id,
        deleted = deleted.len(),
        "history entries deleted"
    );
    Ok(Json(DeleteResponse { deleted }))
}
