//! Library item endpoints. Changes are broadcast as `library:item:*` events.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use mangashelf_db::entities::library_item;
use mangashelf_download::events::LibraryItemRemovedPayload;
use mangashelf_download::{AppEvent, EventSink, LibraryItemPatch, NewLibraryItem};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{download_error, error_response, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct LibraryListResponse {
    pub items: Vec<library_item::Model>,
}

fn item_not_found() -> ApiError {
    error_response(StatusCode::NOT_FOUND, "Library item not found")
}

/// GET /api/library
pub async fn list_items(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LibraryListResponse>, ApiError> {
    let items = state.library.list().await.map_err(download_error)?;
    Ok(Json(LibraryListResponse { items }))
}

/// POST /api/library
pub async fn add_item(
    State(state): State<Arc<AppState>>,
    Json(input): Json<NewLibraryItem>,
) -> Result<(StatusCode, Json<library_item::Model>), ApiError> {
    let item = state.library.create(input).await.map_err(download_error)?;
    tracing::info!(library_id = %item.id, manga_id = %item.manga_id, "library item added");
    state.hub.emit(AppEvent::library_item_added(&item));
    Ok((StatusCode::CREATED, Json(item)))
}

/// GET /api/library/{id}
pub async fn get_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<library_item::Model>, ApiError> {
    state
        .library
        .get(id)
        .await
        .map_err(download_error)?
        .map(Json)
        .ok_or_else(item_not_found)
}

/// PATCH /api/library/{id}
pub async fn update_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(patch): Json<LibraryItemPatch>,
) -> Result<Json<library_item::Model>, ApiError> {
    let item = state
        .library
        .update(id, patch)
        .await
        .map_err(download_error)?
        .ok_or_else(item_not_found)?;
    state.hub.emit(AppEvent::library_item_updated(&item));
    Ok(Json(item))
}

/// DELETE /api/library/{id}
///
/// Active downloads of the item are cancelled and all of its page files are
/// removed before the row goes; download rows follow by cascade.
pub async fn remove_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if state.library.get(id).await.map_err(download_error)?.is_none() {
        return Err(item_not_found());
    }
    state
        .downloads
        .purge_library_item(id)
        .await
        .map_err(download_error)?;

    let item = state
        .library
        .delete(id)
        .await
        .map_err(download_error)?
        .ok_or_else(item_not_found)?;
    tracing::info!(library_id = %item.id, "library item removed");
    state
        .hub
        .emit(AppEvent::library_item_removed(LibraryItemRemovedPayload {
            id: item.id,
            manga_id: item.manga_id,
        }));
    Ok(StatusCode::NO_CONTENT)
}
