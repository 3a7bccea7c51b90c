//! Download queue endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use mangashelf_db::entities::download;
use mangashelf_download::{DownloadFilters, DownloadStats, DownloadWithPages, QueueDownloadsInput};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{download_error, error_response, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct DownloadListResponse {
    pub downloads: Vec<download::Model>,
}

/// GET /api/downloads?status=&libraryId=&extensionId=
pub async fn list_downloads(
    State(state): State<Arc<AppState>>,
    Query(filters): Query<DownloadFilters>,
) -> Result<Json<DownloadListResponse>, ApiError> {
    let downloads = state
        .downloads
        .list_downloads(&filters)
        .await
        .map_err(download_error)?;
    Ok(Json(DownloadListResponse { downloads }))
}

/// POST /api/downloads
pub async fn queue_downloads(
    State(state): State<Arc<AppState>>,
    Json(input): Json<QueueDownloadsInput>,
) -> Result<(StatusCode, Json<DownloadListResponse>), ApiError> {
    let downloads = state
        .downloads
        .queue_downloads(input)
        .await
        .map_err(download_error)?;
    Ok((StatusCode::ACCEPTED, Json(DownloadListResponse { downloads })))
}

/// GET /api/downloads/stats
pub async fn download_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DownloadStats>, ApiError> {
    let stats = state.downloads.get_stats().await.map_err(download_error)?;
    Ok(Json(stats))
}

/// GET /api/downloads/{id}
pub async fn get_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DownloadWithPages>, ApiError> {
    state
        .downloads
        .get_download_with_pages(id)
        .await
        .map_err(download_error)?
        .map(Json)
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "Download not found"))
}

/// DELETE /api/downloads/{id}
pub async fn cancel_download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .downloads
        .cancel_download(id)
        .await
        .map_err(download_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/downloads/{id}/pages/{page}
pub async fn get_page(
    State(state): State<Arc<AppState>>,
    Path((id, page)): Path<(Uuid, i32)>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state
        .storage
        .page_path(id, page)
        .await
        .ok_or_else(|| error_response(StatusCode::NOT_FOUND, "Page not found"))?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        tracing::error!(download_id = %id, page, "failed to read page file: {e}");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read page")
    })?;

    let content_type = match path.extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}
