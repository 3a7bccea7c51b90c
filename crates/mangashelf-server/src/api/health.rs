use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub loaded_extensions: Vec<String>,
    pub active_downloads: usize,
    pub concurrency: usize,
    pub clients: usize,
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        loaded_extensions: state.runtime.loaded_ids().await,
        active_downloads: state.downloads.active_count(),
        concurrency: state.downloads.concurrency(),
        clients: state.hub.client_count(),
    })
}
