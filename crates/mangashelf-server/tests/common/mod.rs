// Shared test utilities for server integration tests
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use mangashelf_download::DownloadConfig;
use mangashelf_extension::{
    ExtensionRuntime, FsSourceLoader, HttpConfig, RuntimeConfig, SandboxConfig, ScopedHttpClient,
    WasmEvaluator,
};
use mangashelf_migration::{Migrator, MigratorTrait};
use mangashelf_server::{build_router, AppState, ServerConfig};
use mangashelf_storage::PageStorage;
use serde_json::Value;
use tower::ServiceExt;

/// Create a test AppState over a temporary SQLite file and page directory.
/// The download manager is not started, so queued rows stay queued.
pub async fn test_app_state(tmp_dir: &std::path::Path) -> Arc<AppState> {
    let url = format!("sqlite://{}?mode=rwc", tmp_dir.join("test.db").display());
    let db = sea_orm::Database::connect(&url).await.unwrap();
    Migrator::up(&db, None).await.unwrap();

    let http = ScopedHttpClient::new(&HttpConfig::default()).unwrap();
    let runtime = Arc::new(ExtensionRuntime::new(
        RuntimeConfig {
            install_dir: tmp_dir.join("extensions"),
            ..Default::default()
        },
        Arc::new(FsSourceLoader::new()),
        Arc::new(WasmEvaluator::new(SandboxConfig::default())),
        http.clone(),
    ));

    AppState::new(
        db,
        Arc::new(PageStorage::new(tmp_dir.join("downloads"))),
        runtime,
        http,
        DownloadConfig::default(),
    )
}

pub fn test_router(state: Arc<AppState>) -> Router {
    build_router(state, &ServerConfig::default())
}

/// Send one request and return the status with the parsed JSON body
/// (`Value::Null` for an empty body).
pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}
