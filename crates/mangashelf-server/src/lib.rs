//! HTTP and WebSocket surface of the MangaShelf server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{http::HeaderValue, routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub mod api;
pub mod broadcast;
pub mod state;
pub mod ws;

pub use broadcast::BroadcastHub;
pub use state::AppState;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed cross-origin callers; empty means same-origin only.
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("MANGASHELF_HOST").unwrap_or(defaults.host),
            port: std::env::var("MANGASHELF_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect();
    if origins.is_empty() {
        return CorsLayer::new();
    }
    tracing::info!("CORS allowed origins: {:?}", origins);
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let api_routes = Router::new()
        .route("/health", get(api::health::health))
        .route(
            "/downloads",
            get(api::downloads::list_downloads).post(api::downloads::queue_downloads),
        )
        .route("/downloads/stats", get(api::downloads::download_stats))
        .route(
            "/downloads/{id}",
            get(api::downloads::get_download).delete(api::downloads::cancel_download),
        )
        .route(
            "/downloads/{id}/pages/{page}",
            get(api::downloads::get_page),
        )
        .route(
            "/library",
            get(api::library::list_items).post(api::library::add_item),
        )
        .route(
            "/library/{id}",
            get(api::library::get_item)
                .patch(api::library::update_item)
                .delete(api::library::remove_item),
        );

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws::events_ws))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.addr().unwrap().to_string(), "127.0.0.1:8080");
        assert!(config.cors_origins.is_empty());
    }

    #[test]
    fn test_bad_host_is_an_error() {
        let config = ServerConfig {
            host: "not a host".into(),
            ..Default::default()
        };
        assert!(config.addr().is_err());
    }
}
