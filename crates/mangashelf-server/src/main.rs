use std::path::Path;
use std::sync::Arc;

use mangashelf_download::DownloadConfig;
use mangashelf_extension::{
    bootstrap_local_registry, ExtensionRuntime, FsSourceLoader, HttpConfig, RuntimeConfig,
    SandboxConfig, ScopedHttpClient, WasmEvaluator,
};
use mangashelf_server::{build_router, AppState, ServerConfig};
use mangashelf_storage::PageStorage;
use sea_orm_migration::MigratorTrait;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type StartupError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        tracing::error!("server failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    // Database connection
    let db_config = mangashelf_db::DatabaseConfig::from_env();
    ensure_sqlite_dir(&db_config.url).await?;
    tracing::info!("connecting to database...");
    let db = mangashelf_db::connect(&db_config).await?;

    tracing::info!("running database migrations...");
    mangashelf_migration::Migrator::up(&db, None).await?;
    tracing::info!("migrations complete");

    // Extension runtime
    let http = ScopedHttpClient::new(&HttpConfig::from_env())?;
    let runtime_config = RuntimeConfig::from_env();
    let install_dir = runtime_config.install_dir.clone();
    let runtime = Arc::new(ExtensionRuntime::new(
        runtime_config,
        Arc::new(FsSourceLoader::new()),
        Arc::new(WasmEvaluator::new(SandboxConfig::from_env())),
        http.clone(),
    ));

    let storage = Arc::new(PageStorage::from_env());
    tracing::info!(dir = %storage.base().display(), "page storage ready");

    let state = AppState::new(
        db,
        storage,
        runtime.clone(),
        http,
        DownloadConfig::from_env(),
    );

    let registered =
        bootstrap_local_registry(&install_dir, state.registry.as_ref(), &runtime).await?;
    tracing::info!(count = registered.len(), "local extensions registered");

    state.downloads.initialize().await?;

    let config = ServerConfig::from_env();
    let addr = config.addr()?;
    let app = build_router(state.clone(), &config);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, disposing extensions");
    runtime.dispose_all().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
}

/// SQLite will not create missing parent directories for `mode=rwc`.
async fn ensure_sqlite_dir(url: &str) -> std::io::Result<()> {
    let Some(rest) = url.strip_prefix("sqlite://") else {
        return Ok(());
    };
    let file = rest.split('?').next().unwrap_or_default();
    if file.is_empty() || file.starts_with(':') {
        return Ok(());
    }
    match Path::new(file).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => tokio::fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}
