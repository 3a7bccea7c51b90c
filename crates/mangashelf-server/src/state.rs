use std::sync::Arc;

use mangashelf_download::{
    DbDownloadRepository, DbLibraryRepository, DownloadConfig, DownloadDeps, DownloadManager,
    LibraryRepository,
};
use mangashelf_extension::{DbExtensionRegistry, ExtensionRegistry, ExtensionRuntime, ScopedHttpClient};
use mangashelf_storage::PageStore;
use sea_orm::DatabaseConnection;

use crate::broadcast::BroadcastHub;

/// Shared application state handed to every handler.
pub struct AppState {
    pub db: DatabaseConnection,
    pub downloads: DownloadManager,
    pub library: Arc<dyn LibraryRepository>,
    pub storage: Arc<dyn PageStore>,
    pub registry: Arc<dyn ExtensionRegistry>,
    pub runtime: Arc<ExtensionRuntime>,
    pub hub: Arc<BroadcastHub>,
}

impl AppState {
    /// Wire repositories, the download manager and the broadcast hub over
    /// one database connection. The manager is not started.
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn PageStore>,
        runtime: Arc<ExtensionRuntime>,
        http: ScopedHttpClient,
        config: DownloadConfig,
    ) -> Arc<Self> {
        let hub = Arc::new(BroadcastHub::new());
        let registry: Arc<dyn ExtensionRegistry> = Arc::new(DbExtensionRegistry::new(db.clone()));
        let library: Arc<dyn LibraryRepository> = Arc::new(DbLibraryRepository::new(db.clone()));

        let downloads = DownloadManager::new(
            DownloadDeps {
                repository: Arc::new(DbDownloadRepository::new(db.clone())),
                library: library.clone(),
                storage: storage.clone(),
                registry: registry.clone(),
                runtime: runtime.clone(),
                http,
                events: hub.clone(),
            },
            config,
        );

        Arc::new(Self {
            db,
            downloads,
            library,
            storage,
            registry,
            runtime,
            hub,
        })
    }
}
