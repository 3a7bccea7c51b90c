// Shared test utilities for download pipeline integration tests
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mangashelf_db::entities::download::{self, DownloadStatus};
use mangashelf_db::entities::{downloaded_page, library_item};
use mangashelf_download::repository::{NewDownload, NewPage};
use mangashelf_download::{
    AppEvent, DbDownloadRepository, DbLibraryRepository, DownloadConfig, DownloadDeps,
    DownloadError, DownloadFilters, DownloadManager, DownloadRepository, EventSink,
    LibraryRepository, NewLibraryItem, RetryPolicy,
};
use mangashelf_extension::{
    ChapterPayload, DbExtensionRegistry, ExtensionContext, ExtensionError, ExtensionManifest,
    ExtensionModule, ExtensionRecord, ExtensionRegistry, ExtensionRuntime, HttpConfig,
    LoadedSource, ModuleEvaluator, RuntimeConfig, ScopedHttpClient, SourceLoader,
};
use mangashelf_migration::{Migrator, MigratorTrait};
use mangashelf_storage::PageStorage;
use sea_orm::{Database, DatabaseConnection};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::MockServer;

pub const PAGE_BYTES: &[u8] = b"\x89PNG fake page";

/// Builds a `getPages` result from the server base URL and a chapter id.
pub type PagesFn = Arc<dyn Fn(&str, &str) -> Value + Send + Sync>;

/// `count` pages served at `{base}/{chapter}/{n}.png`.
pub fn numbered_pages(count: usize) -> PagesFn {
    Arc::new(move |base, chapter| {
        let pages: Vec<Value> = (1..=count)
            .map(|n| json!({"index": n - 1, "imageUrl": format!("{base}/{chapter}/{n}.png")}))
            .collect();
        json!({ "pages": pages })
    })
}

// ─── Event recording ────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AppEvent>>,
}

impl EventSink for RecordingSink {
    fn emit(&self, event: AppEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingSink {
    pub fn for_download(&self, id: Uuid) -> Vec<AppEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.download_id == Some(id))
            .cloned()
            .collect()
    }

    pub fn names_for(&self, id: Uuid) -> Vec<&'static str> {
        self.for_download(id).iter().map(|e| e.name).collect()
    }
}

// ─── In-process extension ───────────────────────────────────────────

struct FakeSource {
    pages: PagesFn,
}

impl ExtensionModule for FakeSource {
    fn has_method(&self, method: &str) -> bool {
        method == "getPages"
    }

    fn call(
        &mut self,
        _method: &str,
        payload: &[u8],
        ctx: &ExtensionContext,
    ) -> Result<Vec<u8>, ExtensionError> {
        let payload: ChapterPayload = serde_json::from_slice(payload)?;
        let base = ctx.settings()["baseUrl"].as_str().unwrap_or_default().to_string();
        Ok(serde_json::to_vec(&(self.pages)(&base, &payload.chapter_id))?)
    }
}

struct FakeEvaluator {
    pages: PagesFn,
}

impl ModuleEvaluator for FakeEvaluator {
    fn evaluate(
        &self,
        _record: &ExtensionRecord,
        _source: &LoadedSource,
    ) -> Result<Box<dyn ExtensionModule>, ExtensionError> {
        Ok(Box::new(FakeSource {
            pages: self.pages.clone(),
        }))
    }
}

struct MemoryLoader;

#[async_trait]
impl SourceLoader for MemoryLoader {
    async fn load_source(&self, record: &ExtensionRecord) -> Result<LoadedSource, ExtensionError> {
        Ok(LoadedSource {
            entry_path: record.entry_path(),
            code: Arc::new(Vec::new()),
        })
    }

    async fn unload(&self, _record: &ExtensionRecord) {}
}

// ─── Fault injection ────────────────────────────────────────────────

/// Misbehaviour layered over the real repository.
pub enum Fault {
    /// The first non-empty `get_queued` cancels its first row before
    /// returning it, as if a user cancel landed mid-pump.
    CancelFirstQueuedOnce,
    /// `update_total_pages` panics inside the worker.
    PanicOnTotalPages,
    /// `add_page` stalls before writing, leaving a save in flight.
    SlowPageWrite(Duration),
}

struct FaultyRepository {
    inner: Arc<DbDownloadRepository>,
    fault: Fault,
    fired: AtomicBool,
}

#[async_trait]
impl DownloadRepository for FaultyRepository {
    async fn create(&self, input: NewDownload) -> Result<download::Model, DownloadError> {
        self.inner.create(input).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<download::Model>, DownloadError> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_library_and_chapter(
        &self,
        library_id: Uuid,
        chapter_id: &str,
    ) -> Result<Option<download::Model>, DownloadError> {
        self.inner
            .find_by_library_and_chapter(library_id, chapter_id)
            .await
    }

    async fn list(&self, filters: &DownloadFilters) -> Result<Vec<download::Model>, DownloadError> {
        self.inner.list(filters).await
    }

    async fn get_queued(&self, limit: u64) -> Result<Vec<download::Model>, DownloadError> {
        let queued = self.inner.get_queued(limit).await?;
        if let (Fault::CancelFirstQueuedOnce, Some(first)) = (&self.fault, queued.first()) {
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.inner.mark_cancelled(first.id).await?;
            }
        }
        Ok(queued)
    }

    async fn count(&self) -> Result<u64, DownloadError> {
        self.inner.count().await
    }

    async fn delete(&self, id: Uuid) -> Result<(), DownloadError> {
        self.inner.delete(id).await
    }

    async fn mark_downloading(&self, id: Uuid) -> Result<bool, DownloadError> {
        self.inner.mark_downloading(id).await
    }

    async fn mark_completed(&self, id: Uuid) -> Result<bool, DownloadError> {
        self.inner.mark_completed(id).await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, DownloadError> {
        self.inner.mark_failed(id, error).await
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<bool, DownloadError> {
        self.inner.mark_cancelled(id).await
    }

    async fn requeue_stuck(&self) -> Result<Vec<Uuid>, DownloadError> {
        self.inner.requeue_stuck().await
    }

    async fn update_total_pages(&self, id: Uuid, total_pages: i32) -> Result<(), DownloadError> {
        if matches!(self.fault, Fault::PanicOnTotalPages) {
            panic!("total pages write blew up");
        }
        self.inner.update_total_pages(id, total_pages).await
    }

    async fn update_progress(&self, id: Uuid, progress: i32) -> Result<(), DownloadError> {
        self.inner.update_progress(id, progress).await
    }

    async fn add_page(&self, page: NewPage) -> Result<downloaded_page::Model, DownloadError> {
        if let Fault::SlowPageWrite(delay) = self.fault {
            tokio::time::sleep(delay).await;
        }
        self.inner.add_page(page).await
    }

    async fn list_pages(&self, id: Uuid) -> Result<Vec<downloaded_page::Model>, DownloadError> {
        self.inner.list_pages(id).await
    }

    async fn remove_pages(&self, id: Uuid) -> Result<u64, DownloadError> {
        self.inner.remove_pages(id).await
    }
}

// ─── Harness ────────────────────────────────────────────────────────

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub db: DatabaseConnection,
    pub server: MockServer,
    pub manager: DownloadManager,
    pub repo: Arc<DbDownloadRepository>,
    pub library: Arc<DbLibraryRepository>,
    pub storage: Arc<PageStorage>,
    pub events: Arc<RecordingSink>,
    pub item: library_item::Model,
}

pub async fn harness(concurrency: usize, pages: PagesFn) -> Harness {
    harness_with(concurrency, pages, RuntimeConfig::default().timeout, None).await
}

/// Like [`harness`], with an extension call budget and an optional
/// repository fault.
pub async fn harness_with(
    concurrency: usize,
    pages: PagesFn,
    extension_timeout: Option<Duration>,
    fault: Option<Fault>,
) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", tmp.path().join("test.db").display());
    let db = Database::connect(&url).await.unwrap();
    Migrator::up(&db, None).await.unwrap();

    let server = MockServer::start().await;

    let manifest = ExtensionManifest::parse(&format!(
        "[extension]\nid = \"demo\"\nname = \"Demo\"\nversion = \"1.0.0\"\nentry = \"demo.wasm\"\n\n[settings]\nbaseUrl = \"{}\"",
        server.uri()
    ))
    .unwrap();
    let record = ExtensionRecord::from_manifest(manifest, tmp.path().join("ext"));
    let registry = Arc::new(DbExtensionRegistry::new(db.clone()));
    registry.upsert(&record).await.unwrap();

    let http = ScopedHttpClient::new(&HttpConfig::default()).unwrap();
    let runtime = Arc::new(ExtensionRuntime::new(
        RuntimeConfig {
            timeout: extension_timeout,
            ..RuntimeConfig::default()
        },
        Arc::new(MemoryLoader),
        Arc::new(FakeEvaluator { pages }),
        http.clone(),
    ));

    let repo = Arc::new(DbDownloadRepository::new(db.clone()));
    let repository: Arc<dyn DownloadRepository> = match fault {
        Some(fault) => Arc::new(FaultyRepository {
            inner: repo.clone(),
            fault,
            fired: AtomicBool::new(false),
        }),
        None => repo.clone(),
    };
    let library = Arc::new(DbLibraryRepository::new(db.clone()));
    let storage = Arc::new(PageStorage::new(tmp.path().join("downloads")));
    let events = Arc::new(RecordingSink::default());

    let item = library
        .create(NewLibraryItem {
            manga_id: "m-1".into(),
            extension_id: "demo".into(),
            title: "Demo Manga".into(),
            cover_url: None,
            status: "reading".into(),
            favorite: false,
        })
        .await
        .unwrap();

    let manager = DownloadManager::new(
        DownloadDeps {
            repository,
            library: library.clone(),
            storage: storage.clone(),
            registry,
            runtime,
            http,
            events: events.clone(),
        },
        DownloadConfig {
            concurrency,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            },
        },
    );

    Harness {
        tmp,
        db,
        server,
        manager,
        repo,
        library,
        storage,
        events,
        item,
    }
}

impl Harness {
    pub fn input(&self, chapters: &[&str]) -> mangashelf_download::QueueDownloadsInput {
        mangashelf_download::QueueDownloadsInput {
            library_id: self.item.id,
            extension_id: "demo".into(),
            chapter_ids: chapters.iter().map(|c| c.to_string()).collect(),
            chapter_numbers: Default::default(),
        }
    }

    pub async fn wait_for_status(&self, id: Uuid, status: DownloadStatus) -> download::Model {
        let manager = self.manager.clone();
        wait_until(Duration::from_secs(10), || {
            let manager = manager.clone();
            async move {
                manager
                    .get_download(id)
                    .await
                    .unwrap()
                    .is_some_and(|d| d.status == status)
            }
        })
        .await;
        self.manager.get_download(id).await.unwrap().unwrap()
    }

    pub async fn wait_idle(&self) {
        let manager = self.manager.clone();
        wait_until(Duration::from_secs(10), || {
            let manager = manager.clone();
            async move { manager.active_count() == 0 }
        })
        .await;
    }

    /// Files on disk for a download.
    pub fn files_for(&self, id: Uuid) -> usize {
        std::fs::read_dir(self.storage.download_dir(id))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Requests the mock server received for `path`.
    pub async fn hits(&self, path: &str) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|r| r.url.path() == path)
            .count()
    }
}

pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
