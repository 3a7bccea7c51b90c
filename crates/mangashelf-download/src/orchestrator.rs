//! Download orchestrator: the only writer of a Download's top-level status.
//!
//! # Concurrency model
//!
//! - A single dispatcher task reads "queue changed" signals from a bounded
//!   channel of capacity 1. `try_send` coalesces bursts; a signal that arrives
//!   mid-pump stays buffered and causes one more pump.
//! - A pump fills free slots with queued rows in FIFO order. The pump owns the
//!   queued → downloading transition, so a row is never started twice.
//! - Every worker holds a [`SlotGuard`]; dropping it frees the slot and
//!   re-signals the dispatcher. A worker that panics is recorded as failed
//!   before its slot is freed.
//! - Admission (`queue_downloads`) is serialised by a mutex.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::downloader::{ChapterDownloader, RetryPolicy};
use crate::error::DownloadError;
use crate::events::{
    AppEvent, DownloadCancelledPayload, DownloadFailedPayload, DownloadStartedPayload, EventSink,
};
use crate::repository::{DownloadFilters, DownloadRepository, LibraryRepository, NewDownload};
use mangashelf_db::entities::download::{self, DownloadStatus};
use mangashelf_db::entities::downloaded_page;
use mangashelf_extension::{ExtensionRegistry, ExtensionRuntime, ScopedHttpClient};
use mangashelf_storage::PageStore;

pub const DEFAULT_CONCURRENCY: usize = 3;

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum simultaneous downloads.
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

impl DownloadConfig {
    pub fn from_env() -> Self {
        let concurrency = std::env::var("DOWNLOAD_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_CONCURRENCY);
        let max_attempts = std::env::var("DOWNLOAD_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(3);
        let delay_ms = std::env::var("DOWNLOAD_RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(500);
        Self {
            concurrency,
            retry: RetryPolicy {
                max_attempts,
                base_delay: Duration::from_millis(delay_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDownloadsInput {
    pub library_id: Uuid,
    pub extension_id: String,
    pub chapter_ids: Vec<String>,
    /// Optional display numbers keyed by chapter id.
    #[serde(default)]
    pub chapter_numbers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStats {
    pub download_count: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadWithPages {
    pub download: download::Model,
    pub pages: Vec<downloaded_page::Model>,
}

/// Collaborators the orchestrator is built from.
pub struct DownloadDeps {
    pub repository: Arc<dyn DownloadRepository>,
    pub library: Arc<dyn LibraryRepository>,
    pub storage: Arc<dyn PageStore>,
    pub registry: Arc<dyn ExtensionRegistry>,
    pub runtime: Arc<ExtensionRuntime>,
    pub http: ScopedHttpClient,
    pub events: Arc<dyn EventSink>,
}

struct Inner {
    repository: Arc<dyn DownloadRepository>,
    library: Arc<dyn LibraryRepository>,
    storage: Arc<dyn PageStore>,
    events: Arc<dyn EventSink>,
    downloader: ChapterDownloader,
    concurrency: usize,
    /// Running downloads and their cancellation tokens; its size is the
    /// admission counter.
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    admission: tokio::sync::Mutex<()>,
    signal_tx: mpsc::Sender<()>,
    signal_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("concurrency", &self.inner.concurrency)
            .field("active", &self.inner.active_count())
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    pub fn new(deps: DownloadDeps, config: DownloadConfig) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(1);
        let downloader = ChapterDownloader::new(
            deps.registry,
            deps.runtime,
            deps.repository.clone(),
            deps.storage.clone(),
            deps.http,
            deps.events.clone(),
            config.retry,
        );
        Self {
            inner: Arc::new(Inner {
                repository: deps.repository,
                library: deps.library,
                storage: deps.storage,
                events: deps.events,
                downloader,
                concurrency: config.concurrency.max(1),
                active: Mutex::new(HashMap::new()),
                admission: tokio::sync::Mutex::new(()),
                signal_tx,
                signal_rx: Mutex::new(Some(signal_rx)),
            }),
        }
    }

    /// Requeue downloads orphaned in `downloading` (purging their pages and
    /// files), start the dispatcher and pump once. Later calls are no-ops.
    pub async fn initialize(&self) -> Result<(), DownloadError> {
        let started = self
            .inner
            .signal_rx
            .lock()
            .map(|rx| rx.is_none())
            .unwrap_or(true);
        if started {
            return Ok(());
        }

        let requeued = self.inner.repository.requeue_stuck().await?;
        for id in &requeued {
            self.inner.purge_artifacts(*id).await?;
        }
        if !requeued.is_empty() {
            tracing::info!(count = requeued.len(), "requeued interrupted downloads");
        }

        let rx = self.inner.signal_rx.lock().ok().and_then(|mut rx| rx.take());
        if let Some(rx) = rx {
            tokio::spawn(run_dispatcher(Arc::downgrade(&self.inner), rx));
            tracing::info!(concurrency = self.inner.concurrency, "download dispatcher started");
        }
        self.inner.signal();
        Ok(())
    }

    pub async fn queue_downloads(
        &self,
        input: QueueDownloadsInput,
    ) -> Result<Vec<download::Model>, DownloadError> {
        if input.chapter_ids.is_empty() {
            return Err(DownloadError::Validation(
                "At least one chapterId is required".into(),
            ));
        }
        if input.chapter_ids.iter().any(|c| c.trim().is_empty()) {
            return Err(DownloadError::Validation(
                "chapterId must not be empty".into(),
            ));
        }

        let created = {
            let _admission = self.inner.admission.lock().await;

            let item = self
                .inner
                .library
                .get(input.library_id)
                .await?
                .ok_or_else(|| DownloadError::Validation("Library item not found".into()))?;
            if item.extension_id != input.extension_id {
                return Err(DownloadError::Validation(
                    "Extension ID does not match the library item".into(),
                ));
            }

            let mut seen = HashSet::new();
            let mut created = Vec::new();
            for chapter_id in &input.chapter_ids {
                if !seen.insert(chapter_id.as_str()) {
                    continue;
                }

                if let Some(existing) = self
                    .inner
                    .repository
                    .find_by_library_and_chapter(input.library_id, chapter_id)
                    .await?
                {
                    if !matches!(
                        existing.status,
                        DownloadStatus::Failed | DownloadStatus::Cancelled
                    ) {
                        continue;
                    }
                    self.inner.repository.delete(existing.id).await?;
                    self.inner.storage.delete_download(existing.id).await?;
                }

                let download = self
                    .inner
                    .repository
                    .create(NewDownload {
                        library_id: input.library_id,
                        chapter_id: chapter_id.clone(),
                        extension_id: input.extension_id.clone(),
                        chapter_number: input.chapter_numbers.get(chapter_id).cloned(),
                    })
                    .await?;
                created.push(download);
            }
            created
        };

        if !created.is_empty() {
            tracing::info!(
                library_id = %input.library_id,
                count = created.len(),
                "queued chapter downloads"
            );
            self.inner.signal();
        }
        Ok(created)
    }

    pub async fn cancel_download(&self, id: Uuid) -> Result<(), DownloadError> {
        let download = self
            .inner
            .repository
            .find_by_id(id)
            .await?
            .ok_or(DownloadError::NotFound(id))?;
        check_cancellable(download.status)?;
        if download.status == DownloadStatus::Cancelled {
            return Ok(());
        }

        if !self.inner.repository.mark_cancelled(id).await? {
            // the status moved between the read and the write
            let current = self
                .inner
                .repository
                .find_by_id(id)
                .await?
                .ok_or(DownloadError::NotFound(id))?;
            return check_cancellable(current.status);
        }

        if let Some(token) = self.inner.token(id) {
            token.cancel();
        }
        self.inner.purge_artifacts(id).await?;

        tracing::info!(download_id = %id, "download cancelled");
        // a queued row may have been claimed by a pump in flight
        self.inner.signal();
        self.inner
            .events
            .emit(AppEvent::download_cancelled(DownloadCancelledPayload {
                download_id: id,
                chapter_id: download.chapter_id,
            }));
        Ok(())
    }

    /// Cancel active downloads of a library item and delete the files of all
    /// of its downloads. Rows are removed by the database cascade.
    pub async fn purge_library_item(&self, library_id: Uuid) -> Result<(), DownloadError> {
        let downloads = self
            .inner
            .repository
            .list(&DownloadFilters {
                library_id: Some(library_id),
                ..Default::default()
            })
            .await?;
        for download in downloads {
            if download.status.is_active() {
                self.cancel_download(download.id).await?;
            } else {
                self.inner.storage.delete_download(download.id).await?;
            }
        }
        Ok(())
    }

    pub async fn list_downloads(
        &self,
        filters: &DownloadFilters,
    ) -> Result<Vec<download::Model>, DownloadError> {
        self.inner.repository.list(filters).await
    }

    pub async fn get_download(&self, id: Uuid) -> Result<Option<download::Model>, DownloadError> {
        self.inner.repository.find_by_id(id).await
    }

    pub async fn get_download_with_pages(
        &self,
        id: Uuid,
    ) -> Result<Option<DownloadWithPages>, DownloadError> {
        let Some(download) = self.inner.repository.find_by_id(id).await? else {
            return Ok(None);
        };
        let pages = self.inner.repository.list_pages(id).await?;
        Ok(Some(DownloadWithPages { download, pages }))
    }

    pub async fn get_stats(&self) -> Result<DownloadStats, DownloadError> {
        let storage = self.inner.storage.usage_stats().await?;
        let download_count = self.inner.repository.count().await?;
        Ok(DownloadStats {
            download_count,
            total_size: storage.total_size,
        })
    }

    /// Downloads currently holding a slot.
    pub fn active_count(&self) -> usize {
        self.inner.active_count()
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }
}

fn check_cancellable(status: DownloadStatus) -> Result<(), DownloadError> {
    match status {
        DownloadStatus::Completed | DownloadStatus::Failed => Err(DownloadError::Validation(
            "Cannot cancel a completed or failed download".into(),
        )),
        _ => Ok(()),
    }
}

async fn run_dispatcher(inner: Weak<Inner>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.pump().await;
    }
    tracing::debug!("download dispatcher stopped");
}

/// Frees the worker's slot and wakes the dispatcher when dropped.
struct SlotGuard {
    inner: Arc<Inner>,
    id: Uuid,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release(self.id);
        self.inner.signal();
    }
}

impl Inner {
    fn signal(&self) {
        // a full buffer already guarantees another pump
        let _ = self.signal_tx.try_send(());
    }

    fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn token(&self, id: Uuid) -> Option<CancellationToken> {
        self.active.lock().ok().and_then(|a| a.get(&id).cloned())
    }

    async fn purge_artifacts(&self, id: Uuid) -> Result<(), DownloadError> {
        self.repository.remove_pages(id).await?;
        self.storage.delete_download(id).await?;
        Ok(())
    }

    async fn pump(self: &Arc<Self>) {
        loop {
            let available = self.concurrency.saturating_sub(self.active_count());
            if available == 0 {
                return;
            }

            let queued = match self.repository.get_queued(available as u64).await {
                Ok(queued) => queued,
                Err(e) => {
                    tracing::error!("failed to read download queue: {e}");
                    return;
                }
            };
            if queued.is_empty() {
                return;
            }

            // rows that left `queued` before we could claim them
            let mut skipped = 0;
            let mut started = 0;
            for download in queued {
                if self.active_count() >= self.concurrency {
                    break;
                }
                // register first so a cancel racing the start finds the token
                let token = CancellationToken::new();
                if let Ok(mut active) = self.active.lock() {
                    active.insert(download.id, token.clone());
                }
                match self.repository.mark_downloading(download.id).await {
                    Ok(true) => {
                        self.start_worker(download, token);
                        started += 1;
                    }
                    Ok(false) => {
                        self.release(download.id);
                        skipped += 1;
                    }
                    Err(e) => {
                        tracing::error!(download_id = %download.id, "failed to start download: {e}");
                        self.release(download.id);
                    }
                }
            }
            if started == 0 && skipped == 0 {
                return;
            }
        }
    }

    fn release(&self, id: Uuid) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&id);
        }
    }

    fn start_worker(self: &Arc<Self>, download: download::Model, token: CancellationToken) {
        let guard = SlotGuard {
            inner: self.clone(),
            id: download.id,
        };
        let inner = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let id = download.id;
            let chapter_id = download.chapter_id.clone();
            let worker = {
                let inner = inner.clone();
                let token = token.clone();
                tokio::spawn(async move { inner.run_download(download, token).await })
            };
            if let Err(e) = worker.await {
                if token.is_cancelled() {
                    return;
                }
                let message = if e.is_panic() {
                    "Download worker panicked".to_string()
                } else {
                    format!("Download worker stopped: {e}")
                };
                inner.fail(id, chapter_id, message).await;
            }
        });
    }

    async fn run_download(&self, download: download::Model, token: CancellationToken) {
        let id = download.id;
        let result = self.execute_download(&download, &token).await;

        match result {
            Ok(()) => {
                tracing::info!(download_id = %id, chapter_id = %download.chapter_id, "download completed");
            }
            Err(e) if e.is_cancelled() || token.is_cancelled() => {
                tracing::debug!(download_id = %id, "download stopped after cancellation");
                // late writes must not survive the cancel
                if let Err(e) = self.purge_artifacts(id).await {
                    tracing::warn!(download_id = %id, "failed to purge cancelled download: {e}");
                }
            }
            Err(e) => self.fail(id, download.chapter_id.clone(), e.to_string()).await,
        }
    }

    /// Mark a downloading row failed and announce it.
    async fn fail(&self, id: Uuid, chapter_id: String, message: String) {
        tracing::error!(download_id = %id, error = %message, "download failed");
        match self.repository.mark_failed(id, &message).await {
            Ok(true) => self.events.emit(AppEvent::download_failed(DownloadFailedPayload {
                download_id: id,
                chapter_id,
                error: message,
            })),
            Ok(false) => {}
            Err(db) => tracing::error!(download_id = %id, "failed to record failure: {db}"),
        }
    }

    async fn execute_download(
        &self,
        download: &download::Model,
        token: &CancellationToken,
    ) -> Result<(), DownloadError> {
        self.purge_artifacts(download.id).await?;

        let item = self
            .library
            .get(download.library_id)
            .await?
            .ok_or_else(|| DownloadError::Validation("Library item not found".into()))?;

        self.events
            .emit(AppEvent::download_started(DownloadStartedPayload {
                download_id: download.id,
                manga_id: item.manga_id.clone(),
                chapter_id: download.chapter_id.clone(),
            }));

        self.downloader
            .download_chapter(download, &item, token)
            .await?;

        if token.is_cancelled() || !self.repository.mark_completed(download.id).await? {
            return Err(DownloadError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = DownloadConfig::default();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_config_from_env() {
        std::env::set_var("DOWNLOAD_CONCURRENCY", "5");
        std::env::set_var("DOWNLOAD_MAX_ATTEMPTS", "0");
        std::env::set_var("DOWNLOAD_RETRY_DELAY_MS", "25");
        let config = DownloadConfig::from_env();
        assert_eq!(config.concurrency, 5);
        // zero attempts is rejected
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_millis(25));
        std::env::remove_var("DOWNLOAD_CONCURRENCY");
        std::env::remove_var("DOWNLOAD_MAX_ATTEMPTS");
        std::env::remove_var("DOWNLOAD_RETRY_DELAY_MS");
    }

    #[test]
    fn test_check_cancellable() {
        assert!(check_cancellable(DownloadStatus::Queued).is_ok());
        assert!(check_cancellable(DownloadStatus::Downloading).is_ok());
        assert!(check_cancellable(DownloadStatus::Cancelled).is_ok());
        assert!(check_cancellable(DownloadStatus::Completed)
            .unwrap_err()
            .is_validation());
        assert!(check_cancellable(DownloadStatus::Failed).is_err());
    }

    #[test]
    fn test_queue_input_deserialization() {
        let input: QueueDownloadsInput = serde_json::from_value(serde_json::json!({
            "libraryId": "7d4f7f4c-9d55-4c4a-8f1a-0c8f5c8a1b2c",
            "extensionId": "demo",
            "chapterIds": ["ch-1", "ch-2"],
            "chapterNumbers": {"ch-1": "1"}
        }))
        .unwrap();
        assert_eq!(input.chapter_ids.len(), 2);
        assert_eq!(input.chapter_numbers.get("ch-1").map(String::as_str), Some("1"));

        let input: QueueDownloadsInput = serde_json::from_value(serde_json::json!({
            "libraryId": "7d4f7f4c-9d55-4c4a-8f1a-0c8f5c8a1b2c",
            "extensionId": "demo",
            "chapterIds": []
        }))
        .unwrap();
        assert!(input.chapter_numbers.is_empty());
    }
}
