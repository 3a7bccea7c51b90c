//! Lifecycle events emitted by the download pipeline and the library.

use serde::Serialize;
use uuid::Uuid;

pub const DOWNLOAD_STARTED: &str = "download:started";
pub const DOWNLOAD_PROGRESS: &str = "download:progress";
pub const DOWNLOAD_PAGE_COMPLETE: &str = "download:page:complete";
pub const DOWNLOAD_CHAPTER_COMPLETE: &str = "download:chapter:complete";
pub const DOWNLOAD_FAILED: &str = "download:failed";
pub const DOWNLOAD_CANCELLED: &str = "download:cancelled";
pub const LIBRARY_ITEM_ADDED: &str = "library:item:added";
pub const LIBRARY_ITEM_UPDATED: &str = "library:item:updated";
pub const LIBRARY_ITEM_REMOVED: &str = "library:item:removed";

/// An event with its JSON payload. `download_id` scopes the event for
/// subscribers; unscoped events reach every client.
#[derive(Debug, Clone, PartialEq)]
pub struct AppEvent {
    pub name: &'static str,
    pub download_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl AppEvent {
    fn scoped(name: &'static str, download_id: Uuid, payload: impl Serialize) -> Self {
        Self {
            name,
            download_id: Some(download_id),
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    fn unscoped(name: &'static str, payload: impl Serialize) -> Self {
        Self {
            name,
            download_id: None,
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }

    pub fn download_started(p: DownloadStartedPayload) -> Self {
        Self::scoped(DOWNLOAD_STARTED, p.download_id, p)
    }

    pub fn download_progress(p: DownloadProgressPayload) -> Self {
        Self::scoped(DOWNLOAD_PROGRESS, p.download_id, p)
    }

    pub fn page_complete(p: PageCompletePayload) -> Self {
        Self::scoped(DOWNLOAD_PAGE_COMPLETE, p.download_id, p)
    }

    pub fn chapter_complete(p: ChapterCompletePayload) -> Self {
        Self::scoped(DOWNLOAD_CHAPTER_COMPLETE, p.download_id, p)
    }

    pub fn download_failed(p: DownloadFailedPayload) -> Self {
        Self::scoped(DOWNLOAD_FAILED, p.download_id, p)
    }

    pub fn download_cancelled(p: DownloadCancelledPayload) -> Self {
        Self::scoped(DOWNLOAD_CANCELLED, p.download_id, p)
    }

    pub fn library_item_added(item: impl Serialize) -> Self {
        Self::unscoped(LIBRARY_ITEM_ADDED, item)
    }

    pub fn library_item_updated(item: impl Serialize) -> Self {
        Self::unscoped(LIBRARY_ITEM_UPDATED, item)
    }

    pub fn library_item_removed(p: LibraryItemRemovedPayload) -> Self {
        Self::unscoped(LIBRARY_ITEM_REMOVED, p)
    }
}

/// Receives events from the pipeline. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: AppEvent);
}

// ─── Event payload types ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStartedPayload {
    pub download_id: Uuid,
    pub manga_id: String,
    pub chapter_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressPayload {
    pub download_id: Uuid,
    pub chapter_id: String,
    pub current_page: i32,
    pub total_pages: i32,
    pub percentage: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCompletePayload {
    pub download_id: Uuid,
    pub chapter_id: String,
    pub page_number: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterCompletePayload {
    pub download_id: Uuid,
    pub chapter_id: String,
    pub total_pages: i32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFailedPayload {
    pub download_id: Uuid,
    pub chapter_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadCancelledPayload {
    pub download_id: Uuid,
    pub chapter_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItemRemovedPayload {
    pub id: Uuid,
    pub manga_id: String,
}
