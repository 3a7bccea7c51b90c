//! Chapter downloader: one Download plus its library item in, persisted
//! pages out.
//!
//! Pages are fetched strictly in page-number order. Each fetch gets a fixed
//! number of attempts with linear backoff and races the cancellation token,
//! so a cancel aborts the in-flight request instead of waiting for it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;
use crate::events::{
    AppEvent, ChapterCompletePayload, DownloadProgressPayload, EventSink, PageCompletePayload,
};
use crate::repository::{DownloadRepository, NewPage};
use mangashelf_db::entities::{download, library_item};
use mangashelf_extension::types::METHOD_GET_PAGES;
use mangashelf_extension::{
    ChapterPayload, ExtensionError, ExtensionRegistry, ExtensionRuntime, FetchedBody, Page,
    PagesResult, ScopedHttpClient,
};
use mangashelf_storage::{normalize_extension, PageStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Linear backoff: the wait after attempt `n` is `n × base_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

pub struct ChapterDownloader {
    registry: Arc<dyn ExtensionRegistry>,
    runtime: Arc<ExtensionRuntime>,
    repository: Arc<dyn DownloadRepository>,
    storage: Arc<dyn PageStore>,
    http: ScopedHttpClient,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
}

impl ChapterDownloader {
    pub fn new(
        registry: Arc<dyn ExtensionRegistry>,
        runtime: Arc<ExtensionRuntime>,
        repository: Arc<dyn DownloadRepository>,
        storage: Arc<dyn PageStore>,
        http: ScopedHttpClient,
        events: Arc<dyn EventSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            runtime,
            repository,
            storage,
            http,
            events,
            retry,
        }
    }

    pub async fn download_chapter(
        &self,
        download: &download::Model,
        item: &library_item::Model,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let record = self
            .registry
            .find_by_id(&download.extension_id)
            .await?
            .ok_or_else(|| {
                DownloadError::Validation(format!(
                    "Extension {} not found for download {}",
                    download.extension_id, download.id
                ))
            })?;

        self.runtime.initialise(&record).await?;

        let payload = serde_json::to_value(ChapterPayload {
            manga_id: item.manga_id.clone(),
            chapter_id: download.chapter_id.clone(),
        })
        .map_err(ExtensionError::from)?;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            result = self.runtime.execute(&record, METHOD_GET_PAGES, payload) => result?,
        };

        let pages = number_pages(result)?;
        let total_pages = pages.len() as i32;
        self.repository
            .update_total_pages(download.id, total_pages)
            .await?;

        tracing::info!(
            download_id = %download.id,
            extension_id = %record.id,
            chapter_id = %download.chapter_id,
            total_pages,
            "downloading chapter"
        );

        for (page_number, page) in &pages {
            let page_number = *page_number;
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let body = self
                .fetch_with_retry(download.id, page_number, page, cancel)
                .await?;
            let extension = resolve_file_extension(&page.image_url, body.content_type.as_deref());
            let stored = self
                .storage
                .save_page(download.id, page_number, &extension, &body.bytes)
                .await?;

            self.repository
                .add_page(NewPage {
                    download_id: download.id,
                    page_number,
                    source_url: page.image_url.clone(),
                    file_path: stored.relative_path,
                    file_size: stored.size as i64,
                })
                .await?;

            let percentage = progress_percentage(page_number, total_pages);
            self.repository
                .update_progress(download.id, percentage)
                .await?;

            // a cancel that landed during the save has already been announced
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            self.events
                .emit(AppEvent::download_progress(DownloadProgressPayload {
                    download_id: download.id,
                    chapter_id: download.chapter_id.clone(),
                    current_page: page_number,
                    total_pages,
                    percentage,
                }));
            self.events.emit(AppEvent::page_complete(PageCompletePayload {
                download_id: download.id,
                chapter_id: download.chapter_id.clone(),
                page_number,
            }));
        }

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        self.events
            .emit(AppEvent::chapter_complete(ChapterCompletePayload {
                download_id: download.id,
                chapter_id: download.chapter_id.clone(),
                total_pages,
            }));
        Ok(())
    }

    async fn fetch_with_retry(
        &self,
        download_id: uuid::Uuid,
        page_number: i32,
        page: &Page,
        cancel: &CancellationToken,
    ) -> Result<FetchedBody, DownloadError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                fetched = self.http.get_bytes(&page.image_url, &page.headers) => fetched,
            };

            let err = match fetched {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };

            tracing::warn!(
                download_id = %download_id,
                page = page_number,
                attempt,
                "page fetch failed: {err}"
            );
            if attempt >= max_attempts || !err.is_retryable() {
                return Err(err.into());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                _ = tokio::time::sleep(self.retry.delay_after(attempt)) => {}
            }
        }
    }
}

/// Parse a `getPages` result and pair every page with its 1-based number,
/// sorted ascending. Page number = `index + 1` when the extension reports an
/// index, otherwise the position in the list + 1. Numbers must cover exactly
/// `1..=P` for a list of `P` pages.
pub fn number_pages(result: serde_json::Value) -> Result<Vec<(i32, Page)>, DownloadError> {
    if result.is_null() {
        return Err(DownloadError::Domain(
            "Extension did not return any pages to download".into(),
        ));
    }
    let result: PagesResult = serde_json::from_value(result).map_err(|e| {
        DownloadError::Domain(format!("Extension returned a malformed page list: {e}"))
    })?;
    if result.pages.is_empty() {
        return Err(DownloadError::Domain(
            "Extension did not return any pages to download".into(),
        ));
    }
    let total = i32::try_from(result.pages.len()).map_err(|_| {
        DownloadError::Domain(format!(
            "Extension returned too many pages ({})",
            result.pages.len()
        ))
    })?;

    let mut numbered = Vec::with_capacity(result.pages.len());
    for (position, page) in result.pages.into_iter().enumerate() {
        let index = page.index.unwrap_or(position as i32);
        if !(0..total).contains(&index) {
            return Err(DownloadError::Domain(format!(
                "Extension returned an invalid page index {index} for {total} pages"
            )));
        }
        numbered.push((index + 1, page));
    }
    numbered.sort_by_key(|(number, _)| *number);

    for pair in numbered.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(DownloadError::Domain(format!(
                "Extension returned page {} more than once",
                pair[0].0
            )));
        }
    }
    Ok(numbered)
}

/// Guess a file extension: content type first, then the URL path, then `.jpg`.
pub fn resolve_file_extension(image_url: &str, content_type: Option<&str>) -> String {
    if let Some(content_type) = content_type.map(str::to_ascii_lowercase) {
        if content_type.contains("png") {
            return ".png".into();
        }
        if content_type.contains("webp") {
            return ".webp".into();
        }
        if content_type.contains("gif") {
            return ".gif".into();
        }
        if content_type.contains("jpeg") || content_type.contains("jpg") {
            return ".jpg".into();
        }
    }

    url::Url::parse(image_url)
        .ok()
        .and_then(|url| {
            std::path::Path::new(url.path())
                .extension()
                .and_then(|e| e.to_str())
                .map(normalize_extension)
        })
        .unwrap_or_else(|| normalize_extension(""))
}

/// `min(100, round(page / total × 100))`.
pub fn progress_percentage(page_number: i32, total_pages: i32) -> i32 {
    if total_pages <= 0 {
        return 0;
    }
    let pct = (f64::from(page_number) / f64::from(total_pages) * 100.0).round() as i32;
    pct.min(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_policy_backoff_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
    }

    #[test]
    fn test_progress_percentage() {
        assert_eq!(progress_percentage(1, 3), 33);
        assert_eq!(progress_percentage(2, 3), 67);
        assert_eq!(progress_percentage(3, 3), 100);
        assert_eq!(progress_percentage(5, 3), 100);
        assert_eq!(progress_percentage(1, 0), 0);
    }

    #[test]
    fn test_extension_from_content_type() {
        assert_eq!(resolve_file_extension("https://x/a", Some("image/png")), ".png");
        assert_eq!(resolve_file_extension("https://x/a", Some("image/webp")), ".webp");
        assert_eq!(resolve_file_extension("https://x/a", Some("image/gif")), ".gif");
        assert_eq!(resolve_file_extension("https://x/a.png", Some("image/jpeg")), ".jpg");
        assert_eq!(resolve_file_extension("https://x/a", Some("IMAGE/PNG")), ".png");
    }

    #[test]
    fn test_extension_falls_back_to_url_then_jpg() {
        assert_eq!(
            resolve_file_extension("https://x/a/001.WEBP?token=1", Some("application/octet-stream")),
            ".webp"
        );
        assert_eq!(resolve_file_extension("https://x/a/001.gif", None), ".gif");
        assert_eq!(resolve_file_extension("https://x/a/page", None), ".jpg");
        assert_eq!(resolve_file_extension("not a url", None), ".jpg");
    }

    #[test]
    fn test_number_pages_uses_index_or_position() {
        let pages = number_pages(json!({"pages": [
            {"imageUrl": "https://x/2.png", "index": 1},
            {"imageUrl": "https://x/1.png", "index": 0},
        ]}))
        .unwrap();
        assert_eq!(pages[0].0, 1);
        assert_eq!(pages[0].1.image_url, "https://x/1.png");
        assert_eq!(pages[1].0, 2);

        let pages = number_pages(json!({"pages": [
            {"imageUrl": "https://x/a.png"},
            {"imageUrl": "https://x/b.png"},
            {"imageUrl": "https://x/c.png"},
        ]}))
        .unwrap();
        assert_eq!(pages.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_number_pages_rejects_empty_and_malformed() {
        for bad in [json!(null), json!({"pages": []}), json!({"nope": 1}), json!([1, 2])] {
            let err = number_pages(bad).unwrap_err();
            assert!(matches!(err, DownloadError::Domain(_)), "got {err:?}");
        }
        let err = number_pages(json!({"pages": []})).unwrap_err();
        assert_eq!(err.to_string(), "Extension did not return any pages to download");
    }

    #[test]
    fn test_number_pages_rejects_duplicates_and_negative() {
        let err = number_pages(json!({"pages": [
            {"imageUrl": "https://x/a.png", "index": 0},
            {"imageUrl": "https://x/b.png", "index": 0},
        ]}))
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));

        let err = number_pages(json!({"pages": [{"imageUrl": "https://x/a.png", "index": -3}]}))
            .unwrap_err();
        assert!(err.to_string().contains("invalid page index"));
    }

    #[test]
    fn test_number_pages_rejects_sparse_and_out_of_range_indices() {
        let sparse = json!({"pages": [
            {"imageUrl": "https://x/a.png", "index": 0},
            {"imageUrl": "https://x/b.png", "index": 1499},
        ]});
        let huge = json!({"pages": [{"imageUrl": "https://x/a.png", "index": i32::MAX}]});
        for bad in [sparse, huge] {
            let err = number_pages(bad).unwrap_err();
            assert!(matches!(err, DownloadError::Domain(_)), "got {err:?}");
            assert!(err.to_string().contains("invalid page index"));
        }

        // an indexed page may not collide with an unindexed one
        let err = number_pages(json!({"pages": [
            {"imageUrl": "https://x/a.png", "index": 1},
            {"imageUrl": "https://x/b.png"},
        ]}))
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
