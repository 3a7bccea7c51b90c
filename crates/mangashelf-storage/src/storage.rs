use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

/// Extension used when neither the response nor the URL gives a usable one.
pub const DEFAULT_PAGE_EXTENSION: &str = ".jpg";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Invalid page number: {0}")]
    InvalidPage(i32),
}

/// A page written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredPage {
    /// Path relative to the storage root, `<download_id>/page_NNN.ext`.
    pub relative_path: String,
    pub full_path: PathBuf,
    pub size: u64,
}

/// Aggregate disk usage across every download directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_size: u64,
    pub download_count: u64,
}

/// Page persistence used by the chapter downloader.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn save_page(
        &self,
        download_id: Uuid,
        page_number: i32,
        extension: &str,
        data: &[u8],
    ) -> Result<StoredPage, StorageError>;

    /// Resolve the file holding `page_number`, whatever its extension.
    async fn page_path(&self, download_id: Uuid, page_number: i32) -> Option<PathBuf>;

    /// Remove the whole download directory. A missing directory is not an error.
    async fn delete_download(&self, download_id: Uuid) -> Result<(), StorageError>;

    async fn usage_stats(&self) -> Result<StorageStats, StorageError>;

    fn full_path(&self, relative_path: &str) -> PathBuf;
}

// ─── Local Filesystem Backend ──────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PageStorage {
    base_path: PathBuf,
}

impl PageStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn from_env() -> Self {
        let base =
            std::env::var("DOWNLOADS_DIR").unwrap_or_else(|_| "./data/downloads".to_string());
        Self::new(base)
    }

    pub fn base(&self) -> &Path {
        &self.base_path
    }

    pub fn download_dir(&self, download_id: Uuid) -> PathBuf {
        self.base_path.join(download_id.to_string())
    }
}

#[async_trait]
impl PageStore for PageStorage {
    async fn save_page(
        &self,
        download_id: Uuid,
        page_number: i32,
        extension: &str,
        data: &[u8],
    ) -> Result<StoredPage, StorageError> {
        if page_number < 1 {
            return Err(StorageError::InvalidPage(page_number));
        }

        let dir = self.download_dir(download_id);
        fs::create_dir_all(&dir).await?;

        let file_name = page_file_name(page_number, extension);
        let full_path = dir.join(&file_name);
        fs::write(&full_path, data).await?;

        tracing::debug!(
            download_id = %download_id,
            page = page_number,
            bytes = data.len(),
            "page written"
        );

        Ok(StoredPage {
            relative_path: format!("{download_id}/{file_name}"),
            full_path,
            size: data.len() as u64,
        })
    }

    async fn page_path(&self, download_id: Uuid, page_number: i32) -> Option<PathBuf> {
        let prefix = format!("page_{page_number:03}.");
        let mut entries = fs::read_dir(self.download_dir(download_id)).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                return Some(entry.path());
            }
        }
        None
    }

    async fn delete_download(&self, download_id: Uuid) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.download_dir(download_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn usage_stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stats.download_count += 1;
                stats.total_size += dir_size(&entry.path()).await?;
            } else {
                stats.total_size += meta.len();
            }
        }
        Ok(stats)
    }

    fn full_path(&self, relative_path: &str) -> PathBuf {
        self.base_path.join(relative_path)
    }
}

async fn dir_size(dir: &Path) -> Result<u64, StorageError> {
    let mut total = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_dir() {
            total += Box::pin(dir_size(&entry.path())).await?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

/// `page_001.png` style file name.
pub fn page_file_name(page_number: i32, extension: &str) -> String {
    format!("page_{page_number:03}{}", normalize_extension(extension))
}

/// Lowercase, dot-prefixed, alphanumeric extension; anything else becomes `.jpg`.
pub fn normalize_extension(extension: &str) -> String {
    let ext = extension.trim().to_ascii_lowercase();
    let ext = if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    };
    let body = &ext[1..];
    if body.is_empty() || !body.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return DEFAULT_PAGE_EXTENSION.to_string();
    }
    ext
}
