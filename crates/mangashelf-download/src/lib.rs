//! MangaShelf download pipeline.
//!
//! The orchestrator admits chapter downloads, schedules them under a fixed
//! concurrency limit and owns their status. The chapter downloader asks the
//! extension runtime for page URLs, fetches each page with retry and writes
//! it through the page store. Progress is reported through an [`EventSink`].

pub mod downloader;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod repository;

pub use downloader::{ChapterDownloader, RetryPolicy};
pub use error::DownloadError;
pub use events::{AppEvent, EventSink};
pub use orchestrator::{
    DownloadConfig, DownloadDeps, DownloadManager, DownloadStats, DownloadWithPages,
    QueueDownloadsInput, DEFAULT_CONCURRENCY,
};
pub use repository::{
    DbDownloadRepository, DbLibraryRepository, DownloadFilters, DownloadRepository,
    LibraryItemPatch, LibraryRepository, NewLibraryItem,
};
