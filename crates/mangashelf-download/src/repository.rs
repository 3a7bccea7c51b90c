//! Persistence for downloads, downloaded pages and library items.
//!
//! Status writes are conditional on the current status, so a late worker can
//! never overwrite a cancellation and a requeue never touches finished rows.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::DownloadError;
use mangashelf_db::entities::download::{self, DownloadStatus};
use mangashelf_db::entities::{downloaded_page, library_item};

// ─── Inputs ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFilters {
    pub status: Option<DownloadStatus>,
    pub library_id: Option<Uuid>,
    pub extension_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewDownload {
    pub library_id: Uuid,
    pub chapter_id: String,
    pub extension_id: String,
    pub chapter_number: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPage {
    pub download_id: Uuid,
    pub page_number: i32,
    pub source_url: String,
    pub file_path: String,
    pub file_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewLibraryItem {
    pub manga_id: String,
    pub extension_id: String,
    pub title: String,
    #[serde(default)]
    pub cover_url: Option<String>,
    #[serde(default = "default_reading_status")]
    pub status: String,
    #[serde(default)]
    pub favorite: bool,
}

fn default_reading_status() -> String {
    "reading".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryItemPatch {
    pub title: Option<String>,
    pub cover_url: Option<String>,
    pub status: Option<String>,
    pub favorite: Option<bool>,
}

// ─── Traits ─────────────────────────────────────────────────────────

#[async_trait]
pub trait DownloadRepository: Send + Sync {
    async fn create(&self, input: NewDownload) -> Result<download::Model, DownloadError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<download::Model>, DownloadError>;

    async fn find_by_library_and_chapter(
        &self,
        library_id: Uuid,
        chapter_id: &str,
    ) -> Result<Option<download::Model>, DownloadError>;

    /// Newest first.
    async fn list(&self, filters: &DownloadFilters) -> Result<Vec<download::Model>, DownloadError>;

    /// Oldest queued rows first.
    async fn get_queued(&self, limit: u64) -> Result<Vec<download::Model>, DownloadError>;

    async fn count(&self) -> Result<u64, DownloadError>;

    async fn delete(&self, id: Uuid) -> Result<(), DownloadError>;

    /// queued → downloading. Returns `false` if the row was not queued.
    async fn mark_downloading(&self, id: Uuid) -> Result<bool, DownloadError>;

    /// downloading → completed.
    async fn mark_completed(&self, id: Uuid) -> Result<bool, DownloadError>;

    /// downloading → failed.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, DownloadError>;

    /// queued | downloading → cancelled.
    async fn mark_cancelled(&self, id: Uuid) -> Result<bool, DownloadError>;

    /// Every downloading row back to queued. Returns the affected ids.
    async fn requeue_stuck(&self) -> Result<Vec<Uuid>, DownloadError>;

    /// Sets the page count once; later calls leave it untouched.
    async fn update_total_pages(&self, id: Uuid, total_pages: i32) -> Result<(), DownloadError>;

    /// Never lowers the stored progress.
    async fn update_progress(&self, id: Uuid, progress: i32) -> Result<(), DownloadError>;

    async fn add_page(&self, page: NewPage) -> Result<downloaded_page::Model, DownloadError>;

    async fn list_pages(&self, id: Uuid) -> Result<Vec<downloaded_page::Model>, DownloadError>;

    async fn remove_pages(&self, id: Uuid) -> Result<u64, DownloadError>;
}

#[async_trait]
pub trait LibraryRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<library_item::Model>, DownloadError>;

    async fn list(&self) -> Result<Vec<library_item::Model>, DownloadError>;

    async fn create(&self, input: NewLibraryItem) -> Result<library_item::Model, DownloadError>;

    async fn update(
        &self,
        id: Uuid,
        patch: LibraryItemPatch,
    ) -> Result<Option<library_item::Model>, DownloadError>;

    /// Returns the removed row, if any. Downloads cascade.
    async fn delete(&self, id: Uuid) -> Result<Option<library_item::Model>, DownloadError>;
}

// ─── SeaORM implementation ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DbDownloadRepository {
    db: DatabaseConnection,
}

impl DbDownloadRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DownloadRepository for DbDownloadRepository {
    async fn create(&self, input: NewDownload) -> Result<download::Model, DownloadError> {
        let model = download::ActiveModel {
            id: Set(Uuid::new_v4()),
            library_id: Set(input.library_id),
            chapter_id: Set(input.chapter_id),
            chapter_number: Set(input.chapter_number),
            extension_id: Set(input.extension_id),
            status: Set(DownloadStatus::Queued),
            progress: Set(0),
            total_pages: Set(None),
            error: Set(None),
            created_at: Set(Utc::now()),
            started_at: Set(None),
            completed_at: Set(None),
        };
        Ok(model.insert(&self.db).await?)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<download::Model>, DownloadError> {
        Ok(download::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn find_by_library_and_chapter(
        &self,
        library_id: Uuid,
        chapter_id: &str,
    ) -> Result<Option<download::Model>, DownloadError> {
        Ok(download::Entity::find()
            .filter(download::Column::LibraryId.eq(library_id))
            .filter(download::Column::ChapterId.eq(chapter_id))
            .order_by_desc(download::Column::CreatedAt)
            .one(&self.db)
            .await?)
    }

    async fn list(&self, filters: &DownloadFilters) -> Result<Vec<download::Model>, DownloadError> {
        let mut query = download::Entity::find();
        if let Some(status) = filters.status {
            query = query.filter(download::Column::Status.eq(status));
        }
        if let Some(library_id) = filters.library_id {
            query = query.filter(download::Column::LibraryId.eq(library_id));
        }
        if let Some(extension_id) = filters.extension_id.as_deref() {
            query = query.filter(download::Column::ExtensionId.eq(extension_id));
        }
        Ok(query
            .order_by_desc(download::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    async fn get_queued(&self, limit: u64) -> Result<Vec<download::Model>, DownloadError> {
        Ok(download::Entity::find()
            .filter(download::Column::Status.eq(DownloadStatus::Queued))
            .order_by_asc(download::Column::CreatedAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    async fn count(&self) -> Result<u64, DownloadError> {
        Ok(download::Entity::find().count(&self.db).await?)
    }

    async fn delete(&self, id: Uuid) -> Result<(), DownloadError> {
        download::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(())
    }

    async fn mark_downloading(&self, id: Uuid) -> Result<bool, DownloadError> {
        let result = download::Entity::update_many()
            .set(download::ActiveModel {
                status: Set(DownloadStatus::Downloading),
                progress: Set(0),
                error: Set(None),
                started_at: Set(Some(Utc::now())),
                completed_at: Set(None),
                ..Default::default()
            })
            .filter(download::Column::Id.eq(id))
            .filter(download::Column::Status.eq(DownloadStatus::Queued))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn mark_completed(&self, id: Uuid) -> Result<bool, DownloadError> {
        let result = download::Entity::update_many()
            .set(download::ActiveModel {
                status: Set(DownloadStatus::Completed),
                progress: Set(100),
                completed_at: Set(Some(Utc::now())),
                ..Default::default()
            })
            .filter(download::Column::Id.eq(id))
            .filter(download::Column::Status.eq(DownloadStatus::Downloading))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, DownloadError> {
        let result = download::Entity::update_many()
            .set(download::ActiveModel {
                status: Set(DownloadStatus::Failed),
                error: Set(Some(error.to_string())),
                completed_at: Set(Some(Utc::now())),
                ..Default::default()
            })
            .filter(download::Column::Id.eq(id))
            .filter(download::Column::Status.eq(DownloadStatus::Downloading))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<bool, DownloadError> {
        let result = download::Entity::update_many()
            .set(download::ActiveModel {
                status: Set(DownloadStatus::Cancelled),
                completed_at: Set(Some(Utc::now())),
                ..Default::default()
            })
            .filter(download::Column::Id.eq(id))
            .filter(
                download::Column::Status
                    .is_in([DownloadStatus::Queued, DownloadStatus::Downloading]),
            )
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn requeue_stuck(&self) -> Result<Vec<Uuid>, DownloadError> {
        let stuck: Vec<Uuid> = download::Entity::find()
            .filter(download::Column::Status.eq(DownloadStatus::Downloading))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        if stuck.is_empty() {
            return Ok(stuck);
        }

        download::Entity::update_many()
            .set(download::ActiveModel {
                status: Set(DownloadStatus::Queued),
                progress: Set(0),
                started_at: Set(None),
                ..Default::default()
            })
            .filter(download::Column::Id.is_in(stuck.clone()))
            .filter(download::Column::Status.eq(DownloadStatus::Downloading))
            .exec(&self.db)
            .await?;
        Ok(stuck)
    }

    async fn update_total_pages(&self, id: Uuid, total_pages: i32) -> Result<(), DownloadError> {
        download::Entity::update_many()
            .set(download::ActiveModel {
                total_pages: Set(Some(total_pages)),
                ..Default::default()
            })
            .filter(download::Column::Id.eq(id))
            .filter(download::Column::TotalPages.is_null())
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, progress: i32) -> Result<(), DownloadError> {
        download::Entity::update_many()
            .set(download::ActiveModel {
                progress: Set(progress.clamp(0, 100)),
                ..Default::default()
            })
            .filter(download::Column::Id.eq(id))
            .filter(download::Column::Progress.lte(progress))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn add_page(&self, page: NewPage) -> Result<downloaded_page::Model, DownloadError> {
        let model = downloaded_page::ActiveModel {
            id: Set(Uuid::new_v4()),
            download_id: Set(page.download_id),
            page_number: Set(page.page_number),
            source_url: Set(page.source_url),
            file_path: Set(page.file_path),
            file_size: Set(page.file_size),
            downloaded_at: Set(Utc::now()),
        };
        Ok(model.insert(&self.db).await?)
    }

    async fn list_pages(&self, id: Uuid) -> Result<Vec<downloaded_page::Model>, DownloadError> {
        Ok(downloaded_page::Entity::find()
            .filter(downloaded_page::Column::DownloadId.eq(id))
            .order_by_asc(downloaded_page::Column::PageNumber)
            .all(&self.db)
            .await?)
    }

    async fn remove_pages(&self, id: Uuid) -> Result<u64, DownloadError> {
        let result = downloaded_page::Entity::delete_many()
            .filter(downloaded_page::Column::DownloadId.eq(id))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[derive(Debug, Clone)]
pub struct DbLibraryRepository {
    db: DatabaseConnection,
}

impl DbLibraryRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LibraryRepository for DbLibraryRepository {
    async fn get(&self, id: Uuid) -> Result<Option<library_item::Model>, DownloadError> {
        Ok(library_item::Entity::find_by_id(id).one(&self.db).await?)
    }

    async fn list(&self) -> Result<Vec<library_item::Model>, DownloadError> {
        Ok(library_item::Entity::find()
            .order_by_desc(library_item::Column::DateAdded)
            .all(&self.db)
            .await?)
    }

    async fn create(&self, input: NewLibraryItem) -> Result<library_item::Model, DownloadError> {
        if input.manga_id.trim().is_empty() || input.extension_id.trim().is_empty() {
            return Err(DownloadError::Validation(
                "mangaId and extensionId are required".into(),
            ));
        }
        if input.title.trim().is_empty() {
            return Err(DownloadError::Validation("title is required".into()));
        }

        let existing = library_item::Entity::find()
            .filter(library_item::Column::ExtensionId.eq(input.extension_id.as_str()))
            .filter(library_item::Column::MangaId.eq(input.manga_id.as_str()))
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Err(DownloadError::Validation(format!(
                "manga {} from {} is already in the library",
                input.manga_id, input.extension_id
            )));
        }

        let now = Utc::now();
        let model = library_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            manga_id: Set(input.manga_id),
            extension_id: Set(input.extension_id),
            title: Set(input.title),
            cover_url: Set(input.cover_url),
            status: Set(input.status),
            favorite: Set(input.favorite),
            date_added: Set(now),
            last_updated: Set(now),
        };
        Ok(model.insert(&self.db).await?)
    }

    async fn update(
        &self,
        id: Uuid,
        patch: LibraryItemPatch,
    ) -> Result<Option<library_item::Model>, DownloadError> {
        let Some(model) = library_item::Entity::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };

        let mut active: library_item::ActiveModel = model.into();
        if let Some(title) = patch.title {
            active.title = Set(title);
        }
        if let Some(cover_url) = patch.cover_url {
            active.cover_url = Set(Some(cover_url));
        }
        if let Some(status) = patch.status {
            active.status = Set(status);
        }
        if let Some(favorite) = patch.favorite {
            active.favorite = Set(favorite);
        }
        active.last_updated = Set(Utc::now());
        Ok(Some(active.update(&self.db).await?))
    }

    async fn delete(&self, id: Uuid) -> Result<Option<library_item::Model>, DownloadError> {
        let Some(model) = library_item::Entity::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };
        library_item::Entity::delete_by_id(id).exec(&self.db).await?;
        Ok(Some(model))
    }
}
