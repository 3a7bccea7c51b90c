use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[sea_orm(string_value = "queued")]
    Queued,
    #[sea_orm(string_value = "downloading")]
    Downloading,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "queued",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Cancelled => "cancelled",
        }
    }

    /// Queued and downloading rows block a second download of the same chapter.
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadStatus::Queued | DownloadStatus::Downloading)
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(DownloadStatus::Queued),
            "downloading" => Some(DownloadStatus::Downloading),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            "cancelled" => Some(DownloadStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "downloads")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub library_id: Uuid,
    pub chapter_id: String,
    pub chapter_number: Option<String>,
    pub extension_id: String,
    pub status: DownloadStatus,
    pub progress: i32,
    pub total_pages: Option<i32>,
    #[sea_orm(column_type = "Text", nullable)]
    pub error: Option<String>,
    pub created_at: DateTimeUtc,
    pub started_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::library_item::Entity",
        from = "Column::LibraryId",
        to = "super::library_item::Column::Id"
    )]
    LibraryItem,
    #[sea_orm(has_many = "super::downloaded_page::Entity")]
    Pages,
}

impl Related<super::library_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::LibraryItem.def()
    }
}

impl Related<super::downloaded_page::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Pages.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::strum::IntoEnumIterator;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in DownloadStatus::iter() {
            assert_eq!(DownloadStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DownloadStatus::parse("paused"), None);
    }

    #[test]
    fn test_active_statuses() {
        assert!(DownloadStatus::Queued.is_active());
        assert!(DownloadStatus::Downloading.is_active());
        assert!(!DownloadStatus::Completed.is_active());
        assert!(!DownloadStatus::Failed.is_active());
        assert!(!DownloadStatus::Cancelled.is_active());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&DownloadStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }
}
