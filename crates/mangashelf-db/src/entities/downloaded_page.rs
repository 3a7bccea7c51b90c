use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "downloaded_pages")]
#[serde(rename_all = "camelCase")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub download_id: Uuid,
    pub page_number: i32,
    pub source_url: String,
    pub file_path: String,
    pub file_size: i64,
    pub downloaded_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::download::Entity",
        from = "Column::DownloadId",
        to = "super::download::Column::Id",
        on_delete = "Cascade"
    )]
    Download,
}

impl Related<super::download::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Download.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
