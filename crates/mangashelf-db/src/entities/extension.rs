use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// An installed extension. `manifest` holds the parsed `extension.toml`
/// as JSON so the runtime never re-reads it from disk.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "extensions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique)]
    pub slug: String,
    pub name: String,
    pub version: String,
    pub install_path: String,
    pub enabled: bool,
    pub checksum: Option<String>,
    pub repo_source: Option<String>,
    #[sea_orm(column_type = "Json")]
    pub manifest: Json,
    pub installed_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
