//! Persisted catalog of installed extensions and the local-directory
//! bootstrap that fills it at startup.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{sea_query::OnConflict, DatabaseConnection, EntityTrait, QueryOrder, Set};

use crate::error::ExtensionError;
use crate::manifest::{ExtensionManifest, MANIFEST_FILE};
use crate::runtime::ExtensionRuntime;
use crate::types::ExtensionRecord;
use mangashelf_db::entities::extension;

#[async_trait]
pub trait ExtensionRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<ExtensionRecord>, ExtensionError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<ExtensionRecord>, ExtensionError>;

    async fn upsert(&self, record: &ExtensionRecord) -> Result<(), ExtensionError>;
}

#[derive(Debug, Clone)]
pub struct DbExtensionRegistry {
    db: DatabaseConnection,
}

impl DbExtensionRegistry {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ExtensionRegistry for DbExtensionRegistry {
    async fn list(&self) -> Result<Vec<ExtensionRecord>, ExtensionError> {
        extension::Entity::find()
            .order_by_asc(extension::Column::Name)
            .all(&self.db)
            .await?
            .into_iter()
            .map(ExtensionRecord::try_from)
            .collect()
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ExtensionRecord>, ExtensionError> {
        extension::Entity::find_by_id(id.to_string())
            .one(&self.db)
            .await?
            .map(ExtensionRecord::try_from)
            .transpose()
    }

    async fn upsert(&self, record: &ExtensionRecord) -> Result<(), ExtensionError> {
        let model = extension::ActiveModel {
            id: Set(record.id.clone()),
            slug: Set(record.slug.clone()),
            name: Set(record.name.clone()),
            version: Set(record.version.clone()),
            install_path: Set(record.install_path.to_string_lossy().to_string()),
            enabled: Set(record.enabled),
            checksum: Set(record.checksum.clone()),
            repo_source: Set(record.repo_source.clone()),
            manifest: Set(serde_json::to_value(&record.manifest)?),
            installed_at: Set(record.installed_at.unwrap_or_else(Utc::now)),
        };

        extension::Entity::insert(model)
            .on_conflict(
                OnConflict::column(extension::Column::Id)
                    .update_columns([
                        extension::Column::Slug,
                        extension::Column::Name,
                        extension::Column::Version,
                        extension::Column::InstallPath,
                        extension::Column::Enabled,
                        extension::Column::Checksum,
                        extension::Column::RepoSource,
                        extension::Column::Manifest,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }
}

/// Scan `install_dir` for `*/extension.toml`, upsert each valid manifest as
/// an enabled extension and pre-load it into the runtime. Individual
/// failures are logged and skipped. Returns the records that were registered.
pub async fn bootstrap_local_registry(
    install_dir: &Path,
    registry: &dyn ExtensionRegistry,
    runtime: &ExtensionRuntime,
) -> Result<Vec<ExtensionRecord>, ExtensionError> {
    let mut entries = match tokio::fs::read_dir(install_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(dir = %install_dir.display(), "extensions directory missing, nothing to bootstrap");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut registered = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let dir = entry.path();
        let manifest_path = dir.join(MANIFEST_FILE);
        if !entry.file_type().await?.is_dir() || !manifest_path.exists() {
            continue;
        }

        let record = match read_local_extension(&dir, &manifest_path).await {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(path = %manifest_path.display(), "skipping extension: {e}");
                continue;
            }
        };

        if let Err(e) = registry.upsert(&record).await {
            tracing::error!(extension_id = %record.id, "failed to register extension: {e}");
            continue;
        }

        match runtime.initialise(&record).await {
            Ok(()) => tracing::info!(
                extension_id = %record.id,
                version = %record.version,
                "extension loaded"
            ),
            Err(e) => tracing::error!(extension_id = %record.id, "failed to preload extension: {e}"),
        }
        registered.push(record);
    }

    Ok(registered)
}

async fn read_local_extension(
    dir: &Path,
    manifest_path: &Path,
) -> Result<ExtensionRecord, ExtensionError> {
    let raw = tokio::fs::read_to_string(manifest_path).await?;
    let manifest = ExtensionManifest::parse_validated(&raw)?;
    Ok(ExtensionRecord::from_manifest(manifest, dir))
}
