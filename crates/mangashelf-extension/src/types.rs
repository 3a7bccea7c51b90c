//! Types shared between the host and extensions.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExtensionError;
use crate::manifest::ExtensionManifest;
use mangashelf_db::entities::extension;

pub const METHOD_INIT: &str = "init";
pub const METHOD_DISPOSE: &str = "dispose";
pub const METHOD_SEARCH: &str = "search";
pub const METHOD_GET_MANGA_DETAILS: &str = "getMangaDetails";
pub const METHOD_GET_CHAPTERS: &str = "getChapters";
pub const METHOD_GET_PAGES: &str = "getPages";
pub const METHOD_GET_SETTINGS: &str = "getSettings";
pub const METHOD_ON_SETTINGS_CHANGE: &str = "onSettingsChange";

/// Content methods; a module exporting none of these is not an extension.
pub const CONTENT_METHODS: &[&str] = &[
    METHOD_SEARCH,
    METHOD_GET_MANGA_DETAILS,
    METHOD_GET_CHAPTERS,
    METHOD_GET_PAGES,
];

/// Installed extension as seen by the runtime. Read-only once installed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRecord {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub version: String,
    pub manifest: ExtensionManifest,
    pub install_path: PathBuf,
    pub enabled: bool,
    pub checksum: Option<String>,
    pub repo_source: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
}

impl ExtensionRecord {
    pub fn from_manifest(manifest: ExtensionManifest, install_path: impl Into<PathBuf>) -> Self {
        Self {
            id: manifest.extension.id.clone(),
            slug: manifest.slug(),
            name: manifest.extension.name.clone(),
            version: manifest.extension.version.clone(),
            install_path: install_path.into(),
            enabled: true,
            checksum: None,
            repo_source: None,
            installed_at: Some(Utc::now()),
            manifest,
        }
    }

    pub fn entry_path(&self) -> PathBuf {
        self.install_path.join(&self.manifest.extension.entry)
    }
}

impl TryFrom<extension::Model> for ExtensionRecord {
    type Error = ExtensionError;

    fn try_from(model: extension::Model) -> Result<Self, Self::Error> {
        let manifest: ExtensionManifest = serde_json::from_value(model.manifest)?;
        Ok(Self {
            id: model.id,
            slug: model.slug,
            name: model.name,
            version: model.version,
            manifest,
            install_path: PathBuf::from(model.install_path),
            enabled: model.enabled,
            checksum: model.checksum,
            repo_source: model.repo_source,
            installed_at: Some(model.installed_at),
        })
    }
}

/// Payload for `getPages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterPayload {
    pub manga_id: String,
    pub chapter_id: String,
}

/// One page as reported by an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// Zero-based position, when the extension reports one.
    #[serde(default)]
    pub index: Option<i32>,
    pub image_url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PagesResult {
    pub pages: Vec<Page>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_result_deserialization() {
        let json = r#"{"pages":[
            {"index":0,"imageUrl":"https://img.example/1.png","headers":{"Referer":"https://src.example"}},
            {"imageUrl":"https://img.example/2.png","width":800,"height":1200}
        ]}"#;
        let result: PagesResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.pages.len(), 2);
        assert_eq!(result.pages[0].index, Some(0));
        assert_eq!(result.pages[0].headers["Referer"], "https://src.example");
        assert_eq!(result.pages[1].index, None);
        assert_eq!(result.pages[1].width, Some(800));
    }

    #[test]
    fn test_chapter_payload_is_camel_case() {
        let payload = ChapterPayload {
            manga_id: "m1".into(),
            chapter_id: "c1".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json, serde_json::json!({"mangaId": "m1", "chapterId": "c1"}));
    }

    #[test]
    fn test_record_from_model() {
        let manifest = ExtensionManifest::parse(
            "[extension]\nid = \"demo\"\nname = \"Demo\"\nversion = \"1.0.0\"\nentry = \"demo.wasm\"",
        )
        .unwrap();
        let model = extension::Model {
            id: "demo".into(),
            slug: "demo".into(),
            name: "Demo".into(),
            version: "1.0.0".into(),
            install_path: "/ext/demo".into(),
            enabled: true,
            checksum: None,
            repo_source: None,
            manifest: serde_json::to_value(&manifest).unwrap(),
            installed_at: Utc::now(),
        };
        let record = ExtensionRecord::try_from(model).unwrap();
        assert_eq!(record.entry_path(), PathBuf::from("/ext/demo/demo.wasm"));
        assert_eq!(record.manifest, manifest);
    }

    #[test]
    fn test_record_from_model_with_bad_manifest() {
        let model = extension::Model {
            id: "demo".into(),
            slug: "demo".into(),
            name: "Demo".into(),
            version: "1.0.0".into(),
            install_path: "/ext/demo".into(),
            enabled: true,
            checksum: None,
            repo_source: None,
            manifest: serde_json::json!({"nope": 1}),
            installed_at: Utc::now(),
        };
        let err = ExtensionRecord::try_from(model).unwrap_err();
        assert!(matches!(err, ExtensionError::Serialization(_)));
    }
}
