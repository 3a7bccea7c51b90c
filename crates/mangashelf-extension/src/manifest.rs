//! Extension manifest parsing and validation.
//!
//! Each installed extension ships an `extension.toml` next to its compiled
//! `.wasm` entry:
//!
//! ```toml
//! [extension]
//! id = "mangadex"
//! name = "MangaDex"
//! version = "1.2.0"
//! language = "en"
//! entry = "mangadex.wasm"
//! capabilities = ["search", "getChapters", "getPages"]
//!
//! [permissions]
//! http_hosts = ["api.mangadex.org", "*.mangadex.network"]
//!
//! [settings]
//! data_saver = false
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ExtensionError;

/// File name looked up in every extension directory.
pub const MANIFEST_FILE: &str = "extension.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub extension: ExtensionMeta,
    #[serde(default)]
    pub permissions: Permissions,
    /// Default settings snapshot, replaced wholesale by `onSettingsChange`.
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionMeta {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default = "default_language")]
    pub language: String,
    pub entry: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
}

fn default_language() -> String {
    "all".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub http_hosts: Vec<String>,
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Ids are `[a-z0-9][a-z0-9._-]{0,127}`; they double as directory names.
fn validate_id(id: &str) -> Result<(), ExtensionError> {
    let Some(first) = id.chars().next() else {
        return Err(ExtensionError::InvalidManifest(
            "extension.id must not be empty".into(),
        ));
    };
    if id.len() > 128 {
        return Err(ExtensionError::InvalidManifest(format!(
            "extension.id must be at most 128 characters, got {}",
            id.len()
        )));
    }
    if !first.is_ascii_lowercase() && !first.is_ascii_digit() {
        return Err(ExtensionError::InvalidManifest(format!(
            "extension.id must start with a lowercase letter or digit, got '{first}'"
        )));
    }
    if let Some(ch) = id
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ExtensionError::InvalidManifest(format!(
            "extension.id contains invalid character '{ch}'"
        )));
    }
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), ExtensionError> {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return Err(ExtensionError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    for component in p.components() {
        if matches!(component, std::path::Component::ParentDir) {
            return Err(ExtensionError::InvalidManifest(format!(
                "{field_name} must not contain '..': '{path}'"
            )));
        }
    }
    Ok(())
}

/// Must be non-empty, contain no spaces, and either be `"*"`, `"localhost"`,
/// or contain at least one dot.
pub(crate) fn validate_http_host(host: &str) -> Result<(), ExtensionError> {
    if host.is_empty() {
        return Err(ExtensionError::InvalidManifest(
            "http_hosts entry must not be empty".into(),
        ));
    }
    if host.contains(' ') {
        return Err(ExtensionError::InvalidManifest(format!(
            "http_hosts entry must not contain spaces: '{host}'"
        )));
    }
    if host != "*" && host != "localhost" && !host.contains('.') {
        return Err(ExtensionError::InvalidManifest(format!(
            "http_hosts entry is not a valid domain: '{host}'"
        )));
    }
    Ok(())
}

impl ExtensionManifest {
    /// Parse a manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, ExtensionError> {
        let manifest: ExtensionManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    /// Parse and validate in one step.
    pub fn parse_validated(toml_str: &str) -> Result<Self, ExtensionError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ExtensionError> {
        validate_id(&self.extension.id)?;

        let name_len = self.extension.name.trim().len();
        if name_len == 0 || name_len > 255 {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension.name must be 1-255 characters, got {name_len}"
            )));
        }

        semver::Version::parse(&self.extension.version).map_err(|_| {
            ExtensionError::InvalidManifest(format!(
                "extension.version is not valid semver: '{}'",
                self.extension.version
            ))
        })?;

        validate_path_safety(&self.extension.entry, "extension.entry")?;
        if !self.extension.entry.ends_with(".wasm") {
            return Err(ExtensionError::InvalidManifest(format!(
                "extension.entry must end with '.wasm', got '{}'",
                self.extension.entry
            )));
        }

        for host in &self.permissions.http_hosts {
            validate_http_host(host)?;
        }

        Ok(())
    }

    /// Slug used in logs and the unique `extensions.slug` column.
    pub fn slug(&self) -> String {
        self.extension.id.replace('.', "-")
    }
}
