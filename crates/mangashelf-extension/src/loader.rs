//! Source loading for installed extensions.
//!
//! The filesystem loader resolves `install_path/entry`, checks the file
//! type, verifies the recorded SHA-256 checksum and restricts WASM imports
//! to the namespaces the sandbox provides. Loaded sources are cached by
//! extension id until [`SourceLoader::unload`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::ExtensionError;
use crate::module::LoadedSource;
use crate::types::ExtensionRecord;

/// WASM magic bytes: `\0asm`.
const WASM_MAGIC: &[u8] = b"\0asm";

/// Allowed WASM import namespaces.
const ALLOWED_IMPORT_NAMESPACES: &[&str] = &[
    "env",                    // Extism kernel
    "extism:host/env",        // Extism kernel (component naming)
    "extism:host/user",       // our host functions
    "wasi_snapshot_preview1", // WASI preview 1 (only linked when enabled)
];

/// File extensions the loader accepts as an entry point.
const SUPPORTED_ENTRY_EXTENSIONS: &[&str] = &["wasm"];

#[async_trait]
pub trait SourceLoader: Send + Sync {
    async fn load_source(&self, record: &ExtensionRecord) -> Result<LoadedSource, ExtensionError>;

    async fn unload(&self, record: &ExtensionRecord);
}

#[derive(Debug, Default)]
pub struct FsSourceLoader {
    cache: RwLock<HashMap<String, LoadedSource>>,
}

impl FsSourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl SourceLoader for FsSourceLoader {
    async fn load_source(&self, record: &ExtensionRecord) -> Result<LoadedSource, ExtensionError> {
        if let Some(hit) = self
            .cache
            .read()
            .ok()
            .and_then(|cache| cache.get(&record.id).cloned())
        {
            return Ok(hit);
        }

        let entry_path = record.entry_path();
        let supported = entry_path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SUPPORTED_ENTRY_EXTENSIONS.contains(&e));
        if !supported {
            return Err(ExtensionError::Load(
                record.slug.clone(),
                format!("unsupported entry file type: {}", entry_path.display()),
            ));
        }

        let code = tokio::fs::read(&entry_path).await.map_err(|e| {
            ExtensionError::Load(
                record.slug.clone(),
                format!("cannot read {}: {e}", entry_path.display()),
            )
        })?;

        if let Some(expected) = record.checksum.as_deref() {
            let actual = sha256_hex(&code);
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(ExtensionError::ChecksumMismatch(
                    entry_path.display().to_string(),
                    expected.to_string(),
                    actual,
                ));
            }
        }

        validate_wasm(&code)?;

        let source = LoadedSource {
            entry_path,
            code: Arc::new(code),
        };
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(record.id.clone(), source.clone());
        }

        tracing::debug!(extension_id = %record.id, path = %source.entry_path.display(), "extension source loaded");
        Ok(source)
    }

    async fn unload(&self, record: &ExtensionRecord) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&record.id);
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Check magic bytes and restrict imports to the allowed namespaces.
pub fn validate_wasm(wasm_bytes: &[u8]) -> Result<(), ExtensionError> {
    if wasm_bytes.len() < 4 || &wasm_bytes[..4] != WASM_MAGIC {
        return Err(ExtensionError::WasmValidation(
            "invalid WASM binary: magic bytes mismatch".into(),
        ));
    }

    use wasmparser::{Parser, Payload};

    for payload in Parser::new(0).parse_all(wasm_bytes) {
        let payload = payload
            .map_err(|e| ExtensionError::WasmValidation(format!("failed to parse WASM: {e}")))?;

        if let Payload::ImportSection(reader) = payload {
            for import in reader {
                let import = import.map_err(|e| {
                    ExtensionError::WasmValidation(format!("failed to read import: {e}"))
                })?;

                if !ALLOWED_IMPORT_NAMESPACES.contains(&import.module) {
                    return Err(ExtensionError::WasmValidation(format!(
                        "unauthorized import namespace: '{}' (function: '{}'); \
                         allowed namespaces: {:?}",
                        import.module, import.name, ALLOWED_IMPORT_NAMESPACES
                    )));
                }
            }
        }
    }

    Ok(())
}
