//! Extension runtime error types.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("failed to load extension {0}: {1}")]
    Load(String, String),

    #[error("extension {slug} does not implement {method}")]
    MissingMethod { slug: String, method: String },

    #[error("extension execution timed out after {0} ms")]
    Timeout(u64),

    #[error("host {0} is not allowlisted for extensions runtime")]
    HostNotAllowed(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("execution limit: extension {0} exhausted its fuel budget")]
    FuelExhausted(String),

    #[error("WASM validation error: {0}")]
    WasmValidation(String),

    #[error("checksum mismatch for {0}: expected {1}, got {2}")]
    ChecksumMismatch(String, String, String),

    #[error("HTTP error: {0}")]
    Http(#[from] crate::http::HttpError),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl ExtensionError {
    /// Bad input from the caller or the extension contract, never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExtensionError::Validation(_)
                | ExtensionError::InvalidManifest(_)
                | ExtensionError::MissingMethod { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    // ── Display messages ──────────────────────────────────────────────

    #[test]
    fn test_display_validation() {
        let err = ExtensionError::Validation("payload must be an object".into());
        assert_eq!(err.to_string(), "validation error: payload must be an object");
    }

    #[test]
    fn test_display_load() {
        let err = ExtensionError::Load("mangadex".into(), "no known methods exported".into());
        assert_eq!(
            err.to_string(),
            "failed to load extension mangadex: no known methods exported"
        );
    }

    #[test]
    fn test_display_missing_method() {
        let err = ExtensionError::MissingMethod {
            slug: "mangadex".into(),
            method: "search".into(),
        };
        assert_eq!(err.to_string(), "extension mangadex does not implement search");
    }

    #[test]
    fn test_display_timeout() {
        let err = ExtensionError::Timeout(10_000);
        assert_eq!(
            err.to_string(),
            "extension execution timed out after 10000 ms"
        );
    }

    #[test]
    fn test_display_host_not_allowed() {
        let err = ExtensionError::HostNotAllowed("evil.example".into());
        assert_eq!(
            err.to_string(),
            "host evil.example is not allowlisted for extensions runtime"
        );
    }

    #[test]
    fn test_display_checksum_mismatch() {
        let err = ExtensionError::ChecksumMismatch("a.wasm".into(), "aa".into(), "bb".into());
        assert_eq!(
            err.to_string(),
            "checksum mismatch for a.wasm: expected aa, got bb"
        );
    }

    // ── From conversions ──────────────────────────────────────────────

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "entry missing");
        let err: ExtensionError = io_err.into();
        assert!(matches!(err, ExtensionError::Io(_)));
        assert!(err.to_string().contains("entry missing"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<String>("{{nope").unwrap_err();
        let err: ExtensionError = json_err.into();
        assert!(matches!(err, ExtensionError::Serialization(_)));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= bad").unwrap_err();
        let err: ExtensionError = toml_err.into();
        assert!(matches!(err, ExtensionError::TomlParse(_)));
    }

    #[test]
    fn test_from_db_error() {
        let db_err = sea_orm::DbErr::Custom("boom".into());
        let err: ExtensionError = db_err.into();
        assert!(matches!(err, ExtensionError::Database(_)));
    }

    // ── Classification ────────────────────────────────────────────────

    #[test]
    fn test_is_validation() {
        assert!(ExtensionError::Validation("x".into()).is_validation());
        assert!(ExtensionError::InvalidManifest("x".into()).is_validation());
        assert!(!ExtensionError::Timeout(1).is_validation());
        assert!(!ExtensionError::HostNotAllowed("x".into()).is_validation());
    }

    #[test]
    fn test_error_source_string_variants() {
        use std::error::Error;
        let err = ExtensionError::Sandbox("trap".into());
        assert!(err.source().is_none());
    }
}
