//! Download pipeline error types.

use mangashelf_extension::{ExtensionError, HttpError};
use mangashelf_storage::StorageError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("validation error: {0}")]
    Validation(String),

    /// Extension or data inconsistency; never retried.
    #[error("{0}")]
    Domain(String),

    #[error("download not found: {0}")]
    NotFound(Uuid),

    #[error("download cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Extension(#[from] ExtensionError),

    #[error("failed to download page: {0}")]
    Http(#[from] HttpError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

impl DownloadError {
    /// Caller mistakes, reported as 400 by the API.
    pub fn is_validation(&self) -> bool {
        match self {
            DownloadError::Validation(_) => true,
            DownloadError::Extension(e) => e.is_validation(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_domain_is_bare_message() {
        let err = DownloadError::Domain("Extension did not return any pages to download".into());
        assert_eq!(
            err.to_string(),
            "Extension did not return any pages to download"
        );
    }

    #[test]
    fn test_display_http() {
        let err = DownloadError::from(HttpError::Status {
            status: 503,
            url: "https://img.example/1.png".into(),
        });
        assert_eq!(
            err.to_string(),
            "failed to download page: request to https://img.example/1.png failed with status 503"
        );
    }

    #[test]
    fn test_extension_errors_are_transparent() {
        let err = DownloadError::from(ExtensionError::Timeout(10_000));
        assert_eq!(err.to_string(), "extension execution timed out after 10000 ms");
        assert!(!err.is_validation());
    }

    #[test]
    fn test_validation_classification() {
        assert!(DownloadError::Validation("x".into()).is_validation());
        assert!(DownloadError::from(ExtensionError::MissingMethod {
            slug: "demo".into(),
            method: "getPages".into(),
        })
        .is_validation());
        assert!(!DownloadError::Cancelled.is_validation());
        assert!(!DownloadError::NotFound(Uuid::nil()).is_validation());
    }

    #[test]
    fn test_is_cancelled() {
        assert!(DownloadError::Cancelled.is_cancelled());
        assert!(!DownloadError::Domain("x".into()).is_cancelled());
    }
}
