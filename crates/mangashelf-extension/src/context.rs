//! Capability surface handed to extensions on every call.
//!
//! A context carries a frozen settings snapshot, an allowlist-checked HTTP
//! proxy and a logger tagged with the extension identity. A fresh context
//! is built for each call, so a settings change never leaks into a call
//! already in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ExtensionError;
use crate::http::{HttpResponse, ScopedHttpClient};
use crate::types::ExtensionRecord;

/// Maximum log message length from extensions.
const MAX_LOG_MESSAGE_LEN: usize = 2048;

/// Strips control characters (except newline/tab), truncates to max length.
fn sanitize_log_message(message: &str) -> String {
    let cleaned: String = message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_LOG_MESSAGE_LEN)
        .collect();
    if message.chars().count() > MAX_LOG_MESSAGE_LEN {
        format!("{cleaned}… (truncated)")
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Arguments of the `http_get` host call.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetRequest {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Host allowlist. Entries are lowercase hostnames or `*.domain` globs;
/// an empty list allows every host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostAllowlist {
    hosts: Vec<String>,
}

impl HostAllowlist {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut hosts: Vec<String> = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        hosts.sort();
        hosts.dedup();
        Self { hosts }
    }

    /// Parse a comma separated list, e.g. `SANDBOX_NET_ALLOWLIST`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    /// Union of two lists.
    pub fn merged(&self, extra: &[String]) -> Self {
        Self::new(self.hosts.iter().chain(extra.iter()))
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Check a URL's host against the list (supports `*` and `*.suffix`).
    pub fn check(&self, url_str: &str) -> Result<(), ExtensionError> {
        if self.hosts.is_empty() || self.hosts.iter().any(|h| h == "*") {
            return Ok(());
        }

        let url = url::Url::parse(url_str)
            .map_err(|_| ExtensionError::Validation(format!("invalid URL: {url_str}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ExtensionError::Validation(format!("URL has no host: {url_str}")))?
            .to_ascii_lowercase();

        let matches = self.hosts.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host == suffix || host.ends_with(&format!(".{suffix}"))
            } else {
                host == *pattern
            }
        });

        if matches {
            Ok(())
        } else {
            Err(ExtensionError::HostNotAllowed(host))
        }
    }
}

#[derive(Clone)]
pub struct ExtensionContext {
    extension_id: String,
    slug: String,
    version: String,
    settings: Arc<serde_json::Value>,
    allowlist: Arc<HostAllowlist>,
    http: ScopedHttpClient,
    handle: tokio::runtime::Handle,
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("extension_id", &self.extension_id)
            .field("version", &self.version)
            .field("allowlist", &self.allowlist)
            .finish_non_exhaustive()
    }
}

impl ExtensionContext {
    /// Must be called from inside a tokio runtime; the handle is used to
    /// drive HTTP requests from blocking sandbox threads.
    pub fn new(
        record: &ExtensionRecord,
        settings: Arc<serde_json::Value>,
        allowlist: Arc<HostAllowlist>,
        http: ScopedHttpClient,
    ) -> Self {
        Self {
            extension_id: record.id.clone(),
            slug: record.slug.clone(),
            version: record.version.clone(),
            settings,
            allowlist,
            http,
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    /// Frozen settings snapshot for this call.
    pub fn settings(&self) -> &serde_json::Value {
        &self.settings
    }

    pub async fn http_get(&self, request: &HttpGetRequest) -> Result<HttpResponse, ExtensionError> {
        self.allowlist.check(&request.url)?;
        let resp = self
            .http
            .get_text(
                &request.url,
                &request.headers,
                request.timeout_ms.map(Duration::from_millis),
            )
            .await?;
        Ok(resp)
    }

    /// Blocking variant for sandbox host functions. Never call from async code.
    pub fn http_get_blocking(&self, request: &HttpGetRequest) -> Result<HttpResponse, ExtensionError> {
        self.handle.block_on(self.http_get(request))
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        let msg = sanitize_log_message(message);
        let (id, slug, version) = (&self.extension_id, &self.slug, &self.version);
        match level {
            LogLevel::Debug => {
                tracing::debug!(extension_id = %id, extension_slug = %slug, extension_version = %version, "{msg}")
            }
            LogLevel::Info => {
                tracing::info!(extension_id = %id, extension_slug = %slug, extension_version = %version, "{msg}")
            }
            LogLevel::Warn => {
                tracing::warn!(extension_id = %id, extension_slug = %slug, extension_version = %version, "{msg}")
            }
            LogLevel::Error => {
                tracing::error!(extension_id = %id, extension_slug = %slug, extension_version = %version, "{msg}")
            }
        }
    }
}
