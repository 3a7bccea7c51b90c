//! MangaShelf Extension Runtime
//!
//! Content-source extensions are WASM modules executed through Extism
//! (wasmtime). The runtime loads each installed extension once, runs calls
//! under a global timeout, exposes an allowlist-scoped HTTP proxy, a tagged
//! logger and a copy-on-write settings snapshot, and releases everything on
//! dispose.

pub mod context;
pub mod error;
pub mod http;
pub mod loader;
pub mod manifest;
pub mod module;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod types;

pub use context::{ExtensionContext, HostAllowlist, HttpGetRequest, LogLevel};
pub use error::ExtensionError;
pub use http::{FetchedBody, HttpConfig, HttpError, HttpResponse, ScopedHttpClient};
pub use loader::{FsSourceLoader, SourceLoader};
pub use manifest::ExtensionManifest;
pub use module::{ExtensionModule, Interrupt, LoadedSource, ModuleEvaluator};
pub use registry::{bootstrap_local_registry, DbExtensionRegistry, ExtensionRegistry};
pub use runtime::{ExtensionRuntime, RuntimeConfig};
pub use sandbox::{SandboxConfig, WasmEvaluator};
pub use types::{ChapterPayload, ExtensionRecord, Page, PagesResult};
