//! Extension runtime: lifecycle, execution and settings of loaded extensions.
//!
//! Every extension id owns a slot guarded by its own async lock, so loading,
//! settings changes and disposal of one extension never block another.
//! Calls run on the blocking pool and race a global timeout. The budget starts
//! once the call holds the module, so time queued behind other calls to the
//! same extension is free. When the timeout wins, the sandbox is interrupted
//! only if that call is still the one running, and the caller gets
//! [`ExtensionError::Timeout`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock};

use crate::context::{ExtensionContext, HostAllowlist};
use crate::error::ExtensionError;
use crate::http::ScopedHttpClient;
use crate::loader::SourceLoader;
use crate::module::{ExtensionModule, Interrupt, ModuleEvaluator};
use crate::types::{
    ExtensionRecord, CONTENT_METHODS, METHOD_DISPOSE, METHOD_GET_SETTINGS, METHOD_INIT,
    METHOD_ON_SETTINGS_CHANGE,
};

// ─── Configuration ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Budget for a single extension call; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Hosts every extension may reach, merged with its manifest hosts.
    pub allowlist: HostAllowlist,
    /// Directory scanned for locally installed extensions.
    pub install_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_millis(10_000)),
            allowlist: HostAllowlist::default(),
            install_dir: PathBuf::from("./data/extensions"),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let timeout_ms: u64 = std::env::var("EXT_RUNTIME_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        Self {
            timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            allowlist: HostAllowlist::parse(
                &std::env::var("SANDBOX_NET_ALLOWLIST").unwrap_or_default(),
            ),
            install_dir: std::env::var("EXTENSIONS_INSTALL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/extensions")),
        }
    }
}

// ─── Loaded extension entry ─────────────────────────────────────────────

type SharedModule = Arc<Mutex<Box<dyn ExtensionModule>>>;

/// Id of the call currently running inside a module, if any.
type RunningCall = Arc<Mutex<Option<u64>>>;

struct LoadedExtension {
    record: ExtensionRecord,
    module: SharedModule,
    interrupter: Option<Arc<dyn Interrupt>>,
    running: RunningCall,
    /// Replaced wholesale, never mutated in place.
    settings: Arc<serde_json::Value>,
    allowlist: Arc<HostAllowlist>,
}

#[derive(Default)]
struct Slot {
    loaded: AsyncMutex<Option<LoadedExtension>>,
}

/// A prepared call, detached from the slot lock.
struct PreparedCall {
    module: SharedModule,
    interrupter: Option<Arc<dyn Interrupt>>,
    running: RunningCall,
    ctx: ExtensionContext,
}

// ─── Runtime ────────────────────────────────────────────────────────────

pub struct ExtensionRuntime {
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    loader: Arc<dyn SourceLoader>,
    evaluator: Arc<dyn ModuleEvaluator>,
    http: ScopedHttpClient,
    config: RuntimeConfig,
    next_call: AtomicU64,
}

impl std::fmt::Debug for ExtensionRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExtensionRuntime {
    pub fn new(
        config: RuntimeConfig,
        loader: Arc<dyn SourceLoader>,
        evaluator: Arc<dyn ModuleEvaluator>,
        http: ScopedHttpClient,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            loader,
            evaluator,
            http,
            config,
            next_call: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    async fn slot(&self, id: &str) -> Arc<Slot> {
        if let Some(slot) = self.slots.read().await.get(id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Load, evaluate and `init` the extension once. Concurrent first calls
    /// for the same id wait on the slot lock and observe the loaded module.
    pub async fn initialise(&self, record: &ExtensionRecord) -> Result<(), ExtensionError> {
        let slot = self.slot(&record.id).await;
        let mut guard = slot.loaded.lock().await;
        if guard.is_none() {
            *guard = Some(self.load(record).await?);
        }
        Ok(())
    }

    /// Invoke `method` with a JSON payload and return the JSON result
    /// (`null` when the extension produced no output).
    pub async fn execute(
        &self,
        record: &ExtensionRecord,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ExtensionError> {
        let slot = self.slot(&record.id).await;
        let (prepared, payload) = {
            let mut guard = slot.loaded.lock().await;
            if guard.is_none() {
                *guard = Some(self.load(record).await?);
            }
            let Some(loaded) = guard.as_mut() else {
                return Err(ExtensionError::Load(
                    record.slug.clone(),
                    "extension failed to load".into(),
                ));
            };

            if !self.has_method(&loaded.module, method)? {
                if method == METHOD_INIT || method == METHOD_DISPOSE {
                    return Ok(serde_json::Value::Null);
                }
                return Err(ExtensionError::MissingMethod {
                    slug: record.slug.clone(),
                    method: method.to_string(),
                });
            }

            let payload = match method {
                METHOD_GET_SETTINGS => (*loaded.settings).clone(),
                METHOD_ON_SETTINGS_CHANGE => {
                    if payload.is_object() {
                        loaded.settings = Arc::new(payload.clone());
                        tracing::info!(extension_id = %record.id, "extension settings replaced");
                    }
                    payload
                }
                _ => payload,
            };

            (self.prepare(record, loaded), payload)
        };

        let input = serde_json::to_vec(&payload)?;
        let output = self.invoke(record, method, input, prepared).await?;
        parse_output(&output)
    }

    /// Run `dispose`, release the source and evict the module. Disposing an
    /// extension that is not loaded is a no-op.
    pub async fn dispose(&self, record: &ExtensionRecord) -> Result<(), ExtensionError> {
        let Some(slot) = self.slots.read().await.get(&record.id).cloned() else {
            return Ok(());
        };
        self.dispose_slot(&slot).await
    }

    /// Dispose every loaded extension, e.g. on shutdown. Failures are logged.
    pub async fn dispose_all(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            if let Err(e) = self.dispose_slot(&slot).await {
                tracing::warn!("failed to dispose extension: {e}");
            }
        }
    }

    async fn dispose_slot(&self, slot: &Slot) -> Result<(), ExtensionError> {
        let mut guard = slot.loaded.lock().await;
        let Some(loaded) = guard.take() else {
            return Ok(());
        };
        let record = &loaded.record;

        let result = match self.has_method(&loaded.module, METHOD_DISPOSE) {
            Ok(true) => {
                let prepared = self.prepare(record, &loaded);
                self.invoke(record, METHOD_DISPOSE, b"null".to_vec(), prepared)
                    .await
                    .map(|_| ())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        self.loader.unload(record).await;
        tracing::info!(extension_id = %record.id, "extension disposed");
        result
    }

    /// Ids of the extensions currently loaded.
    pub async fn loaded_ids(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<Slot>)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut ids = Vec::new();
        for (id, slot) in slots {
            if slot.loaded.lock().await.is_some() {
                ids.push(id);
            }
        }
        ids.sort();
        ids
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        let Some(slot) = self.slots.read().await.get(id).cloned() else {
            return false;
        };
        let loaded = slot.loaded.lock().await.is_some();
        loaded
    }

    /// Current settings snapshot, if the extension is loaded.
    pub async fn settings(&self, id: &str) -> Option<Arc<serde_json::Value>> {
        let slot = self.slots.read().await.get(id).cloned()?;
        let guard = slot.loaded.lock().await;
        guard.as_ref().map(|l| l.settings.clone())
    }

    // ── internals ────────────────────────────────────────────────────

    async fn load(&self, record: &ExtensionRecord) -> Result<LoadedExtension, ExtensionError> {
        let source = self.loader.load_source(record).await?;

        let evaluator = self.evaluator.clone();
        let rec = record.clone();
        let module = tokio::task::spawn_blocking(move || evaluator.evaluate(&rec, &source))
            .await
            .map_err(|e| ExtensionError::Load(record.slug.clone(), e.to_string()))?;

        let module = match module {
            Ok(module) => module,
            Err(e) => {
                self.loader.unload(record).await;
                return Err(e);
            }
        };

        if !CONTENT_METHODS.iter().any(|m| module.has_method(m)) {
            self.loader.unload(record).await;
            return Err(ExtensionError::Load(
                record.slug.clone(),
                format!(
                    "module exports none of the extension methods ({})",
                    CONTENT_METHODS.join(", ")
                ),
            ));
        }

        let loaded = LoadedExtension {
            record: record.clone(),
            interrupter: module.interrupter(),
            module: Arc::new(Mutex::new(module)),
            running: Arc::default(),
            settings: Arc::new(serde_json::Value::Object(record.manifest.settings.clone())),
            allowlist: Arc::new(
                self.config
                    .allowlist
                    .merged(&record.manifest.permissions.http_hosts),
            ),
        };

        if self.has_method(&loaded.module, METHOD_INIT)? {
            let prepared = self.prepare(record, &loaded);
            if let Err(e) = self
                .invoke(record, METHOD_INIT, b"null".to_vec(), prepared)
                .await
            {
                self.loader.unload(record).await;
                return Err(e);
            }
        }

        tracing::info!(
            extension_id = %record.id,
            extension_slug = %record.slug,
            version = %record.version,
            "extension initialised"
        );
        Ok(loaded)
    }

    fn has_method(&self, module: &SharedModule, method: &str) -> Result<bool, ExtensionError> {
        let module = module
            .lock()
            .map_err(|_| ExtensionError::Sandbox("extension module poisoned".into()))?;
        Ok(module.has_method(method))
    }

    fn prepare(&self, record: &ExtensionRecord, loaded: &LoadedExtension) -> PreparedCall {
        PreparedCall {
            module: loaded.module.clone(),
            interrupter: loaded.interrupter.clone(),
            running: loaded.running.clone(),
            ctx: ExtensionContext::new(
                record,
                loaded.settings.clone(),
                loaded.allowlist.clone(),
                self.http.clone(),
            ),
        }
    }

    async fn invoke(
        &self,
        record: &ExtensionRecord,
        method: &str,
        input: Vec<u8>,
        prepared: PreparedCall,
    ) -> Result<Vec<u8>, ExtensionError> {
        let PreparedCall {
            module,
            interrupter,
            running,
            ctx,
        } = prepared;
        let method_name = method.to_string();
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (locked_tx, locked_rx) = oneshot::channel();

        let call_running = running.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let mut module = module
                .lock()
                .map_err(|_| ExtensionError::Sandbox("extension module poisoned".into()))?;
            set_running(&call_running, Some(call_id));
            let _ = locked_tx.send(());
            let result = module.call(&method_name, &input, &ctx);
            set_running(&call_running, None);
            result
        });

        let Some(limit) = self.config.timeout else {
            return join_call(task.await);
        };
        // the sender is dropped unsent only when locking failed
        if locked_rx.await.is_err() {
            return join_call(task.await);
        }

        match tokio::time::timeout(limit, &mut task).await {
            Ok(joined) => join_call(joined),
            Err(_) => {
                if let Some(interrupter) = interrupter {
                    interrupt_if_running(&running, call_id, interrupter.as_ref());
                }
                tracing::warn!(
                    extension_id = %record.id,
                    method,
                    timeout_ms = limit.as_millis() as u64,
                    "extension call timed out"
                );
                Err(ExtensionError::Timeout(limit.as_millis() as u64))
            }
        }
    }
}

fn set_running(running: &RunningCall, call: Option<u64>) {
    if let Ok(mut current) = running.lock() {
        *current = call;
    }
}

/// Interrupts the module only while `call_id` is still the running call.
/// The check and the interrupt happen under one lock, so a call that has
/// already finished can never cancel the next caller's call.
fn interrupt_if_running(running: &RunningCall, call_id: u64, interrupter: &dyn Interrupt) {
    if let Ok(current) = running.lock() {
        if *current == Some(call_id) {
            interrupter.interrupt();
        }
    }
}

fn join_call(
    joined: Result<Result<Vec<u8>, ExtensionError>, tokio::task::JoinError>,
) -> Result<Vec<u8>, ExtensionError> {
    joined.map_err(|e| ExtensionError::Sandbox(format!("extension task failed: {e}")))?
}

fn parse_output(output: &[u8]) -> Result<serde_json::Value, ExtensionError> {
    if output.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::Value::Null);
    }
    Ok(serde_json::from_slice(output)?)
}
