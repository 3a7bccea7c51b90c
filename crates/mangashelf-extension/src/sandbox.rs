//! WASM extension sandbox using Extism (wasmtime).
//!
//! Each extension runs in its own isolated WASM instance with a memory cap,
//! an optional fuel budget and a per-call timeout. The only way out of the
//! sandbox is the host functions registered here:
//!
//! | Function       | Input (JSON)                      | Output (JSON)               |
//! |----------------|-----------------------------------|-----------------------------|
//! | `http_get`     | `{url, headers?, timeoutMs?}`     | `{status, headers, body}`   |
//! | `get_settings` | none                              | current settings object     |
//! | `log_debug`, `log_info`, `log_warn`, `log_error` | message string | none        |

use std::sync::Arc;
use std::time::Duration;

use extism::{CurrentPlugin, Function, UserData, Val, ValType, PTR};

use crate::context::{ExtensionContext, HttpGetRequest, LogLevel};
use crate::error::ExtensionError;
use crate::module::{ExtensionModule, Interrupt, LoadedSource, ModuleEvaluator};
use crate::types::ExtensionRecord;

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Fuel (instructions) per call; 0 disables metering.
    pub fuel_limit: u64,
    /// Hard per-call timeout enforced inside wasmtime.
    pub call_timeout: Option<Duration>,
    /// Whether to enable WASI (default: false).
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 0,
            call_timeout: Some(Duration::from_millis(10_000)),
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let timeout_ms: u64 = std::env::var("EXT_RUNTIME_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        Self {
            memory_limit: std::env::var("EXT_MEMORY_LIMIT_MB")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: std::env::var("EXT_FUEL_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            call_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            wasi_enabled: std::env::var("EXT_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Host functions ─────────────────────────────────────────────────────

/// Per-instance slot the host functions read during a call.
#[derive(Default)]
struct CallState {
    ctx: Option<ExtensionContext>,
    /// Typed error raised by a host function, preferred over the trap message.
    host_error: Option<ExtensionError>,
}

fn current_context(user_data: &UserData<CallState>) -> Result<ExtensionContext, extism::Error> {
    let state = user_data.get()?;
    let guard = state
        .lock()
        .map_err(|_| extism::Error::msg("extension call state poisoned"))?;
    guard
        .ctx
        .clone()
        .ok_or_else(|| extism::Error::msg("host function called outside of an extension call"))
}

fn record_host_error(user_data: &UserData<CallState>, err: ExtensionError) {
    if let Ok(state) = user_data.get() {
        if let Ok(mut guard) = state.lock() {
            guard.host_error = Some(err);
        }
    }
}

fn host_http_get(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<CallState>,
) -> Result<(), extism::Error> {
    let ctx = current_context(&user_data)?;
    let raw: String = plugin.memory_get_val(&inputs[0])?;
    let request: HttpGetRequest = serde_json::from_str(&raw)?;

    match ctx.http_get_blocking(&request) {
        Ok(resp) => {
            let json = serde_json::to_string(&resp)?;
            plugin.memory_set_val(&mut outputs[0], json)?;
            Ok(())
        }
        Err(e) => {
            let msg = e.to_string();
            record_host_error(&user_data, e);
            Err(extism::Error::msg(msg))
        }
    }
}

fn host_get_settings(
    plugin: &mut CurrentPlugin,
    _inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<CallState>,
) -> Result<(), extism::Error> {
    let ctx = current_context(&user_data)?;
    let json = serde_json::to_string(ctx.settings())?;
    plugin.memory_set_val(&mut outputs[0], json)?;
    Ok(())
}

fn host_log(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    user_data: &UserData<CallState>,
    level: LogLevel,
) -> Result<(), extism::Error> {
    let ctx = current_context(user_data)?;
    let message: String = plugin.memory_get_val(&inputs[0])?;
    ctx.log(level, &message);
    Ok(())
}

fn host_functions(state: &UserData<CallState>) -> Vec<Function> {
    let no_params: [ValType; 0] = [];
    let mut functions = vec![
        Function::new("http_get", [PTR], [PTR], state.clone(), host_http_get),
        Function::new("get_settings", no_params, [PTR], state.clone(), host_get_settings),
    ];
    for (name, level) in [
        ("log_debug", LogLevel::Debug),
        ("log_info", LogLevel::Info),
        ("log_warn", LogLevel::Warn),
        ("log_error", LogLevel::Error),
    ] {
        let no_results: [ValType; 0] = [];
        functions.push(Function::new(
            name,
            [PTR],
            no_results,
            state.clone(),
            move |plugin: &mut CurrentPlugin,
                  inputs: &[Val],
                  _outputs: &mut [Val],
                  user_data: UserData<CallState>| {
                host_log(plugin, inputs, &user_data, level)
            },
        ));
    }
    functions
}

// ─── Sandbox ────────────────────────────────────────────────────────────

struct CancelInterrupter {
    handle: extism::CancelHandle,
    name: String,
}

impl Interrupt for CancelInterrupter {
    fn interrupt(&self) {
        if let Err(e) = self.handle.cancel() {
            tracing::warn!(extension = %self.name, "failed to cancel extension call: {e}");
        }
    }
}

/// A loaded WASM extension.
pub struct WasmModule {
    plugin: extism::Plugin,
    state: UserData<CallState>,
    interrupter: Arc<CancelInterrupter>,
    name: String,
    timeout_ms: u64,
}

impl std::fmt::Debug for WasmModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmModule")
            .field("name", &self.name)
            .field("timeout_ms", &self.timeout_ms)
            .finish_non_exhaustive()
    }
}

impl WasmModule {
    fn with_state<R>(&self, f: impl FnOnce(&mut CallState) -> R) -> Result<R, ExtensionError> {
        let state = self
            .state
            .get()
            .map_err(|e| ExtensionError::Sandbox(e.to_string()))?;
        let mut guard = state
            .lock()
            .map_err(|_| ExtensionError::Sandbox("extension call state poisoned".into()))?;
        Ok(f(&mut guard))
    }

    fn classify(&self, err: extism::Error) -> ExtensionError {
        let msg = err.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("fuel") {
            ExtensionError::FuelExhausted(self.name.clone())
        } else if lower.contains("timeout") || lower.contains("cancel") {
            ExtensionError::Timeout(self.timeout_ms)
        } else {
            ExtensionError::Sandbox(msg)
        }
    }
}

impl ExtensionModule for WasmModule {
    fn has_method(&self, method: &str) -> bool {
        self.plugin.function_exists(method)
    }

    fn call(
        &mut self,
        method: &str,
        payload: &[u8],
        ctx: &ExtensionContext,
    ) -> Result<Vec<u8>, ExtensionError> {
        self.with_state(|s| {
            s.ctx = Some(ctx.clone());
            s.host_error = None;
        })?;

        let result = self.plugin.call::<&[u8], Vec<u8>>(method, payload);

        let host_error = self.with_state(|s| {
            s.ctx = None;
            s.host_error.take()
        })?;

        match result {
            Ok(output) => Ok(output),
            Err(e) => Err(host_error.unwrap_or_else(|| self.classify(e))),
        }
    }

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        Some(self.interrupter.clone())
    }
}

/// Builds [`WasmModule`]s from loaded source bytes.
#[derive(Debug, Clone, Default)]
pub struct WasmEvaluator {
    config: SandboxConfig,
}

impl WasmEvaluator {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

impl ModuleEvaluator for WasmEvaluator {
    fn evaluate(
        &self,
        record: &ExtensionRecord,
        source: &LoadedSource,
    ) -> Result<Box<dyn ExtensionModule>, ExtensionError> {
        let mut manifest = extism::Manifest::new([extism::Wasm::data(source.code.to_vec())])
            .with_memory_max((self.config.memory_limit / 65536) as u32);
        if let Some(timeout) = self.config.call_timeout {
            manifest = manifest.with_timeout(timeout);
        }

        if self.config.wasi_enabled {
            tracing::warn!(
                extension = %record.slug,
                "WASI enabled for extension; it can read environment variables"
            );
        }

        let state = UserData::new(CallState::default());
        let mut builder = extism::PluginBuilder::new(manifest)
            .with_wasi(self.config.wasi_enabled)
            .with_functions(host_functions(&state));
        if self.config.fuel_limit > 0 {
            builder = builder.with_fuel_limit(self.config.fuel_limit);
        }

        let plugin = builder
            .build()
            .map_err(|e| ExtensionError::Load(record.slug.clone(), e.to_string()))?;

        let interrupter = Arc::new(CancelInterrupter {
            handle: plugin.cancel_handle(),
            name: record.slug.clone(),
        });

        Ok(Box::new(WasmModule {
            plugin,
            state,
            interrupter,
            name: record.slug.clone(),
            timeout_ms: self
                .config
                .call_timeout
                .map(|t| t.as_millis() as u64)
                .unwrap_or(0),
        }))
    }
}
