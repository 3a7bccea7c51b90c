//! Seams between the runtime and whatever actually evaluates extension code.
//!
//! Production uses [`crate::sandbox::WasmEvaluator`]. Tests plug in-process
//! modules through the same traits.

use std::path::PathBuf;
use std::sync::Arc;

use crate::context::ExtensionContext;
use crate::error::ExtensionError;
use crate::types::ExtensionRecord;

/// Source bytes handed out by a [`crate::loader::SourceLoader`].
#[derive(Debug, Clone)]
pub struct LoadedSource {
    pub entry_path: PathBuf,
    pub code: Arc<Vec<u8>>,
}

/// Stops a call that is still running on a blocking thread.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// An evaluated extension. Calls are synchronous and run on the blocking
/// pool; the runtime serialises calls per module.
pub trait ExtensionModule: Send {
    fn has_method(&self, method: &str) -> bool;

    /// Invoke `method` with a JSON payload, returning JSON bytes (possibly empty).
    fn call(
        &mut self,
        method: &str,
        payload: &[u8],
        ctx: &ExtensionContext,
    ) -> Result<Vec<u8>, ExtensionError>;

    fn interrupter(&self) -> Option<Arc<dyn Interrupt>> {
        None
    }
}

pub trait ModuleEvaluator: Send + Sync {
    fn evaluate(
        &self,
        record: &ExtensionRecord,
        source: &LoadedSource,
    ) -> Result<Box<dyn ExtensionModule>, ExtensionError>;
}
