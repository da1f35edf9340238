//! Execution capability for caller-supplied code.
//!
//! Handlers that run custom transformation code, custom tools or custom graph nodes go
//! through an [`ExecutionCapability`]: it turns source text into a [`Callable`] without
//! invoking it. The default implementation, [`ScriptSandbox`], evaluates an embedded
//! script language against an allow-list of primitives and bounds every call.
//!
//! This is a convention-enforcing allow-list, not a security boundary. Untrusted code
//! needs an out-of-process implementation of the same trait.

pub mod script;

use std::sync::Arc;

use serde_json::Value;

use crate::error::ExecutionError;

pub use self::script::{Primitive, ScriptSandbox};

/// Entry point used when the requested one is absent.
pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Something that can turn source code into a callable.
pub trait ExecutionCapability: Send + Sync {
    /// Evaluate `source` and resolve `entry_point` (falling back to [`DEFAULT_ENTRY_POINT`]).
    fn prepare(
        &self,
        source: &str,
        entry_point: Option<&str>,
    ) -> Result<Arc<dyn Callable>, ExecutionError>;
}

/// A resolved entry point. Calling it is synchronous and may be CPU-bound.
pub trait Callable: Send + Sync {
    /// Name the callable was resolved under.
    fn entry_point(&self) -> &str;

    fn call(&self, input: &Value) -> Result<Value, ExecutionError>;
}

/// Prepare source on the blocking pool. Top-level statements run during preparation.
pub async fn prepare_blocking(
    capability: Arc<dyn ExecutionCapability>,
    source: String,
    entry_point: Option<String>,
) -> Result<Arc<dyn Callable>, ExecutionError> {
    tokio::task::spawn_blocking(move || capability.prepare(&source, entry_point.as_deref()))
        .await
        .map_err(|e| ExecutionError::Compilation(format!("script task failed: {e}")))?
}

/// Invoke a callable on the blocking pool so script evaluation never stalls the runtime.
pub async fn call_blocking(callable: Arc<dyn Callable>, input: Value) -> Result<Value, ExecutionError> {
    tokio::task::spawn_blocking(move || callable.call(&input))
        .await
        .map_err(|e| ExecutionError::Runtime(format!("script task failed: {e}")))?
}
