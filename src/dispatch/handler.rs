//! Task handler abstraction.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::HandlerError;

/// Logic that performs the work for one `(category, operation)`.
///
/// Handlers receive the task's `config` and `input` exactly as dequeued. A handler
/// that builds shared resources must finish construction before publishing them.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError>;
}

/// Read a required string field from task config.
pub fn require_str<'a>(config: &'a Map<String, Value>, key: &str) -> Result<&'a str, HandlerError> {
    config
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::InvalidParameters(format!("missing '{key}' parameter")))
}

/// Read an optional string field from task config.
pub fn optional_str<'a>(config: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    config.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Read an optional unsigned integer from task config, with a default.
pub fn usize_or(config: &Map<String, Value>, key: &str, default: usize) -> Result<usize, HandlerError> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v.as_u64().map(|n| n as usize).ok_or_else(|| {
            HandlerError::InvalidParameters(format!("'{key}' must be a non-negative integer"))
        }),
    }
}
