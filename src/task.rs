//! Task descriptors and results — the data exchanged with the queue and the orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TaskError;

/// Routing key for a handler: `(category, operation)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub category: String,
    pub operation: String,
}

impl TaskKey {
    pub fn new(category: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.category, self.operation)
    }
}

/// One unit of work dequeued from a tenant queue. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    /// Present only when the caller expects a correlated reply on the result channel.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub tenant_id: String,
    pub flow_id: String,
    pub node_id: String,
    pub category: String,
    pub operation: String,
    pub config: Map<String, Value>,
    pub input: Value,
}

/// Wire shape before validation. Every field is optional so that a missing
/// `tenantId` is reported as such instead of as a generic decode error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTask {
    id: Option<String>,
    tenant_id: Option<String>,
    flow_id: Option<String>,
    node_id: Option<String>,
    category: Option<String>,
    operation: Option<String>,
    #[serde(default)]
    config: Option<Map<String, Value>>,
    #[serde(default)]
    input: Value,
}

impl TaskDescriptor {
    /// Parse one queue entry.
    pub fn from_json(raw: &str) -> Result<Self, TaskError> {
        let wire: WireTask =
            serde_json::from_str(raw).map_err(|e| TaskError::Unparsable(e.to_string()))?;

        Ok(Self {
            id: wire.id.filter(|s| !s.is_empty()),
            tenant_id: required(wire.tenant_id, "tenantId")?,
            flow_id: required(wire.flow_id, "flowId")?,
            node_id: required(wire.node_id, "nodeId")?,
            category: wire.category.unwrap_or_default(),
            operation: wire.operation.unwrap_or_default(),
            config: wire.config.unwrap_or_default(),
            input: wire.input,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.category.clone(), self.operation.clone())
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, TaskError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(TaskError::MissingField(field)),
    }
}

/// Outcome of executing a task. Exactly one of value or error message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum TaskResult {
    Success { value: Value },
    #[serde(rename_all = "camelCase")]
    Failure { error_message: String },
}

impl TaskResult {
    pub fn success(value: Value) -> Self {
        TaskResult::Success { value }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        TaskResult::Failure {
            error_message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskResult::Success { .. })
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            TaskResult::Failure { error_message } => Some(error_message),
            TaskResult::Success { .. } => None,
        }
    }
}
