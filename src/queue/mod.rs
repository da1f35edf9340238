//! Tenant-scoped task queues and per-task result channels.
//!
//! - `QueueBackend` — raw list operations (blocking pop, one-shot pop, push, expiring push)
//! - `QueueClient` — tenant queue consumption: key naming, parsing, malformed-entry handling
//! - `ResultChannel` — transient per-task reply lists with a retention window
//! - `RedisQueue` / `InMemoryQueue` — backend implementations

pub mod memory;
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::task::{TaskDescriptor, TaskResult};

pub use self::memory::InMemoryQueue;
pub use self::redis::RedisQueue;

/// Raw FIFO list operations keyed by name.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Pop the oldest entry of `key`, waiting up to `timeout`. `None` on timeout.
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError>;

    /// Like [`pop`](Self::pop), for a key that is read once and then abandoned.
    /// Backends should not keep per-key resources around for it.
    async fn pop_once(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        self.pop(key, timeout).await
    }

    /// Append an entry to `key`.
    async fn push(&self, key: &str, payload: &str) -> Result<(), QueueError>;

    /// Append an entry to `key` and (re)arm the key's expiry.
    async fn push_expiring(&self, key: &str, payload: &str, ttl: Duration)
    -> Result<(), QueueError>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), QueueError>;
}

/// Consumer view over the per-tenant task queues.
#[derive(Clone)]
pub struct QueueClient {
    backend: Arc<dyn QueueBackend>,
    prefix: String,
}

impl QueueClient {
    pub fn new(backend: Arc<dyn QueueBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
        }
    }

    /// Queue key for a tenant, e.g. `taskQueue_acme`.
    pub fn queue_key(&self, tenant: &str) -> String {
        format!("{}{}", self.prefix, tenant)
    }

    /// Blocking dequeue with a bounded wait.
    ///
    /// Returns `Ok(None)` on timeout and for entries that are not well-formed tasks;
    /// malformed entries are logged and dropped, never retried.
    pub async fn dequeue(
        &self,
        tenant: &str,
        timeout: Duration,
    ) -> Result<Option<TaskDescriptor>, QueueError> {
        let key = self.queue_key(tenant);
        let Some(raw) = self.backend.pop(&key, timeout).await? else {
            return Ok(None);
        };

        match TaskDescriptor::from_json(&raw) {
            Ok(task) => {
                if task.tenant_id != tenant {
                    debug!(
                        tenant = %tenant,
                        task_tenant = %task.tenant_id,
                        "Task tenant differs from queue tenant"
                    );
                }
                Ok(Some(task))
            }
            Err(e) => {
                warn!(
                    tenant = %tenant,
                    queue = %key,
                    error = %e,
                    payload = %truncate(&raw, 256),
                    "Dropping malformed task"
                );
                Ok(None)
            }
        }
    }

    /// Producer side: append a task to its tenant's queue.
    pub async fn enqueue(&self, task: &TaskDescriptor) -> Result<(), QueueError> {
        let payload = task.to_json()?;
        self.backend
            .push(&self.queue_key(&task.tenant_id), &payload)
            .await
    }

    /// Push an arbitrary raw entry (used to inject malformed payloads in tests and tools).
    pub async fn enqueue_raw(&self, tenant: &str, payload: &str) -> Result<(), QueueError> {
        self.backend.push(&self.queue_key(tenant), payload).await
    }
}

/// Per-task reply lists for callers that correlate synchronously on the task id.
#[derive(Clone)]
pub struct ResultChannel {
    backend: Arc<dyn QueueBackend>,
    prefix: String,
    retention: Duration,
}

impl ResultChannel {
    pub fn new(backend: Arc<dyn QueueBackend>, prefix: impl Into<String>, retention: Duration) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            retention,
        }
    }

    pub fn result_key(&self, task_id: &str) -> String {
        format!("{}{}", self.prefix, task_id)
    }

    /// Publish a task's result. The key expires after the retention window.
    pub async fn publish(&self, task_id: &str, result: &TaskResult) -> Result<(), QueueError> {
        let payload = serde_json::to_string(result)?;
        self.backend
            .push_expiring(&self.result_key(task_id), &payload, self.retention)
            .await
    }

    /// Wait up to `timeout` for the result of `task_id`.
    pub async fn take(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<TaskResult>, QueueError> {
        let key = self.result_key(task_id);
        let Some(raw) = self.backend.pop_once(&key, timeout).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| QueueError::Command {
                command: "decode",
                key,
                reason: e.to_string(),
            })
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
