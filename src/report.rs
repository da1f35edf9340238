//! Result reporting to the orchestrator.
//!
//! Outcomes are delivered as JSON POSTs:
//! - `<base>/completeNode` with `{tenantId, flowId, nodeId, result}`
//! - `<base>/failNode` with `{tenantId, flowId, nodeId, errorMsg}`
//!
//! Any 2xx response counts as delivered. Transport errors and 5xx responses are
//! retried with exponential backoff up to the configured attempt count; other
//! statuses fail immediately.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::CallbackConfig;
use crate::error::{DeliveryError, StartupError};
use crate::task::{TaskDescriptor, TaskResult};

/// Sink for task outcomes.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report_success(
        &self,
        tenant: &str,
        flow_id: &str,
        node_id: &str,
        result: &Value,
    ) -> Result<(), DeliveryError>;

    async fn report_failure(
        &self,
        tenant: &str,
        flow_id: &str,
        node_id: &str,
        error_message: &str,
    ) -> Result<(), DeliveryError>;
}

/// Route a [`TaskResult`] to the matching reporter call.
pub async fn report_outcome(
    reporter: &dyn Reporter,
    task: &TaskDescriptor,
    outcome: &TaskResult,
) -> Result<(), DeliveryError> {
    match outcome {
        TaskResult::Success { value } => {
            reporter
                .report_success(&task.tenant_id, &task.flow_id, &task.node_id, value)
                .await
        }
        TaskResult::Failure { error_message } => {
            reporter
                .report_failure(&task.tenant_id, &task.flow_id, &task.node_id, error_message)
                .await
        }
    }
}

// ── Retry policy ────────────────────────────────────────────────────

/// Exponential backoff for callback delivery.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first. `1` disables retry.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each one after.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay after `attempt` (1-indexed) failed: `base * 2^(attempt-1)` plus up to half
    /// of `base` in random jitter.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        let jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        backoff + Duration::from_millis(jitter)
    }
}

impl From<&CallbackConfig> for RetryPolicy {
    fn from(config: &CallbackConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay,
        }
    }
}

// ── HTTP reporter ───────────────────────────────────────────────────

/// Posts outcomes to the orchestrator's callback endpoints.
pub struct HttpReporter {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpReporter {
    /// Build a reporter whose every attempt is bounded by `config.timeout`.
    pub fn new(config: &CallbackConfig) -> Result<Self, StartupError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| StartupError::HttpClient(e.to_string()))?;
        Ok(Self {
            client,
            base_url: config.engine_base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from(config),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post_once(&self, url: &str, body: &Value) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport {
                endpoint: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status {
                endpoint: url.to_string(),
                status: status.as_u16(),
            })
        }
    }

    async fn deliver(&self, path: &str, body: Value) -> Result<(), DeliveryError> {
        let url = self.endpoint(path);
        let mut attempt = 1;
        loop {
            match self.post_once(&url, &body).await {
                Ok(()) => {
                    debug!(endpoint = path, attempt, "Callback delivered");
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.next_delay(attempt);
                    warn!(
                        endpoint = path,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Callback failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn report_success(
        &self,
        tenant: &str,
        flow_id: &str,
        node_id: &str,
        result: &Value,
    ) -> Result<(), DeliveryError> {
        self.deliver(
            "completeNode",
            json!({
                "tenantId": tenant,
                "flowId": flow_id,
                "nodeId": node_id,
                "result": result,
            }),
        )
        .await
    }

    async fn report_failure(
        &self,
        tenant: &str,
        flow_id: &str,
        node_id: &str,
        error_message: &str,
    ) -> Result<(), DeliveryError> {
        self.deliver(
            "failNode",
            json!({
                "tenantId": tenant,
                "flowId": flow_id,
                "nodeId": node_id,
                "errorMsg": error_message,
            }),
        )
        .await
    }
}
