//! Error types for the flow runner.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Queue backend errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend connection failed: {0}")]
    Connection(String),

    #[error("Queue command {command} failed on {key}: {reason}")]
    Command {
        command: &'static str,
        key: String,
        reason: String,
    },

    #[error("Failed to encode queue payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Connection(e.to_string())
    }
}

/// A queue entry that cannot become a task. Dropped without a callback.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("payload is not a task object: {0}")]
    Unparsable(String),

    #[error("required field {0} is missing or empty")]
    MissingField(&'static str),
}

/// Failure raised by a task handler. Reported to the orchestrator as a task failure.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Execution(#[from] ExecutionError),

    #[error("{0}")]
    Failed(String),
}

/// Errors from preparing or calling caller-supplied code.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Compilation error: {0}")]
    Compilation(String),

    #[error("Entry point not found: neither '{requested}' nor '{fallback}' is defined")]
    EntryPointNotFound { requested: String, fallback: String },

    #[error("Script error: {0}")]
    Runtime(String),

    #[error("Script exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Value conversion failed: {0}")]
    Conversion(String),
}

/// Completion callback errors. Logged only; never surfaced to the task's originator.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Callback {endpoint} transport failure: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("Callback {endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
}

impl DeliveryError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::Transport { .. } => true,
            DeliveryError::Status { status, .. } => *status >= 500,
        }
    }
}

/// Conditions that abort the process before any tenant loop starts.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Queue backend unavailable: {0}")]
    QueueUnavailable(#[source] QueueError),

    #[error("Handler registry is empty")]
    EmptyRegistry,

    #[error("No tenants configured")]
    NoTenants,

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_retry_classification() {
        let transport = DeliveryError::Transport {
            endpoint: "completeNode".into(),
            reason: "connection refused".into(),
        };
        assert!(transport.is_retryable());

        let server = DeliveryError::Status {
            endpoint: "completeNode".into(),
            status: 503,
        };
        assert!(server.is_retryable());

        let client = DeliveryError::Status {
            endpoint: "failNode".into(),
            status: 404,
        };
        assert!(!client.is_retryable());
    }

    #[test]
    fn handler_error_keeps_execution_message() {
        let err: HandlerError = ExecutionError::Compilation("unexpected '}'".into()).into();
        assert_eq!(err.to_string(), "Compilation error: unexpected '}'");
    }
}
