//! Configuration types, built from environment variables.

use std::time::Duration;

use crate::error::ConfigError;

/// Which queue backend the runner consumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackendKind {
    Redis,
    Memory,
}

/// Queue connection and key layout.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackendKind,
    pub redis_host: String,
    pub redis_port: u16,
    /// Tenant queue key prefix (`taskQueue_<tenant>`).
    pub queue_prefix: String,
    /// Result channel key prefix (`taskResult_<task id>`).
    pub result_prefix: String,
    /// How long an unconsumed result channel survives.
    pub result_ttl: Duration,
    /// Upper bound on a single blocking pop.
    pub dequeue_timeout: Duration,
}

impl QueueConfig {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::Redis,
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            queue_prefix: "taskQueue_".to_string(),
            result_prefix: "taskResult_".to_string(),
            result_ttl: Duration::from_secs(3600), // 1 hour
            dequeue_timeout: Duration::from_secs(5),
        }
    }
}

/// Orchestrator callback settings.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    /// Base URL; `/completeNode` and `/failNode` are appended.
    pub engine_base_url: String,
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
    /// Total delivery attempts, including the first. 1 disables retry.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled for each subsequent one.
    pub retry_base_delay: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            engine_base_url: "http://localhost:3000/flowengine".to_string(),
            timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
        }
    }
}

/// Bounds applied to caller-supplied scripts.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    pub max_operations: u64,
    pub deadline: Duration,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            max_operations: 1_000_000,
            deadline: Duration::from_secs(2),
            max_call_levels: 32,
            max_string_size: 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 10_000,
        }
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub tenants: Vec<String>,
    pub queue: QueueConfig,
    pub callback: CallbackConfig,
    pub script: ScriptConfig,
    /// Sleep after an empty dequeue or a queue error.
    pub idle_backoff: Duration,
    /// Directory for rolling log files; stderr when unset.
    pub log_dir: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tenants: vec!["default".to_string()],
            queue: QueueConfig::default(),
            callback: CallbackConfig::default(),
            script: ScriptConfig::default(),
            idle_backoff: Duration::from_millis(500),
            log_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let tenants = match lookup("TENANTS") {
            Some(raw) => parse_tenants(&raw),
            None => defaults.tenants,
        };
        if tenants.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "TENANTS".to_string(),
                hint: "Provide a comma-separated list such as TENANTS=acme,globex".to_string(),
            });
        }

        let backend = match lookup("QUEUE_BACKEND").as_deref() {
            None | Some("redis") => QueueBackendKind::Redis,
            Some("memory") => QueueBackendKind::Memory,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "QUEUE_BACKEND".to_string(),
                    message: format!("expected 'redis' or 'memory', got '{other}'"),
                });
            }
        };

        let queue = QueueConfig {
            backend,
            redis_host: lookup("REDIS_HOST").unwrap_or(defaults.queue.redis_host),
            redis_port: parse_or(&lookup, "REDIS_PORT", defaults.queue.redis_port)?,
            queue_prefix: lookup("QUEUE_PREFIX").unwrap_or(defaults.queue.queue_prefix),
            result_prefix: lookup("RESULT_PREFIX").unwrap_or(defaults.queue.result_prefix),
            result_ttl: Duration::from_secs(parse_or(
                &lookup,
                "RESULT_TTL_SECS",
                defaults.queue.result_ttl.as_secs(),
            )?),
            dequeue_timeout: Duration::from_secs(parse_or(
                &lookup,
                "DEQUEUE_TIMEOUT_SECS",
                defaults.queue.dequeue_timeout.as_secs(),
            )?),
        };

        let max_attempts: u32 =
            parse_or(&lookup, "CALLBACK_MAX_ATTEMPTS", defaults.callback.max_attempts)?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CALLBACK_MAX_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let timeout_secs: u64 = parse_or(
            &lookup,
            "CALLBACK_TIMEOUT_SECS",
            defaults.callback.timeout.as_secs(),
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CALLBACK_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        let callback = CallbackConfig {
            engine_base_url: lookup("FLOWENGINE_URL").unwrap_or(defaults.callback.engine_base_url),
            timeout: Duration::from_secs(timeout_secs),
            max_attempts,
            retry_base_delay: Duration::from_millis(parse_or(
                &lookup,
                "CALLBACK_RETRY_BASE_MS",
                defaults.callback.retry_base_delay.as_millis() as u64,
            )?),
        };

        let script = ScriptConfig {
            max_operations: parse_or(
                &lookup,
                "SCRIPT_MAX_OPERATIONS",
                defaults.script.max_operations,
            )?,
            deadline: Duration::from_millis(parse_or(
                &lookup,
                "SCRIPT_DEADLINE_MS",
                defaults.script.deadline.as_millis() as u64,
            )?),
            ..defaults.script
        };

        Ok(Self {
            tenants,
            queue,
            callback,
            script,
            idle_backoff: Duration::from_millis(parse_or(
                &lookup,
                "IDLE_BACKOFF_MS",
                defaults.idle_backoff.as_millis() as u64,
            )?),
            log_dir: lookup("LOG_DIR").filter(|s| !s.trim().is_empty()),
        })
    }
}

/// Split a comma-separated tenant list, dropping blanks and duplicates.
pub fn parse_tenants(raw: &str) -> Vec<String> {
    let mut tenants: Vec<String> = Vec::new();
    for t in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !tenants.iter().any(|existing| existing == t) {
            tenants.push(t.to_string());
        }
    }
    tenants
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}
