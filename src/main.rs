use std::sync::Arc;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;

use flow_runner::config::{QueueBackendKind, WorkerConfig};
use flow_runner::dispatch::{Dispatcher, HandlerRegistry};
use flow_runner::error::StartupError;
use flow_runner::execution::{ExecutionCapability, ScriptSandbox};
use flow_runner::handlers::{self, HandleTables};
use flow_runner::pool::{PoolDeps, WorkerPool};
use flow_runner::queue::{InMemoryQueue, QueueBackend, QueueClient, RedisQueue, ResultChannel};
use flow_runner::report::HttpReporter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env()?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("Flow runner v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Tenants: {}", config.tenants.join(", "));
    eprintln!("   Engine:  {}", config.callback.engine_base_url);

    // ── Queue backend ────────────────────────────────────────────────────
    let backend: Arc<dyn QueueBackend> = match config.queue.backend {
        QueueBackendKind::Redis => {
            let url = config.queue.redis_url();
            let redis = RedisQueue::connect(&url)
                .await
                .map_err(StartupError::QueueUnavailable)
                .with_context(|| format!("connecting to {url}"))?;
            Arc::new(redis)
        }
        QueueBackendKind::Memory => {
            tracing::warn!("Using in-memory queue backend; tasks are not shared between processes");
            Arc::new(InMemoryQueue::new())
        }
    };
    backend
        .ping()
        .await
        .map_err(StartupError::QueueUnavailable)?;
    tracing::info!(backend = ?config.queue.backend, "Queue backend reachable");

    // ── Handlers ─────────────────────────────────────────────────────────
    let execution: Arc<dyn ExecutionCapability> = Arc::new(ScriptSandbox::new(&config.script));
    let tables = HandleTables::default();

    let mut registry = HandlerRegistry::new();
    handlers::register_builtin(&mut registry, execution, &tables)?;
    if registry.is_empty() {
        return Err(StartupError::EmptyRegistry.into());
    }
    let keys: Vec<String> = registry.keys().iter().map(ToString::to_string).collect();
    tracing::info!(handlers = %keys.join(", "), "Handler registry ready");

    // ── Pool ─────────────────────────────────────────────────────────────
    let reporter = Arc::new(HttpReporter::new(&config.callback)?);
    let pool = WorkerPool::new(PoolDeps {
        queue: QueueClient::new(Arc::clone(&backend), config.queue.queue_prefix.clone()),
        dispatcher: Dispatcher::new(Arc::new(registry)),
        reporter,
        results: Some(ResultChannel::new(
            Arc::clone(&backend),
            config.queue.result_prefix.clone(),
            config.queue.result_ttl,
        )),
        dequeue_timeout: config.queue.dequeue_timeout,
        idle_backoff: config.idle_backoff,
    });
    pool.start(&config.tenants).await?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    pool.shutdown().await;

    Ok(())
}

/// Stderr logging, or a daily rolling file under `log_dir` when set.
fn init_tracing(log_dir: Option<&str>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "flow-runner.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}
