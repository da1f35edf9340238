//! Worker pool — one independent polling loop per tenant.
//!
//! Each loop runs `dequeue → dispatch → publish → report` one task at a time, so a
//! tenant's tasks are executed and reported in queue order. Loops share only the
//! read-only handler registry and the handle tables inside the handlers; a tenant
//! with an empty queue never delays another tenant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::dispatch::Dispatcher;
use crate::error::StartupError;
use crate::queue::{QueueClient, ResultChannel};
use crate::report::{Reporter, report_outcome};
use crate::task::{TaskDescriptor, TaskResult};

/// Everything a tenant loop needs.
pub struct PoolDeps {
    pub queue: QueueClient,
    pub dispatcher: Dispatcher,
    pub reporter: Arc<dyn Reporter>,
    /// Reply lists for tasks that carry an `id`. `None` disables publishing.
    pub results: Option<ResultChannel>,
    pub dequeue_timeout: Duration,
    /// Pause after an empty dequeue or a queue error.
    pub idle_backoff: Duration,
}

/// A running tenant loop.
struct TenantWorker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the per-tenant loops.
pub struct WorkerPool {
    deps: Arc<PoolDeps>,
    workers: RwLock<HashMap<String, TenantWorker>>,
}

impl WorkerPool {
    pub fn new(deps: PoolDeps) -> Self {
        Self {
            deps: Arc::new(deps),
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Start a loop for every tenant. Fails if no loop could be started.
    pub async fn start<I, S>(&self, tenants: I) -> Result<(), StartupError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut started = 0;
        for tenant in tenants {
            if self.spawn_tenant(tenant.as_ref()).await {
                started += 1;
            }
        }
        if self.workers.read().await.is_empty() {
            return Err(StartupError::NoTenants);
        }
        info!(tenants = started, "Worker pool started");
        Ok(())
    }

    /// Start a loop for `tenant`. Returns `false` if one is already running or the
    /// name is blank.
    pub async fn spawn_tenant(&self, tenant: &str) -> bool {
        let tenant = tenant.trim();
        if tenant.is_empty() {
            return false;
        }

        let mut workers = self.workers.write().await;
        if workers.contains_key(tenant) {
            debug!(tenant, "Tenant loop already running");
            return false;
        }

        let (stop, stop_rx) = watch::channel(false);
        let handle = spawn_tenant_loop(Arc::clone(&self.deps), tenant.to_string(), stop_rx);
        workers.insert(tenant.to_string(), TenantWorker { stop, handle });
        true
    }

    /// Stop the loop for `tenant` and wait for it to exit.
    ///
    /// The loop sees the request between tasks. An in-flight dequeue is never cancelled,
    /// because a popped entry would be lost with it, so an idle loop exits within one
    /// dequeue timeout and a busy one finishes and reports its task first. Returns `false`
    /// if the tenant was not running.
    pub async fn stop_tenant(&self, tenant: &str) -> bool {
        let Some(worker) = self.workers.write().await.remove(tenant) else {
            return false;
        };
        let _ = worker.stop.send(true);
        if let Err(e) = worker.handle.await {
            if e.is_panic() {
                error!(tenant, "Tenant loop panicked");
            }
        }
        info!(tenant, "Tenant removed from pool");
        true
    }

    /// Tenants with a running loop, sorted.
    pub async fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.workers.read().await.keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Whether the loop for `tenant` is still alive.
    pub async fn is_running(&self, tenant: &str) -> bool {
        self.workers
            .read()
            .await
            .get(tenant)
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Abort every loop. In-flight tasks are abandoned, not drained.
    pub async fn shutdown(&self) {
        let workers: Vec<(String, TenantWorker)> = self.workers.write().await.drain().collect();
        let count = workers.len();

        let handles = workers.into_iter().map(|(_, worker)| {
            let _ = worker.stop.send(true);
            worker.handle.abort();
            worker.handle
        });
        join_all(handles).await;

        info!(tenants = count, "Worker pool shut down");
    }
}

/// Spawn the polling loop for one tenant inside a `tenant` span.
fn spawn_tenant_loop(
    deps: Arc<PoolDeps>,
    tenant: String,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let span = info_span!("tenant", tenant = %tenant);
    tokio::spawn(tenant_loop(deps, tenant, stop).instrument(span))
}

async fn tenant_loop(deps: Arc<PoolDeps>, tenant: String, mut stop: watch::Receiver<bool>) {
    info!("Tenant loop started");

    loop {
        if *stop.borrow() {
            break;
        }

        // Bounded by the dequeue timeout; runs to completion so a popped task is kept.
        match deps.queue.dequeue(&tenant, deps.dequeue_timeout).await {
            Ok(Some(task)) => process_task(&deps, task).await,
            Ok(None) => {
                if idle(&deps, &mut stop).await {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Dequeue failed");
                if idle(&deps, &mut stop).await {
                    break;
                }
            }
        }
    }

    info!("Tenant loop stopped");
}

/// Sleep for the idle backoff. Returns `true` if the loop was told to stop meanwhile.
async fn idle(deps: &PoolDeps, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = stop.changed() => true,
        _ = tokio::time::sleep(deps.idle_backoff) => false,
    }
}

/// Execute one task and deliver its outcome. Never fails; problems are logged.
async fn process_task(deps: &PoolDeps, task: TaskDescriptor) {
    let span = info_span!(
        "task",
        flow_id = %task.flow_id,
        node_id = %task.node_id,
        category = %task.category,
        operation = %task.operation,
    );

    async {
        let started = Instant::now();
        let outcome = deps.dispatcher.dispatch(&task).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            TaskResult::Success { .. } => info!(elapsed_ms, "Task succeeded"),
            TaskResult::Failure { error_message } => {
                warn!(elapsed_ms, error = %error_message, "Task failed")
            }
        }

        if let (Some(id), Some(results)) = (task.id.as_deref(), deps.results.as_ref()) {
            if let Err(e) = results.publish(id, &outcome).await {
                warn!(task_id = %id, error = %e, "Failed to publish result");
            }
        }

        if let Err(e) = report_outcome(deps.reporter.as_ref(), &task, &outcome).await {
            error!(error = %e, "Result delivery failed");
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{HandlerRegistry, TaskHandler};
    use crate::error::{DeliveryError, HandlerError, QueueError};
    use crate::queue::InMemoryQueue;
    use async_trait::async_trait;
    use serde_json::{Map, Value, json};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        outcomes: Mutex<Vec<(String, String, Result<Value, String>)>>,
    }

    #[async_trait]
    impl Reporter for Recorder {
        async fn report_success(
            &self,
            tenant: &str,
            _flow_id: &str,
            node_id: &str,
            result: &Value,
        ) -> Result<(), DeliveryError> {
            self.outcomes
                .lock()
                .unwrap()
                .push((tenant.into(), node_id.into(), Ok(result.clone())));
            Ok(())
        }

        async fn report_failure(
            &self,
            tenant: &str,
            _flow_id: &str,
            node_id: &str,
            error_message: &str,
        ) -> Result<(), DeliveryError> {
            self.outcomes
                .lock()
                .unwrap()
                .push((tenant.into(), node_id.into(), Err(error_message.into())));
            Ok(())
        }
    }

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        async fn handle(&self, _: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
            Ok(input.clone())
        }
    }

    fn pool(backend: Arc<InMemoryQueue>, reporter: Arc<Recorder>) -> WorkerPool {
        let mut registry = HandlerRegistry::new();
        registry.register("test", "echo", Arc::new(Echo)).unwrap();
        WorkerPool::new(PoolDeps {
            queue: QueueClient::new(backend.clone(), "taskQueue_"),
            dispatcher: Dispatcher::new(Arc::new(registry)),
            reporter,
            results: Some(ResultChannel::new(backend, "taskResult_", Duration::from_secs(60))),
            dequeue_timeout: Duration::from_millis(50),
            idle_backoff: Duration::from_millis(10),
        })
    }

    fn task(tenant: &str, node: &str, id: Option<&str>) -> TaskDescriptor {
        TaskDescriptor {
            id: id.map(str::to_string),
            tenant_id: tenant.into(),
            flow_id: "flow".into(),
            node_id: node.into(),
            category: "test".into(),
            operation: "echo".into(),
            config: Map::new(),
            input: json!({"node": node}),
        }
    }

    async fn wait_for(recorder: &Recorder, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while recorder.outcomes.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for outcomes");
    }

    #[tokio::test]
    async fn start_rejects_empty_tenant_set() {
        let p = pool(Arc::new(InMemoryQueue::new()), Arc::new(Recorder::default()));
        let err = p.start(Vec::<String>::new()).await.unwrap_err();
        assert!(matches!(err, StartupError::NoTenants));
        assert!(matches!(p.start(["  "]).await, Err(StartupError::NoTenants)));
    }

    #[tokio::test]
    async fn processes_and_reports_queued_task() {
        let backend = Arc::new(InMemoryQueue::new());
        let recorder = Arc::new(Recorder::default());
        let p = pool(backend.clone(), recorder.clone());
        p.start(["acme"]).await.unwrap();

        let client = QueueClient::new(backend.clone(), "taskQueue_");
        client.enqueue(&task("acme", "n1", Some("t-1"))).await.unwrap();
        wait_for(&recorder, 1).await;

        let outcomes = recorder.outcomes.lock().unwrap().clone();
        assert_eq!(outcomes[0], ("acme".into(), "n1".into(), Ok(json!({"node": "n1"}))));

        let reply = ResultChannel::new(backend, "taskResult_", Duration::from_secs(60))
            .take("t-1", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, Some(TaskResult::success(json!({"node": "n1"}))));

        p.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_is_idempotent_and_stop_removes() {
        let p = pool(Arc::new(InMemoryQueue::new()), Arc::new(Recorder::default()));
        assert!(p.spawn_tenant("acme").await);
        assert!(!p.spawn_tenant("acme").await);
        assert!(p.spawn_tenant("globex").await);
        assert_eq!(p.tenants().await, vec!["acme", "globex"]);
        assert!(p.is_running("acme").await);

        // Stopping an idle loop returns promptly.
        let stopped = tokio::time::timeout(Duration::from_secs(1), p.stop_tenant("acme")).await;
        assert_eq!(stopped.ok(), Some(true));
        assert!(!p.stop_tenant("acme").await);
        assert_eq!(p.tenants().await, vec!["globex"]);

        p.shutdown().await;
        assert!(p.tenants().await.is_empty());
    }

    #[tokio::test]
    async fn stopped_tenant_leaves_queue_untouched() {
        let backend = Arc::new(InMemoryQueue::new());
        let recorder = Arc::new(Recorder::default());
        let p = pool(backend.clone(), recorder.clone());
        p.start(["acme"]).await.unwrap();
        p.stop_tenant("acme").await;

        QueueClient::new(backend.clone(), "taskQueue_")
            .enqueue(&task("acme", "late", None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(recorder.outcomes.lock().unwrap().is_empty());
        assert_eq!(backend.len("taskQueue_acme").await, 1);
    }

    /// Takes the entry at once and hands it back after a delay, like a reply in transit.
    struct InTransit {
        inner: InMemoryQueue,
        delay: Duration,
    }

    #[async_trait]
    impl crate::queue::QueueBackend for InTransit {
        async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
            let entry = self.inner.pop(key, timeout).await?;
            if entry.is_some() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(entry)
        }

        async fn push(&self, key: &str, payload: &str) -> Result<(), QueueError> {
            self.inner.push(key, payload).await
        }

        async fn push_expiring(
            &self,
            key: &str,
            payload: &str,
            ttl: Duration,
        ) -> Result<(), QueueError> {
            self.inner.push_expiring(key, payload, ttl).await
        }

        async fn ping(&self) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_during_dequeue_keeps_the_popped_task() {
        let backend = Arc::new(InTransit {
            inner: InMemoryQueue::new(),
            delay: Duration::from_millis(100),
        });
        let recorder = Arc::new(Recorder::default());
        let mut registry = HandlerRegistry::new();
        registry.register("test", "echo", Arc::new(Echo)).unwrap();
        let p = WorkerPool::new(PoolDeps {
            queue: QueueClient::new(backend.clone(), "taskQueue_"),
            dispatcher: Dispatcher::new(Arc::new(registry)),
            reporter: recorder.clone(),
            results: None,
            dequeue_timeout: Duration::from_millis(50),
            idle_backoff: Duration::from_millis(10),
        });

        QueueClient::new(backend.clone(), "taskQueue_")
            .enqueue(&task("acme", "n1", None))
            .await
            .unwrap();
        p.start(["acme"]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(p.stop_tenant("acme").await);

        let outcomes = recorder.outcomes.lock().unwrap().clone();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0], ("acme".into(), "n1".into(), Ok(json!({"node": "n1"}))));
        assert_eq!(backend.inner.len("taskQueue_acme").await, 0);
    }
}
