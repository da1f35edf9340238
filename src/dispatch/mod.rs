//! Task dispatch — routes a descriptor to its handler inside a failure boundary.

pub mod handler;
pub mod registry;

use std::any::Any;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::task::{TaskDescriptor, TaskResult};

pub use self::handler::TaskHandler;
pub use self::registry::{AlreadyRegistered, HandlerRegistry};

/// Resolves and invokes handlers. Never fails: every outcome becomes a [`TaskResult`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Execute one task.
    ///
    /// Unknown keys yield `Unknown task: <category>.<operation>`. Handler errors and
    /// panics yield a failure carrying their message.
    pub async fn dispatch(&self, task: &TaskDescriptor) -> TaskResult {
        let key = task.key();
        let Some(handler) = self.registry.get(&key) else {
            warn!(
                tenant = %task.tenant_id,
                flow_id = %task.flow_id,
                node_id = %task.node_id,
                "Unknown task: {}", key
            );
            return TaskResult::failure(format!("Unknown task: {key}"));
        };

        debug!(task = %key, node_id = %task.node_id, "Dispatching task");

        // Run on its own tokio task so a panicking handler surfaces as a JoinError
        // instead of unwinding through the tenant loop.
        let config = task.config.clone();
        let input = task.input.clone();
        let joined = tokio::spawn(async move { handler.handle(&config, &input).await }).await;

        match joined {
            Ok(Ok(value)) => TaskResult::success(value),
            Ok(Err(e)) => TaskResult::failure(e.to_string()),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                warn!(task = %key, node_id = %task.node_id, "Handler panicked: {}", message);
                TaskResult::failure(format!("Handler panicked: {message}"))
            }
            Err(e) => TaskResult::failure(format!("Handler was cancelled: {e}")),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
