//! Handler registry for routing tasks by `(category, operation)`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatch::handler::TaskHandler;
use crate::task::TaskKey;

/// Duplicate registration attempt.
#[derive(Debug, thiserror::Error)]
#[error("Handler for {0} is already registered")]
pub struct AlreadyRegistered(pub TaskKey);

/// Registry of handlers.
///
/// Populated during startup (mutable), then shared behind an `Arc` and only read.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKey, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. A key can only be registered once.
    pub fn register(
        &mut self,
        category: &str,
        operation: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), AlreadyRegistered> {
        let key = TaskKey::new(category, operation);
        if self.handlers.contains_key(&key) {
            return Err(AlreadyRegistered(key));
        }
        tracing::debug!(handler = %key, "Registered handler");
        self.handlers.insert(key, handler);
        Ok(())
    }

    pub fn get(&self, key: &TaskKey) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(key).cloned()
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.handlers.contains_key(key)
    }

    /// Registered keys, sorted for stable logging.
    pub fn keys(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.handlers.keys().cloned().collect();
        keys.sort_by(|a, b| (&a.category, &a.operation).cmp(&(&b.category, &b.operation)));
        keys
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
