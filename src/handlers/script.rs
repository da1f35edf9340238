//! `script.run`: evaluate caller-supplied code against the task input.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::dispatch::TaskHandler;
use crate::dispatch::handler::{optional_str, require_str};
use crate::error::HandlerError;
use crate::execution::{ExecutionCapability, call_blocking, prepare_blocking};

pub struct RunScriptHandler {
    execution: Arc<dyn ExecutionCapability>,
}

impl RunScriptHandler {
    pub fn new(execution: Arc<dyn ExecutionCapability>) -> Self {
        Self { execution }
    }
}

#[async_trait]
impl TaskHandler for RunScriptHandler {
    async fn handle(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let code = require_str(config, "code")?;
        let entry_point = optional_str(config, "entryPoint").map(str::to_string);

        let callable =
            prepare_blocking(Arc::clone(&self.execution), code.to_string(), entry_point).await?;
        debug!(entry_point = callable.entry_point(), "Running script");

        Ok(call_blocking(callable, input.clone()).await?)
    }
}
