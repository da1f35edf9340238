//! Flow runner — tenant-isolated task workers for a workflow orchestrator.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod handlers;
pub mod handles;
pub mod pool;
pub mod queue;
pub mod report;
pub mod task;
