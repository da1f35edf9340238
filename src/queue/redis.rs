//! Redis-backed queue: `BLPOP` consumption of lists filled with `RPUSH`.

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, Cmd, Pipeline};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::QueueBackend;
use crate::error::QueueError;

/// Shortest `BLPOP` wait; the server reads 0 as "wait forever".
const MIN_BLOCK_SECS: f64 = 0.01;

/// Redis list backend.
///
/// A blocking `BLPOP` occupies its connection until it returns, so each long-lived
/// consumer key (a tenant queue) keeps a dedicated connection. One-shot pops open a
/// connection for that pop alone. Pushes share a separate command connection.
pub struct RedisQueue {
    client: Client,
    commands: MultiplexedConnection,
    consumers: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisQueue {
    /// Connect to `url` (e.g. `redis://localhost:6379/`).
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        let client = Client::open(url).map_err(|e| QueueError::Connection(e.to_string()))?;
        let commands = client.get_multiplexed_async_connection().await?;
        debug!(url = %url, "Connected to Redis");
        Ok(Self {
            client,
            commands,
            consumers: Mutex::new(HashMap::new()),
        })
    }

    /// Number of dedicated consumer connections currently held.
    pub async fn consumer_count(&self) -> usize {
        self.consumers.lock().await.len()
    }

    async fn consumer_for(&self, key: &str) -> Result<MultiplexedConnection, QueueError> {
        let mut consumers = self.consumers.lock().await;
        if let Some(conn) = consumers.get(key) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        consumers.insert(key.to_string(), conn.clone());
        Ok(conn)
    }

    async fn forget_consumer(&self, key: &str) {
        self.consumers.lock().await.remove(key);
    }
}

/// `BLPOP` timeout in seconds, never below [`MIN_BLOCK_SECS`].
fn block_secs(timeout: Duration) -> f64 {
    timeout.as_secs_f64().max(MIN_BLOCK_SECS)
}

/// Key expiry in whole seconds, rounded up and at least one.
fn expiry_secs(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

fn blpop(key: &str, timeout: Duration) -> Cmd {
    let mut cmd = ::redis::cmd("BLPOP");
    cmd.arg(key).arg(block_secs(timeout));
    cmd
}

/// `RPUSH` and `EXPIRE` in one `MULTI`/`EXEC`, so a result list never lives without a TTL.
fn push_expiring_pipe(key: &str, payload: &str, ttl: Duration) -> Pipeline {
    let mut pipe = ::redis::pipe();
    pipe.atomic()
        .rpush(key, payload)
        .ignore()
        .expire(key, expiry_secs(ttl))
        .ignore();
    pipe
}

fn command_error(command: &'static str, key: &str, e: ::redis::RedisError) -> QueueError {
    QueueError::Command {
        command,
        key: key.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl QueueBackend for RedisQueue {
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.consumer_for(key).await?;
        let popped: Result<Option<(String, String)>, _> =
            blpop(key, timeout).query_async(&mut conn).await;

        match popped {
            Ok(entry) => Ok(entry.map(|(_, payload)| payload)),
            Err(e) => {
                // Reconnect on the next pop instead of reusing a broken connection.
                self.forget_consumer(key).await;
                Err(command_error("BLPOP", key, e))
            }
        }
    }

    async fn pop_once(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        // Dropped when this returns.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Result<Option<(String, String)>, _> =
            blpop(key, timeout).query_async(&mut conn).await;
        popped
            .map(|entry| entry.map(|(_, payload)| payload))
            .map_err(|e| command_error("BLPOP", key, e))
    }

    async fn push(&self, key: &str, payload: &str) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let pushed: Result<(), _> = conn.rpush(key, payload).await;
        pushed.map_err(|e| command_error("RPUSH", key, e))
    }

    async fn push_expiring(
        &self,
        key: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let pushed: Result<(), _> = push_expiring_pipe(key, payload, ttl)
            .query_async(&mut conn)
            .await;
        pushed.map_err(|e| command_error("RPUSH+EXPIRE", key, e))
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.commands.clone();
        let pong: Result<String, _> = ::redis::cmd("PING").query_async(&mut conn).await;
        pong.map(|_| ()).map_err(|e| command_error("PING", "-", e))
    }
}
