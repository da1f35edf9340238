//! Process-local queue backend for tests and single-process runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use super::QueueBackend;
use crate::error::QueueError;

/// How often appends sweep expired keys out of the map.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A single named list.
#[derive(Default)]
struct Slot {
    entries: VecDeque<String>,
    expires_at: Option<Instant>,
    /// One waiter per key in steady state; `notify_one` keeps a permit when nobody waits.
    notify: Arc<Notify>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Nothing to pop and nobody holding the notifier. The slot map is locked by the
    /// caller, so no waiter can pick up the notifier concurrently.
    fn is_idle(&self, now: Instant) -> bool {
        (self.entries.is_empty() || self.is_expired(now)) && Arc::strong_count(&self.notify) == 1
    }
}

struct Lists {
    slots: HashMap<String, Slot>,
    next_sweep: Instant,
}

impl Lists {
    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_idle(now));
        before - self.slots.len()
    }
}

/// In-memory FIFO lists keyed by name, with blocking pop and expiry.
///
/// Expired keys are swept on append at most once per sweep interval, and a key is
/// dropped as soon as its last waiter leaves it empty.
pub struct InMemoryQueue {
    lists: Mutex<Lists>,
    sweep_interval: Duration,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        Self {
            lists: Mutex::new(Lists {
                slots: HashMap::new(),
                next_sweep: Instant::now() + sweep_interval,
            }),
            sweep_interval,
        }
    }

    /// Number of live entries under `key`.
    pub async fn len(&self, key: &str) -> usize {
        let lists = self.lists.lock().await;
        match lists.slots.get(key) {
            Some(slot) if !slot.is_expired(Instant::now()) => slot.entries.len(),
            _ => 0,
        }
    }

    /// Number of keys currently held, live or not yet swept.
    pub async fn key_count(&self) -> usize {
        self.lists.lock().await.slots.len()
    }

    /// Drop every expired or empty key nobody waits on. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut lists = self.lists.lock().await;
        lists.next_sweep = now + self.sweep_interval;
        lists.sweep(now)
    }

    /// Pop the head of `key`. When there is nothing to pop and `wait` is set, returns the
    /// key's notifier so the caller can wait for the next append.
    async fn try_pop(&self, key: &str, wait: bool) -> (Option<String>, Option<Arc<Notify>>) {
        let now = Instant::now();
        let mut lists = self.lists.lock().await;

        if let Some(slot) = lists.slots.get_mut(key) {
            if slot.is_expired(now) {
                slot.entries.clear();
                slot.expires_at = None;
            }
            if let Some(entry) = slot.entries.pop_front() {
                if slot.is_idle(now) {
                    lists.slots.remove(key);
                }
                return (Some(entry), None);
            }
        }

        if !wait {
            if lists.slots.get(key).is_some_and(|slot| slot.is_idle(now)) {
                lists.slots.remove(key);
            }
            return (None, None);
        }
        let slot = lists.slots.entry(key.to_string()).or_default();
        (None, Some(Arc::clone(&slot.notify)))
    }

    /// Give up waiting on `key`, dropping its slot if nothing else uses it.
    async fn release(&self, key: &str, notify: Arc<Notify>) {
        let mut lists = self.lists.lock().await;
        drop(notify);
        if lists
            .slots
            .get(key)
            .is_some_and(|slot| slot.is_idle(Instant::now()))
        {
            lists.slots.remove(key);
        }
    }

    async fn append(&self, key: &str, payload: &str, ttl: Option<Duration>) {
        let now = Instant::now();
        let notify = {
            let mut lists = self.lists.lock().await;
            if now >= lists.next_sweep {
                lists.sweep(now);
                lists.next_sweep = now + self.sweep_interval;
            }

            let slot = lists.slots.entry(key.to_string()).or_default();
            if slot.is_expired(now) {
                slot.entries.clear();
            }
            slot.entries.push_back(payload.to_string());
            slot.expires_at = ttl.map(|ttl| now + ttl);
            Arc::clone(&slot.notify)
        };
        notify.notify_one();
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
    async fn pop(&self, key: &str, timeout: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = Instant::now() < deadline;
            let notify = match self.try_pop(key, wait).await {
                (Some(entry), _) => return Ok(Some(entry)),
                (None, None) => return Ok(None),
                (None, Some(notify)) => notify,
            };

            // A push between try_pop and here leaves a permit, so this returns at once.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let woken = tokio::time::timeout(remaining, notify.notified()).await.is_ok();
            if !woken {
                self.release(key, notify).await;
                return Ok(None);
            }
        }
    }

    async fn push(&self, key: &str, payload: &str) -> Result<(), QueueError> {
        self.append(key, payload, None).await;
        Ok(())
    }

    async fn push_expiring(
        &self,
        key: &str,
        payload: &str,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        self.append(key, payload, Some(ttl)).await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_returns_entries_in_order() {
        let q = InMemoryQueue::new();
        q.push("k", "a").await.unwrap();
        q.push("k", "b").await.unwrap();

        assert_eq!(q.pop("k", Duration::ZERO).await.unwrap().as_deref(), Some("a"));
        assert_eq!(q.pop("k", Duration::ZERO).await.unwrap().as_deref(), Some("b"));
        assert_eq!(q.pop("k", Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocked_pop_wakes_on_push() {
        let q = Arc::new(InMemoryQueue::new());
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop("k", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = Instant::now();
        q.push("k", "late").await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("late"));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let q = InMemoryQueue::new();
        q.push("a", "1").await.unwrap();
        assert_eq!(q.pop("b", Duration::from_millis(10)).await.unwrap(), None);
        assert_eq!(q.len("a").await, 1);
    }

    #[tokio::test]
    async fn expiring_keys_vanish() {
        let q = InMemoryQueue::new();
        q.push_expiring("r", "x", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(q.len("r").await, 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(q.len("r").await, 0);
        assert_eq!(q.pop("r", Duration::ZERO).await.unwrap(), None);
        assert_eq!(q.purge_expired().await, 0);
    }

    #[tokio::test]
    async fn purge_drops_expired_keys() {
        let q = InMemoryQueue::new();
        q.push_expiring("r", "x", Duration::from_millis(5)).await.unwrap();
        q.push("keep", "y").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.purge_expired().await, 1);
        assert_eq!(q.len("keep").await, 1);
    }

    #[tokio::test]
    async fn expired_and_drained_keys_are_not_retained() {
        let q = InMemoryQueue::with_sweep_interval(Duration::ZERO);
        for i in 0..1000 {
            q.push_expiring(&format!("taskResult_{i}"), "{}", Duration::from_millis(1))
                .await
                .unwrap();
        }
        for i in 0..500 {
            let missing = format!("taskResult_missing_{i}");
            assert_eq!(q.pop(&missing, Duration::ZERO).await.unwrap(), None);
        }
        assert!(q.key_count().await <= 1000);

        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push("taskQueue_acme", "live").await.unwrap();
        assert_eq!(q.key_count().await, 1);
    }

    #[tokio::test]
    async fn timed_out_waiters_leave_no_slot() {
        let q = InMemoryQueue::new();
        assert_eq!(q.pop("taskResult_t1", Duration::from_millis(10)).await.unwrap(), None);
        assert_eq!(q.key_count().await, 0);

        q.push("k", "a").await.unwrap();
        assert_eq!(q.pop("k", Duration::ZERO).await.unwrap().as_deref(), Some("a"));
        assert_eq!(q.key_count().await, 0);
    }

    #[tokio::test]
    async fn waiting_key_survives_sweep() {
        let q = Arc::new(InMemoryQueue::with_sweep_interval(Duration::ZERO));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.pop("k", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.purge_expired().await, 0);

        q.push("k", "v").await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().as_deref(), Some("v"));
    }
}
