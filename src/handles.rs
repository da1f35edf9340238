//! Handle table — process-wide registry of handler-created resources.
//!
//! Handlers never hand out references to what they build; they insert the finished
//! resource here and return its opaque [`HandleId`]. Later tasks look it up by id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Opaque identifier for an entry in a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id received in task config.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw.trim()).ok().map(Self)
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Concurrent map from [`HandleId`] to a shared resource.
///
/// Entries are `Arc`s: a lookup clones the handle out and releases the lock, so a
/// concurrent removal never invalidates a resource another task is still using.
pub struct HandleTable<T> {
    entries: RwLock<HashMap<HandleId, Arc<T>>>,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a fully constructed resource and return its new id.
    pub async fn insert(&self, resource: T) -> HandleId {
        let id = HandleId::new();
        self.entries.write().await.insert(id, Arc::new(resource));
        id
    }

    pub async fn get(&self, id: &HandleId) -> Option<Arc<T>> {
        self.entries.read().await.get(id).cloned()
    }

    /// Swap the resource behind an existing id. Returns `false` if the id is unknown.
    pub async fn replace(&self, id: &HandleId, resource: T) -> bool {
        match self.entries.write().await.get_mut(id) {
            Some(slot) => {
                *slot = Arc::new(resource);
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, id: &HandleId) -> Option<Arc<T>> {
        self.entries.write().await.remove(id)
    }

    pub async fn contains(&self, id: &HandleId) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot of current ids.
    pub async fn ids(&self) -> Vec<HandleId> {
        self.entries.read().await.keys().copied().collect()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_get_remove() {
        let table = HandleTable::new();
        let id = table.insert("store".to_string()).await;

        assert!(table.contains(&id).await);
        assert_eq!(table.get(&id).await.as_deref().map(String::as_str), Some("store"));
        assert_eq!(table.len().await, 1);

        let removed = table.remove(&id).await;
        assert!(removed.is_some());
        assert!(table.get(&id).await.is_none());
        assert!(table.is_empty().await);
    }

    #[tokio::test]
    async fn removal_does_not_invalidate_held_handles() {
        let table = HandleTable::new();
        let id = table.insert(vec![1, 2, 3]).await;
        let held = table.get(&id).await.unwrap();
        table.remove(&id).await;
        assert_eq!(held.len(), 3);
    }

    #[tokio::test]
    async fn replace_keeps_the_id() {
        let table = HandleTable::new();
        let id = table.insert("v1".to_string()).await;
        let old = table.get(&id).await.unwrap();

        assert!(table.replace(&id, "v2".to_string()).await);
        assert_eq!(table.get(&id).await.as_deref().map(String::as_str), Some("v2"));
        assert_eq!(old.as_str(), "v1");
        assert!(!table.replace(&HandleId::new(), "v3".to_string()).await);
    }

    #[tokio::test]
    async fn concurrent_inserts_get_distinct_ids() {
        let table = Arc::new(HandleTable::new());
        let mut joins = Vec::new();
        for i in 0..32 {
            let table = Arc::clone(&table);
            joins.push(tokio::spawn(async move { table.insert(i).await }));
        }
        let mut ids = Vec::new();
        for j in joins {
            ids.push(j.await.unwrap());
        }
        ids.sort_by_key(|id| id.to_string());
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(table.ids().await.len(), 32);
    }

    #[test]
    fn parse_round_trips_display() {
        let id = HandleId::new();
        assert_eq!(HandleId::parse(&id.to_string()), Some(id));
        assert_eq!(HandleId::parse("not-a-uuid"), None);
    }
}
