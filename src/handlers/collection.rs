//! In-memory document collections.
//!
//! Collections live in a process-wide [`HandleTable`]; tasks refer to them by the
//! `collectionId` returned from `collection.create_collection`.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::Document;
use crate::dispatch::TaskHandler;
use crate::dispatch::handler::{optional_str, require_str, usize_or};
use crate::error::HandlerError;
use crate::handles::{HandleId, HandleTable};

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_SEARCH_K: usize = 4;
const DEFAULT_FETCH_K: usize = 20;
const DEFAULT_LAMBDA_MULT: f64 = 0.5;
/// Share of the hybrid score taken by term overlap; the rest rewards an exact phrase match.
const HYBRID_TERM_WEIGHT: f64 = 0.7;

/// A stored document plus its precomputed search terms.
#[derive(Debug, Clone)]
struct Entry {
    id: String,
    content: String,
    metadata: Map<String, Value>,
    terms: HashSet<String>,
}

impl Entry {
    fn from_document(doc: Document) -> Self {
        let terms = terms(&doc.content);
        Self {
            id: doc.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            content: doc.content,
            metadata: doc.metadata,
            terms,
        }
    }

    fn matches(&self, filter: &Map<String, Value>) -> bool {
        filter.iter().all(|(k, v)| self.metadata.get(k) == Some(v))
    }
}

/// Lowercased alphanumeric terms.
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Ranking strategy of `search_documents`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    /// Share of query terms present in the document.
    Similarity,
    /// Similarity re-ranked for diversity among the top `fetchK` hits.
    Mmr,
    /// Similarity blended with an exact phrase match.
    Hybrid,
}

impl SearchType {
    pub fn parse(raw: Option<&str>) -> Result<Self, HandlerError> {
        match raw {
            None | Some("similarity") => Ok(SearchType::Similarity),
            Some("mmr") => Ok(SearchType::Mmr),
            Some("hybrid") => Ok(SearchType::Hybrid),
            Some(other) => Err(HandlerError::InvalidParameters(format!(
                "Unsupported search type: {other}"
            ))),
        }
    }
}

fn lambda_mult(input: &Value) -> Result<f64, HandlerError> {
    match input.get("lambdaMult") {
        None | Some(Value::Null) => Ok(DEFAULT_LAMBDA_MULT),
        Some(v) => v
            .as_f64()
            .filter(|l| (0.0..=1.0).contains(l))
            .ok_or_else(|| {
                HandlerError::InvalidParameters("'lambdaMult' must be between 0 and 1".into())
            }),
    }
}

/// Jaccard similarity of two term sets.
fn overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Greedy maximal marginal relevance over relevance-sorted candidates: each pick maximises
/// `lambda * relevance - (1 - lambda) * max overlap with the picks so far`.
fn max_marginal_relevance<'a>(
    candidates: Vec<(f64, &'a Entry)>,
    k: usize,
    lambda: f64,
) -> Vec<(f64, &'a Entry)> {
    let mut remaining = candidates;
    let mut picked: Vec<(f64, &Entry)> = Vec::with_capacity(k.min(remaining.len()));

    while picked.len() < k && !remaining.is_empty() {
        let mut best = 0;
        let mut best_score = f64::NEG_INFINITY;
        for (i, (relevance, entry)) in remaining.iter().enumerate() {
            let redundancy = picked
                .iter()
                .map(|(_, p)| overlap(&entry.terms, &p.terms))
                .fold(0.0, f64::max);
            let score = lambda * relevance - (1.0 - lambda) * redundancy;
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        picked.push(remaining.remove(best));
    }
    picked
}

/// A named collection of documents.
#[derive(Debug)]
pub struct Collection {
    namespace: String,
    created_at: DateTime<Utc>,
    entries: RwLock<Vec<Entry>>,
}

impl Collection {
    fn new(namespace: String, documents: Vec<Document>) -> Self {
        Self {
            namespace,
            created_at: Utc::now(),
            entries: RwLock::new(documents.into_iter().map(Entry::from_document).collect()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

/// Operations of the `collection` category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOperation {
    Create,
    AddDocuments,
    SearchDocuments,
    DeleteDocuments,
    Drop,
}

impl CollectionOperation {
    pub const ALL: &'static [CollectionOperation] = &[
        CollectionOperation::Create,
        CollectionOperation::AddDocuments,
        CollectionOperation::SearchDocuments,
        CollectionOperation::DeleteDocuments,
        CollectionOperation::Drop,
    ];

    /// Operation name on the wire.
    pub fn name(self) -> &'static str {
        match self {
            CollectionOperation::Create => "create_collection",
            CollectionOperation::AddDocuments => "add_documents",
            CollectionOperation::SearchDocuments => "search_documents",
            CollectionOperation::DeleteDocuments => "delete_documents",
            CollectionOperation::Drop => "drop_collection",
        }
    }
}

/// Handler for one [`CollectionOperation`] over a shared collection table.
pub struct CollectionHandler {
    collections: Arc<HandleTable<Collection>>,
    operation: CollectionOperation,
}

impl CollectionHandler {
    pub fn new(collections: Arc<HandleTable<Collection>>, operation: CollectionOperation) -> Self {
        Self {
            collections,
            operation,
        }
    }

    async fn lookup(
        &self,
        config: &Map<String, Value>,
    ) -> Result<(HandleId, Arc<Collection>), HandlerError> {
        let raw = require_str(config, "collectionId")?;
        let not_found = || HandlerError::NotFound {
            kind: "Collection",
            id: raw.to_string(),
        };
        let id = HandleId::parse(raw).ok_or_else(not_found)?;
        let collection = self.collections.get(&id).await.ok_or_else(not_found)?;
        Ok((id, collection))
    }

    async fn create(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let namespace = optional_str(config, "namespace").unwrap_or(DEFAULT_NAMESPACE);
        let documents = Document::list_from_input(input)?;
        let count = documents.len();

        // Fully built before it becomes visible in the table.
        let collection = Collection::new(namespace.to_string(), documents);
        let created_at = collection.created_at;
        let id = self.collections.insert(collection).await;

        info!(collection_id = %id, namespace, documents = count, "Created collection");
        Ok(json!({
            "id": id,
            "namespace": namespace,
            "documentCount": count,
            "createdAt": created_at,
        }))
    }

    async fn add(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let (_, collection) = self.lookup(config).await?;
        let new: Vec<Entry> = Document::list_from_input(input)?
            .into_iter()
            .map(Entry::from_document)
            .collect();
        let ids: Vec<String> = new.iter().map(|e| e.id.clone()).collect();

        collection.entries.write().await.extend(new);
        Ok(json!({ "count": ids.len(), "ids": ids }))
    }

    async fn search(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let (_, collection) = self.lookup(config).await?;
        let query = input
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::InvalidParameters("missing 'query' input".into()))?;
        let k = match input.as_object() {
            Some(obj) if obj.contains_key("k") => usize_or(obj, "k", DEFAULT_SEARCH_K)?,
            _ => usize_or(config, "k", DEFAULT_SEARCH_K)?,
        };
        let search_type = SearchType::parse(input.get("searchType").and_then(Value::as_str))?;
        let filter = input.get("filter").and_then(Value::as_object);

        let query_terms = terms(query);
        if query_terms.is_empty() || k == 0 {
            return Ok(json!([]));
        }

        let entries = collection.entries.read().await;
        let mut scored: Vec<(f64, &Entry)> = entries
            .iter()
            .filter(|e| filter.is_none_or(|f| e.matches(f)))
            .filter_map(|e| {
                let hits = query_terms.intersection(&e.terms).count();
                (hits > 0).then(|| (hits as f64 / query_terms.len() as f64, e))
            })
            .collect();
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let ranked = match search_type {
            SearchType::Similarity => {
                scored.truncate(k);
                scored
            }
            SearchType::Hybrid => {
                let phrase = query.trim().to_lowercase();
                for (score, entry) in scored.iter_mut() {
                    let exact = f64::from(u8::from(entry.content.to_lowercase().contains(&phrase)));
                    *score = HYBRID_TERM_WEIGHT * *score + (1.0 - HYBRID_TERM_WEIGHT) * exact;
                }
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                scored.truncate(k);
                scored
            }
            SearchType::Mmr => {
                let fetch_k = match input.as_object() {
                    Some(obj) if obj.contains_key("fetchK") => usize_or(obj, "fetchK", DEFAULT_FETCH_K)?,
                    _ => usize_or(config, "fetchK", DEFAULT_FETCH_K)?,
                };
                let lambda = lambda_mult(input)?;
                scored.truncate(fetch_k.max(k));
                max_marginal_relevance(scored, k, lambda)
            }
        };

        let results: Vec<Value> = ranked
            .into_iter()
            .map(|(score, e)| {
                json!({
                    "id": e.id,
                    "content": e.content,
                    "metadata": e.metadata,
                    "score": score,
                })
            })
            .collect();
        Ok(Value::Array(results))
    }

    async fn delete(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let (_, collection) = self.lookup(config).await?;
        let mut entries = collection.entries.write().await;
        let before = entries.len();

        if let Some(ids) = input.get("ids").and_then(Value::as_array) {
            let ids: HashSet<&str> = ids.iter().filter_map(Value::as_str).collect();
            entries.retain(|e| !ids.contains(e.id.as_str()));
        } else if let Some(filter) = input.get("filter").and_then(Value::as_object) {
            entries.retain(|e| !e.matches(filter));
        } else if input.get("all").and_then(Value::as_bool) == Some(true) {
            entries.clear();
        } else {
            return Err(HandlerError::InvalidParameters(
                "one of 'ids', 'filter' or 'all' must be provided".into(),
            ));
        }

        Ok(json!({ "count": before - entries.len() }))
    }

    async fn drop_collection(&self, config: &Map<String, Value>) -> Result<Value, HandlerError> {
        let (id, _) = self.lookup(config).await?;
        self.collections.remove(&id).await;
        info!(collection_id = %id, "Dropped collection");
        Ok(json!({ "id": id, "dropped": true }))
    }
}

#[async_trait]
impl TaskHandler for CollectionHandler {
    async fn handle(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        match self.operation {
            CollectionOperation::Create => self.create(config, input).await,
            CollectionOperation::AddDocuments => self.add(config, input).await,
            CollectionOperation::SearchDocuments => self.search(config, input).await,
            CollectionOperation::DeleteDocuments => self.delete(config, input).await,
            CollectionOperation::Drop => self.drop_collection(config).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        table: Arc<HandleTable<Collection>>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                table: Arc::new(HandleTable::new()),
            }
        }

        async fn run(&self, op: CollectionOperation, config: Value, input: Value) -> Result<Value, HandlerError> {
            CollectionHandler::new(Arc::clone(&self.table), op)
                .handle(config.as_object().unwrap(), &input)
                .await
        }

        async fn search(&self, id: &str, input: Value) -> Result<Value, HandlerError> {
            self.run(CollectionOperation::SearchDocuments, json!({"collectionId": id}), input)
                .await
        }

        async fn create(&self, documents: Value) -> String {
            let out = self
                .run(
                    CollectionOperation::Create,
                    json!({"namespace": "docs"}),
                    json!({"documents": documents}),
                )
                .await
                .unwrap();
            out["id"].as_str().unwrap().to_string()
        }
    }

    #[tokio::test]
    async fn create_reports_count_and_registers_handle() {
        let fx = Fixture::new();
        let out = fx
            .run(
                CollectionOperation::Create,
                json!({}),
                json!({"documents": [{"content": "a"}, {"content": "b"}]}),
            )
            .await
            .unwrap();

        assert_eq!(out["namespace"], json!("default"));
        assert_eq!(out["documentCount"], json!(2));
        let id = HandleId::parse(out["id"].as_str().unwrap()).unwrap();
        let stored = fx.table.get(&id).await.unwrap();
        assert_eq!(stored.len().await, 2);
        assert_eq!(stored.namespace(), "default");
    }

    #[tokio::test]
    async fn failed_create_leaves_table_untouched() {
        let fx = Fixture::new();
        let err = fx
            .run(
                CollectionOperation::Create,
                json!({}),
                json!({"documents": [{"content": "ok"}, {"no_content": true}]}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
        assert!(fx.table.is_empty().await);
    }

    #[tokio::test]
    async fn add_then_search_ranks_by_term_overlap() {
        let fx = Fixture::new();
        let id = fx.create(json!([])).await;

        let added = fx
            .run(
                CollectionOperation::AddDocuments,
                json!({"collectionId": id}),
                json!({"documents": [
                    {"id": "rust", "content": "Rust is a systems language"},
                    {"id": "both", "content": "Rust and Python are languages", "metadata": {"kind": "cmp"}},
                    {"id": "py", "content": "Python is a scripting language"},
                ]}),
            )
            .await
            .unwrap();
        assert_eq!(added["count"], json!(3));
        assert_eq!(added["ids"], json!(["rust", "both", "py"]));

        let hits = fx
            .run(
                CollectionOperation::SearchDocuments,
                json!({"collectionId": id}),
                json!({"query": "rust python", "k": 2}),
            )
            .await
            .unwrap();
        let hits = hits.as_array().unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0]["id"], json!("both"));
        assert_eq!(hits[0]["score"], json!(1.0));
        assert_eq!(hits[1]["id"], json!("rust"));

        let filtered = fx
            .run(
                CollectionOperation::SearchDocuments,
                json!({"collectionId": id}),
                json!({"query": "python", "filter": {"kind": "cmp"}}),
            )
            .await
            .unwrap();
        assert_eq!(filtered.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_by_ids_and_all() {
        let fx = Fixture::new();
        let id = fx
            .create(json!([
                {"id": "a", "content": "alpha"},
                {"id": "b", "content": "beta"},
                {"id": "c", "content": "gamma"},
            ]))
            .await;
        let cfg = json!({"collectionId": id});

        let out = fx
            .run(CollectionOperation::DeleteDocuments, cfg.clone(), json!({"ids": ["a", "zzz"]}))
            .await
            .unwrap();
        assert_eq!(out["count"], json!(1));

        let out = fx
            .run(CollectionOperation::DeleteDocuments, cfg.clone(), json!({"all": true}))
            .await
            .unwrap();
        assert_eq!(out["count"], json!(2));

        assert!(fx
            .run(CollectionOperation::DeleteDocuments, cfg, json!({}))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn drop_removes_handle() {
        let fx = Fixture::new();
        let id = fx.create(json!([{"content": "x"}])).await;
        let cfg = json!({"collectionId": id});

        let out = fx.run(CollectionOperation::Drop, cfg.clone(), Value::Null).await.unwrap();
        assert_eq!(out["dropped"], json!(true));
        assert!(fx.table.is_empty().await);

        let err = fx
            .run(CollectionOperation::SearchDocuments, cfg, json!({"query": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), format!("Collection {id} not found"));
    }

    #[tokio::test]
    async fn unknown_or_garbage_id_is_not_found() {
        let fx = Fixture::new();
        let fresh = HandleId::new().to_string();
        for raw in ["not-a-uuid", fresh.as_str()] {
            let err = fx
                .run(
                    CollectionOperation::AddDocuments,
                    json!({"collectionId": raw}),
                    json!({"documents": []}),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, HandlerError::NotFound { kind: "Collection", .. }));
        }
    }

    #[tokio::test]
    async fn search_type_changes_the_ranking() {
        let fx = Fixture::new();
        let id = fx
            .create(json!([
                {"id": "a", "content": "tokio runtime scheduler"},
                {"id": "a2", "content": "tokio runtime scheduler notes"},
                {"id": "b", "content": "tokio channels"},
                {"id": "c", "content": "the scheduler of a tokio runtime"},
            ]))
            .await;
        let ids = |out: Value| -> Vec<String> {
            out.as_array()
                .unwrap()
                .iter()
                .map(|h| h["id"].as_str().unwrap().to_string())
                .collect()
        };

        let similar = fx.search(&id, json!({"query": "tokio runtime scheduler", "k": 2})).await.unwrap();
        assert_eq!(ids(similar), vec!["a", "a2"]);

        // The near-duplicate of the top hit gives way to a different document.
        let diverse = fx.search(&id, json!({"query": "tokio runtime scheduler", "k": 2, "searchType": "mmr"}))
            .await
            .unwrap();
        assert_eq!(ids(diverse.clone()), vec!["a", "c"]);
        assert_eq!(diverse[0]["score"], json!(1.0));

        // Only "c" lacks the exact phrase among the full-coverage hits.
        let hybrid = fx.search(&id, json!({"query": "tokio runtime scheduler", "searchType": "hybrid"}))
            .await
            .unwrap();
        assert_eq!(ids(hybrid), vec!["a", "a2", "c", "b"]);

        let err = fx.search(&id, json!({"query": "tokio", "searchType": "dense"})).await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid parameters: Unsupported search type: dense");
        let err = fx.search(&id, json!({"query": "tokio", "searchType": "mmr", "lambdaMult": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameters(_)));
    }

    #[test]
    fn mmr_with_full_lambda_keeps_relevance_order() {
        let entries: Vec<Entry> = ["x y", "x y", "z"]
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Entry::from_document(Document {
                    id: Some(i.to_string()),
                    content: c.to_string(),
                    metadata: Map::new(),
                })
            })
            .collect();
        let candidates: Vec<(f64, &Entry)> = vec![(1.0, &entries[0]), (1.0, &entries[1]), (0.5, &entries[2])];

        let ids = |picked: Vec<(f64, &Entry)>| picked.iter().map(|(_, e)| e.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(max_marginal_relevance(candidates.clone(), 2, 1.0)), vec!["0", "1"]);
        assert_eq!(ids(max_marginal_relevance(candidates, 2, 0.5)), vec!["0", "2"]);
    }
}
