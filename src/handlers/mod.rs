//! Built-in task handlers.
//!
//! | Key | Handler |
//! |---|---|
//! | `document.load_document` | [`LoadDocumentHandler`] |
//! | `document.split_document` | [`SplitDocumentHandler`] |
//! | `document.transform_document` | [`TransformDocumentHandler`] |
//! | `script.run` | [`RunScriptHandler`] |
//! | `collection.*` | [`CollectionHandler`] |
//! | `graph.*` | [`GraphHandler`] |

pub mod collection;
pub mod document;
pub mod graph;
pub mod loader;
pub mod script;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::dispatch::handler::optional_str;
use crate::dispatch::{AlreadyRegistered, HandlerRegistry};
use crate::error::HandlerError;
use crate::execution::ExecutionCapability;
use crate::handles::{HandleId, HandleTable};

pub use self::collection::{Collection, CollectionHandler, CollectionOperation, SearchType};
pub use self::document::{SplitDocumentHandler, TextSplitter, TransformDocumentHandler};
pub use self::graph::{Graph, GraphHandler, GraphOperation};
pub use self::loader::LoadDocumentHandler;
pub use self::script::RunScriptHandler;

/// A text document as exchanged with the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Document {
    /// Read a document from a task input: either `{"document": {...}}` or the object itself.
    pub fn from_input(input: &Value) -> Result<Self, HandlerError> {
        let raw = match input.get("document") {
            Some(doc) if doc.is_object() => doc,
            _ => input,
        };
        Self::from_value(raw)
    }

    pub fn from_value(raw: &Value) -> Result<Self, HandlerError> {
        serde_json::from_value(raw.clone())
            .map_err(|e| HandlerError::InvalidParameters(format!("invalid document: {e}")))
    }

    /// Read `input.documents` as a list. Absent means empty.
    pub fn list_from_input(input: &Value) -> Result<Vec<Self>, HandlerError> {
        match input.get("documents") {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items.iter().map(Self::from_value).collect(),
            Some(_) => Err(HandlerError::InvalidParameters(
                "'documents' must be a list".into(),
            )),
        }
    }
}

/// The task's document: inline in the input, or a loaded one named by config `documentId`.
pub async fn resolve_document(
    documents: &HandleTable<Document>,
    config: &Map<String, Value>,
    input: &Value,
) -> Result<Document, HandlerError> {
    let inline = input.get("document").is_some() || input.get("content").is_some();
    let Some(raw) = optional_str(config, "documentId").filter(|_| !inline) else {
        return Document::from_input(input);
    };

    let not_found = || HandlerError::NotFound {
        kind: "Document",
        id: raw.to_string(),
    };
    let id = HandleId::parse(raw).ok_or_else(not_found)?;
    let stored = documents.get(&id).await.ok_or_else(not_found)?;
    Ok(Document {
        id: Some(raw.to_string()),
        ..(*stored).clone()
    })
}

/// Process-wide tables the built-in handlers keep their resources in.
#[derive(Clone, Default)]
pub struct HandleTables {
    pub documents: Arc<HandleTable<Document>>,
    pub collections: Arc<HandleTable<Collection>>,
    pub graphs: Arc<HandleTable<Graph>>,
}

/// Register every built-in handler.
pub fn register_builtin(
    registry: &mut HandlerRegistry,
    execution: Arc<dyn ExecutionCapability>,
    tables: &HandleTables,
) -> Result<(), AlreadyRegistered> {
    registry.register(
        "document",
        "load_document",
        Arc::new(LoadDocumentHandler::new(Arc::clone(&tables.documents))),
    )?;
    registry.register(
        "document",
        "split_document",
        Arc::new(SplitDocumentHandler::new(Arc::clone(&tables.documents))),
    )?;
    registry.register(
        "document",
        "transform_document",
        Arc::new(TransformDocumentHandler::new(
            Arc::clone(&execution),
            Arc::clone(&tables.documents),
        )),
    )?;
    registry.register(
        "script",
        "run",
        Arc::new(RunScriptHandler::new(Arc::clone(&execution))),
    )?;

    for operation in CollectionOperation::ALL {
        registry.register(
            "collection",
            operation.name(),
            Arc::new(CollectionHandler::new(Arc::clone(&tables.collections), *operation)),
        )?;
    }

    for operation in GraphOperation::ALL {
        registry.register(
            "graph",
            operation.name(),
            Arc::new(GraphHandler::new(
                Arc::clone(&execution),
                Arc::clone(&tables.graphs),
                *operation,
            )),
        )?;
    }

    Ok(())
}
