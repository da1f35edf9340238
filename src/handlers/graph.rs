//! Graph workflows over script nodes.
//!
//! A graph is a set of `custom` nodes, each prepared through the execution capability,
//! joined by edges that may carry a script condition over the running state. Running a
//! graph threads one JSON state object through the nodes: every node returns an object
//! that is merged into the state, then the first edge out of it that fires picks the next
//! node. A node with no firing edge ends the run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::dispatch::TaskHandler;
use crate::dispatch::handler::{optional_str, require_str, usize_or};
use crate::error::HandlerError;
use crate::execution::{Callable, ExecutionCapability, call_blocking, prepare_blocking};
use crate::handles::{HandleId, HandleTable};

/// Entry point a custom node's code is expected to define.
const NODE_ENTRY_POINT: &str = "custom_node";
const DEFAULT_MAX_ITERATIONS: usize = 25;
const END_NODES: &[&str] = &["END", "__end__"];

/// Outgoing edge of a node.
#[derive(Clone)]
struct Edge {
    source: String,
    /// `None` ends the run.
    target: Option<String>,
    condition: Option<Arc<dyn Callable>>,
}

/// A compiled graph.
#[derive(Clone)]
pub struct Graph {
    name: Option<String>,
    description: Option<String>,
    entry: String,
    nodes: HashMap<String, Arc<dyn Callable>>,
    edges: Vec<Edge>,
    /// Node and edge definitions as submitted.
    definition: (Value, Value),
}

impl Graph {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn describe(&self, id: &HandleId) -> Value {
        json!({
            "graphId": id,
            "name": self.name,
            "description": self.description,
            "nodes": self.definition.0,
            "edges": self.definition.1,
        })
    }

    /// Next node after `node`, given the state it left behind.
    async fn next(&self, node: &str, state: &Value) -> Result<Option<String>, HandlerError> {
        for edge in self.edges.iter().filter(|e| e.source == node) {
            let fires = match &edge.condition {
                None => true,
                Some(condition) => match call_blocking(Arc::clone(condition), state.clone()).await? {
                    Value::Bool(b) => b,
                    other => {
                        return Err(HandlerError::Failed(format!(
                            "Condition on edge {node} -> {} returned {other}, expected a boolean",
                            edge.target.as_deref().unwrap_or("END")
                        )));
                    }
                },
            };
            if fires {
                return Ok(edge.target.clone());
            }
        }
        Ok(None)
    }
}

/// Builds [`Graph`]s from task input.
struct GraphBuilder<'a> {
    execution: &'a Arc<dyn ExecutionCapability>,
}

impl GraphBuilder<'_> {
    async fn build(
        &self,
        name: Option<String>,
        description: Option<String>,
        entry_point: Option<&str>,
        nodes: &Value,
        edges: &Value,
    ) -> Result<Graph, HandlerError> {
        let node_defs = list(nodes, "nodes")?;
        let edge_defs = list(edges, "edges")?;
        if node_defs.is_empty() {
            return Err(HandlerError::InvalidParameters("graph has no nodes".into()));
        }

        let mut order = Vec::with_capacity(node_defs.len());
        let mut compiled = HashMap::with_capacity(node_defs.len());
        for def in node_defs {
            let (id, callable) = self.node(def).await?;
            if compiled.insert(id.clone(), callable).is_some() {
                return Err(HandlerError::InvalidParameters(format!("duplicate node id '{id}'")));
            }
            order.push(id);
        }

        let known: HashSet<&str> = order.iter().map(String::as_str).collect();
        let mut compiled_edges = Vec::with_capacity(edge_defs.len());
        for def in edge_defs {
            compiled_edges.push(self.edge(def, &known).await?);
        }

        let entry = match entry_point {
            Some(entry) if known.contains(entry) => entry.to_string(),
            Some(entry) => {
                return Err(HandlerError::InvalidParameters(format!(
                    "entry point '{entry}' is not a node"
                )));
            }
            None => order[0].clone(),
        };

        Ok(Graph {
            name,
            description,
            entry,
            nodes: compiled,
            edges: compiled_edges,
            definition: (nodes.clone(), edges.clone()),
        })
    }

    async fn node(&self, def: &Value) -> Result<(String, Arc<dyn Callable>), HandlerError> {
        let fields = object(def, "node")?;
        let id = require_str(fields, "id")?.to_string();
        let node_type = optional_str(fields, "type").unwrap_or("custom");
        if node_type != "custom" {
            return Err(HandlerError::InvalidParameters(format!(
                "Unsupported node type '{node_type}' for node {id}"
            )));
        }

        let empty = Map::new();
        let config = fields.get("config").and_then(Value::as_object).unwrap_or(&empty);
        let code = require_str(config, "code")?;
        let callable = prepare_blocking(
            Arc::clone(self.execution),
            code.to_string(),
            Some(NODE_ENTRY_POINT.to_string()),
        )
        .await?;
        Ok((id, callable))
    }

    async fn edge(&self, def: &Value, known: &HashSet<&str>) -> Result<Edge, HandlerError> {
        let fields = object(def, "edge")?;
        let source = require_str(fields, "source")?;
        let target = require_str(fields, "target")?;
        if !known.contains(source) {
            return Err(HandlerError::InvalidParameters(format!(
                "edge source '{source}' is not a node"
            )));
        }
        let target = if END_NODES.contains(&target) {
            None
        } else if known.contains(target) {
            Some(target.to_string())
        } else {
            return Err(HandlerError::InvalidParameters(format!(
                "edge target '{target}' is not a node"
            )));
        };

        let condition = match optional_str(fields, "condition") {
            Some(expr) => Some(
                prepare_blocking(
                    Arc::clone(self.execution),
                    format!("fn main(state) {{ {expr} }}"),
                    None,
                )
                .await?,
            ),
            None => None,
        };

        Ok(Edge {
            source: source.to_string(),
            target,
            condition,
        })
    }
}

fn list<'a>(value: &'a Value, what: &str) -> Result<&'a [Value], HandlerError> {
    match value {
        Value::Null => Ok(&[][..]),
        Value::Array(items) => Ok(items.as_slice()),
        _ => Err(HandlerError::InvalidParameters(format!("'{what}' must be a list"))),
    }
}

fn object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, HandlerError> {
    value
        .as_object()
        .ok_or_else(|| HandlerError::InvalidParameters(format!("each {what} must be an object")))
}

fn owned_str(map: &Map<String, Value>, key: &str) -> Option<String> {
    optional_str(map, key).map(str::to_string)
}

/// Operations of the `graph` category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphOperation {
    Create,
    Run,
    Update,
}

impl GraphOperation {
    pub const ALL: &'static [GraphOperation] =
        &[GraphOperation::Create, GraphOperation::Run, GraphOperation::Update];

    pub fn name(self) -> &'static str {
        match self {
            GraphOperation::Create => "create_graph",
            GraphOperation::Run => "run_graph",
            GraphOperation::Update => "update_graph",
        }
    }
}

/// Handler for one [`GraphOperation`] over a shared graph table.
pub struct GraphHandler {
    execution: Arc<dyn ExecutionCapability>,
    graphs: Arc<HandleTable<Graph>>,
    operation: GraphOperation,
}

impl GraphHandler {
    pub fn new(
        execution: Arc<dyn ExecutionCapability>,
        graphs: Arc<HandleTable<Graph>>,
        operation: GraphOperation,
    ) -> Self {
        Self {
            execution,
            graphs,
            operation,
        }
    }

    fn builder(&self) -> GraphBuilder<'_> {
        GraphBuilder {
            execution: &self.execution,
        }
    }

    async fn lookup(&self, config: &Map<String, Value>) -> Result<(HandleId, Arc<Graph>), HandlerError> {
        let raw = require_str(config, "graphId")?;
        let not_found = || HandlerError::NotFound {
            kind: "Graph",
            id: raw.to_string(),
        };
        let id = HandleId::parse(raw).ok_or_else(not_found)?;
        let graph = self.graphs.get(&id).await.ok_or_else(not_found)?;
        Ok((id, graph))
    }

    async fn create(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let entry_point = optional_str(config, "entry_point").or(optional_str(config, "entryPoint"));
        let graph = self
            .builder()
            .build(
                owned_str(config, "name"),
                owned_str(config, "description"),
                entry_point,
                input.get("nodes").unwrap_or(&Value::Null),
                input.get("edges").unwrap_or(&Value::Null),
            )
            .await?;

        let nodes = graph.node_count();
        let described = graph.clone();
        let id = self.graphs.insert(graph).await;
        info!(graph_id = %id, nodes, "Created graph");
        Ok(described.describe(&id))
    }

    async fn run(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let (id, graph) = self.lookup(config).await?;
        let max_iterations = usize_or(config, "max_iterations", DEFAULT_MAX_ITERATIONS)?;
        let stream = config
            .get("stream_output")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut state = match input {
            Value::Null => Map::new(),
            Value::Object(obj) => obj.clone(),
            _ => {
                return Err(HandlerError::InvalidParameters(
                    "graph input must be an object".into(),
                ));
            }
        };
        let mut steps = Vec::new();
        let mut current = Some(graph.entry.clone());
        let mut iterations = 0;

        while let Some(node) = current {
            iterations += 1;
            if iterations > max_iterations {
                return Err(HandlerError::Failed(format!(
                    "Graph {id} exceeded {max_iterations} steps"
                )));
            }
            let callable = graph.nodes.get(&node).ok_or_else(|| {
                HandlerError::Failed(format!("Graph {id} has no node '{node}'"))
            })?;

            debug!(graph_id = %id, node = %node, "Running graph node");
            let update = call_blocking(Arc::clone(callable), Value::Object(state.clone())).await?;
            match update {
                Value::Null => {}
                Value::Object(ref fields) => {
                    state.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                ref other => {
                    return Err(HandlerError::Failed(format!(
                        "Node {node} returned {other}, expected an object"
                    )));
                }
            }
            if stream {
                let mut step = Map::new();
                step.insert(node.clone(), update);
                steps.push(Value::Object(step));
            }

            current = graph.next(&node, &Value::Object(state.clone())).await?;
        }

        info!(graph_id = %id, iterations, "Graph run finished");
        Ok(json!({ "output": state, "steps": steps }))
    }

    async fn update(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let (id, current) = self.lookup(config).await?;
        let fields = input.as_object().cloned().unwrap_or_default();
        let name = owned_str(&fields, "name").or_else(|| current.name.clone());
        let description = owned_str(&fields, "description").or_else(|| current.description.clone());

        let updated = match (fields.get("nodes"), fields.get("edges")) {
            (Some(nodes), Some(edges)) if nodes.is_array() && edges.is_array() => {
                let entry_point = owned_str(&fields, "entry_point");
                self.builder()
                    .build(name, description, entry_point.as_deref(), nodes, edges)
                    .await?
            }
            _ => Graph {
                name,
                description,
                ..(*current).clone()
            },
        };

        let described = updated.describe(&id);
        if !self.graphs.replace(&id, updated).await {
            return Err(HandlerError::NotFound {
                kind: "Graph",
                id: id.to_string(),
            });
        }
        info!(graph_id = %id, "Updated graph");
        Ok(described)
    }
}

#[async_trait]
impl TaskHandler for GraphHandler {
    async fn handle(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        match self.operation {
            GraphOperation::Create => self.create(config, input).await,
            GraphOperation::Run => self.run(config, input).await,
            GraphOperation::Update => self.update(config, input).await,
        }
    }
}
