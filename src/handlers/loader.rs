//! Document loading from inline sources.
//!
//! `document.load_document` turns the task's `source` into a single [`Document`]
//! and keeps it in the documents table, so later tasks can name it by `documentId`.
//! Sources are inline content; the worker never reads files or fetches URLs.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::info;

use super::Document;
use super::document::html_to_text;
use crate::dispatch::TaskHandler;
use crate::dispatch::handler::require_str;
use crate::error::HandlerError;
use crate::handles::HandleTable;

const INLINE_SOURCE: &str = "inline";

static HTML_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").expect("valid regex"));

/// Supported `type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Text,
    Json,
    Csv,
    Html,
}

impl SourceKind {
    pub fn parse(raw: &str) -> Result<Self, HandlerError> {
        match raw {
            "txt" | "text" => Ok(SourceKind::Text),
            "json" => Ok(SourceKind::Json),
            "csv" => Ok(SourceKind::Csv),
            "html" => Ok(SourceKind::Html),
            other => Err(HandlerError::InvalidParameters(format!(
                "Unsupported document type: {other}"
            ))),
        }
    }
}

/// `document.load_document`
pub struct LoadDocumentHandler {
    documents: Arc<HandleTable<Document>>,
}

impl LoadDocumentHandler {
    pub fn new(documents: Arc<HandleTable<Document>>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl TaskHandler for LoadDocumentHandler {
    async fn handle(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let doc_type = require_str(config, "type")?;
        let kind = SourceKind::parse(doc_type)?;
        let source = input
            .get("source")
            .filter(|v| !v.is_null())
            .ok_or_else(|| HandlerError::InvalidParameters("missing 'source' input".into()))?;
        let empty = Map::new();
        let options = input.get("options").and_then(Value::as_object).unwrap_or(&empty);

        let mut metadata = Map::new();
        let name = options
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(INLINE_SOURCE);
        metadata.insert("source".into(), json!(name));
        metadata.insert("type".into(), json!(doc_type));

        let content = match kind {
            SourceKind::Text => source_text(source)?.to_string(),
            SourceKind::Json => load_json(source, options)?,
            SourceKind::Csv => load_csv(source_text(source)?, options)?,
            SourceKind::Html => {
                let html = source_text(source)?;
                if let Some(title) = html_title(html) {
                    metadata.insert("title".into(), json!(title));
                }
                html_to_text(html)
            }
        };

        let mut document = Document {
            id: None,
            content,
            metadata,
        };
        let id = self.documents.insert(document.clone()).await;
        document.id = Some(id.to_string());

        info!(document_id = %id, doc_type, chars = document.content.len(), "Loaded document");
        serde_json::to_value(document).map_err(|e| HandlerError::Failed(e.to_string()))
    }
}

fn source_text(source: &Value) -> Result<&str, HandlerError> {
    source
        .as_str()
        .ok_or_else(|| HandlerError::InvalidParameters("'source' must be a string".into()))
}

fn html_title(html: &str) -> Option<String> {
    HTML_TITLE
        .captures(html)
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// JSON source: a JSON value or a string holding one. `options.pointer` (RFC 6901)
/// selects a sub-value; an array yields one section per element.
fn load_json(source: &Value, options: &Map<String, Value>) -> Result<String, HandlerError> {
    let parsed;
    let root = match source {
        Value::String(raw) => {
            parsed = serde_json::from_str::<Value>(raw).map_err(|e| {
                HandlerError::InvalidParameters(format!("'source' is not valid JSON: {e}"))
            })?;
            &parsed
        }
        other => other,
    };

    let pointer = options.get("pointer").and_then(Value::as_str).unwrap_or("");
    let selected = root.pointer(pointer).ok_or_else(|| {
        HandlerError::InvalidParameters(format!("JSON pointer '{pointer}' matches nothing"))
    })?;

    let render = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    Ok(match selected {
        Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join("\n\n"),
        other => render(other),
    })
}

/// CSV source with a header row. Each record becomes `column: value` lines, records are
/// separated by blank lines.
fn load_csv(source: &str, options: &Map<String, Value>) -> Result<String, HandlerError> {
    let delimiter = match options.get("delimiter").and_then(Value::as_str) {
        None => ',',
        Some(d) => {
            let mut chars = d.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c != '"' => c,
                _ => {
                    return Err(HandlerError::InvalidParameters(
                        "'delimiter' must be a single character".into(),
                    ));
                }
            }
        }
    };

    let mut rows = parse_csv(source, delimiter)?.into_iter();
    let Some(header) = rows.next() else {
        return Ok(String::new());
    };

    let records: Vec<String> = rows
        .filter(|row| row.iter().any(|field| !field.trim().is_empty()))
        .map(|row| {
            header
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    let value = row.get(i).map(String::as_str).unwrap_or("");
                    format!("{}: {}", column.trim(), value.trim())
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .collect();
    Ok(records.join("\n\n"))
}

/// Split CSV text into records. Quoted fields may contain the delimiter, newlines and
/// doubled quotes.
fn parse_csv(source: &str, delimiter: char) -> Result<Vec<Vec<String>>, HandlerError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => quoted = true,
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            c if c == delimiter => row.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }

    if quoted {
        return Err(HandlerError::InvalidParameters(
            "CSV source has an unterminated quoted field".into(),
        ));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}
