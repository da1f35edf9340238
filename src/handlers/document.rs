//! Document splitting and transformation handlers.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use tracing::info;
use uuid::Uuid;

use super::{Document, resolve_document};
use crate::dispatch::TaskHandler;
use crate::dispatch::handler::{optional_str, require_str, usize_or};
use crate::error::HandlerError;
use crate::execution::{ExecutionCapability, call_blocking, prepare_blocking};
use crate::handles::HandleTable;

const DEFAULT_CHUNK_SIZE: usize = 1000;
const DEFAULT_CHUNK_OVERLAP: usize = 200;
const DEFAULT_TRANSFORM_ENTRY_POINT: &str = "transform";

// ── Splitting ───────────────────────────────────────────────────────

/// Recursive character splitter.
///
/// Splits on the first separator present in the text, merges the pieces back up to
/// `chunk_size` characters with `chunk_overlap` characters carried between chunks, and
/// recurses with the remaining separators on any piece that is still too long.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl TextSplitter {
    pub fn new(
        chunk_size: usize,
        chunk_overlap: usize,
        separators: Vec<String>,
    ) -> Result<Self, HandlerError> {
        if chunk_size == 0 {
            return Err(HandlerError::InvalidParameters(
                "'chunkSize' must be greater than zero".into(),
            ));
        }
        if chunk_overlap > chunk_size {
            return Err(HandlerError::InvalidParameters(format!(
                "'chunkOverlap' ({chunk_overlap}) is larger than 'chunkSize' ({chunk_size})"
            )));
        }
        let separators = if separators.is_empty() {
            default_separators()
        } else {
            separators
        };
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators,
        })
    }

    /// Build from task config: `chunkSize`, `chunkOverlap`, `separators`.
    pub fn from_config(config: &Map<String, Value>) -> Result<Self, HandlerError> {
        let chunk_size = usize_or(config, "chunkSize", DEFAULT_CHUNK_SIZE)?;
        let chunk_overlap = usize_or(config, "chunkOverlap", DEFAULT_CHUNK_OVERLAP)?;
        let separators = match config.get("separators") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        HandlerError::InvalidParameters("'separators' must be strings".into())
                    })
                })
                .collect::<Result<_, _>>()?,
            Some(_) => {
                return Err(HandlerError::InvalidParameters(
                    "'separators' must be a list".into(),
                ));
            }
        };
        Self::new(chunk_size, chunk_overlap, separators)
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_with(text, &self.separators)
    }

    fn split_with(&self, text: &str, separators: &[String]) -> Vec<String> {
        // First separator that occurs in the text; the empty separator always matches.
        let mut separator = "";
        let mut remaining: &[String] = &[];
        for (i, sep) in separators.iter().enumerate() {
            if sep.is_empty() || text.contains(sep.as_str()) {
                separator = sep;
                remaining = &separators[i + 1..];
                break;
            }
        }

        let pieces: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut chunks = Vec::new();
        let mut pending = Vec::new();
        for piece in pieces {
            if char_len(&piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }
            if !pending.is_empty() {
                chunks.extend(self.merge(&pending, separator));
                pending.clear();
            }
            if remaining.is_empty() {
                chunks.push(piece);
            } else {
                chunks.extend(self.split_with(&piece, remaining));
            }
        }
        if !pending.is_empty() {
            chunks.extend(self.merge(&pending, separator));
        }
        chunks
    }

    fn merge(&self, pieces: &[String], separator: &str) -> Vec<String> {
        let sep_len = char_len(separator);
        let mut chunks = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);
            let joined_sep = if window.is_empty() { 0 } else { sep_len };

            if total + len + joined_sep > self.chunk_size && !window.is_empty() {
                push_chunk(&mut chunks, &window, separator);

                // Drop from the front until only the overlap remains and the next piece fits.
                while total > self.chunk_overlap
                    || (total > 0
                        && total + len + if window.is_empty() { 0 } else { sep_len }
                            > self.chunk_size)
                {
                    let Some(front) = window.pop_front() else {
                        break;
                    };
                    let sep = if window.is_empty() { 0 } else { sep_len };
                    total = total.saturating_sub(char_len(front) + sep);
                }
            }

            let sep = if window.is_empty() { 0 } else { sep_len };
            window.push_back(piece);
            total += len + sep;
        }

        push_chunk(&mut chunks, &window, separator);
        chunks
    }
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            separators: default_separators(),
        }
    }
}

fn default_separators() -> Vec<String> {
    ["\n\n", "\n", " ", ""].iter().map(|s| s.to_string()).collect()
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn push_chunk(chunks: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

/// `document.split_document`
pub struct SplitDocumentHandler {
    documents: Arc<HandleTable<Document>>,
}

impl SplitDocumentHandler {
    pub fn new(documents: Arc<HandleTable<Document>>) -> Self {
        Self { documents }
    }
}

#[async_trait]
impl TaskHandler for SplitDocumentHandler {
    async fn handle(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let document = resolve_document(&self.documents, config, input).await?;
        let splitter = TextSplitter::from_config(config)?;

        info!(document_id = ?document.id, chunk_size = splitter.chunk_size, "Splitting document");

        let chunks: Vec<Document> = splitter
            .split(&document.content)
            .into_iter()
            .enumerate()
            .map(|(i, content)| {
                let mut metadata = document.metadata.clone();
                metadata.insert("chunk".into(), json!(i));
                Document {
                    id: Some(Uuid::new_v4().to_string()),
                    content,
                    metadata,
                }
            })
            .collect();

        serde_json::to_value(chunks).map_err(|e| HandlerError::Failed(e.to_string()))
    }
}

// ── Transformation ──────────────────────────────────────────────────

static MD_CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[\s\S]*?```").expect("valid regex"));
static MD_IMAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[([^\]]*)\]\([^)]+\)").expect("valid regex"));
static MD_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("valid regex"));
static MD_HEADER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#+ ").expect("valid regex"));
static MD_EMPHASIS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*|\*|__|\|").expect("valid regex"));
static MD_INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`([^`]+)`").expect("valid regex"));

static HTML_SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").expect("valid regex"));
static HTML_STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").expect("valid regex"));
static HTML_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("valid regex"));
static HTML_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

/// Strip markdown syntax, keeping link and inline-code text.
pub fn markdown_to_text(content: &str) -> String {
    let text = MD_CODE_BLOCK.replace_all(content, "");
    let text = MD_IMAGE.replace_all(&text, "");
    let text = MD_LINK.replace_all(&text, "$1");
    let text = MD_HEADER.replace_all(&text, "");
    let text = MD_EMPHASIS.replace_all(&text, "");
    MD_INLINE_CODE.replace_all(&text, "$1").into_owned()
}

/// Strip markup, scripts and styles from HTML and decode common entities.
pub fn html_to_text(content: &str) -> String {
    let text = HTML_SCRIPT.replace_all(content, "");
    let text = HTML_STYLE.replace_all(&text, "");
    let text = HTML_COMMENT.replace_all(&text, "");
    let text = HTML_TAG.replace_all(&text, "");
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// `document.transform_document`
pub struct TransformDocumentHandler {
    execution: Arc<dyn ExecutionCapability>,
    documents: Arc<HandleTable<Document>>,
}

impl TransformDocumentHandler {
    pub fn new(
        execution: Arc<dyn ExecutionCapability>,
        documents: Arc<HandleTable<Document>>,
    ) -> Self {
        Self {
            execution,
            documents,
        }
    }

    /// Run caller-supplied code over the document. The callable receives the document
    /// object and returns either new content or a document-shaped object.
    async fn custom(
        &self,
        config: &Map<String, Value>,
        document: &Document,
    ) -> Result<(String, Map<String, Value>), HandlerError> {
        let code = require_str(config, "code")?;
        let entry_point = optional_str(config, "entryPoint").unwrap_or(DEFAULT_TRANSFORM_ENTRY_POINT);

        let callable = prepare_blocking(
            Arc::clone(&self.execution),
            code.to_string(),
            Some(entry_point.to_string()),
        )
        .await?;
        let doc_value =
            serde_json::to_value(document).map_err(|e| HandlerError::Failed(e.to_string()))?;
        let output = call_blocking(callable, doc_value).await?;

        match output {
            Value::String(content) => Ok((content, document.metadata.clone())),
            Value::Object(ref obj) if obj.get("content").is_some_and(Value::is_string) => {
                let returned = Document::from_value(&output)?;
                let mut metadata = document.metadata.clone();
                metadata.extend(returned.metadata);
                Ok((returned.content, metadata))
            }
            _ => Err(HandlerError::Failed(
                "custom transformation must return a string or an object with 'content'".into(),
            )),
        }
    }
}

#[async_trait]
impl TaskHandler for TransformDocumentHandler {
    async fn handle(&self, config: &Map<String, Value>, input: &Value) -> Result<Value, HandlerError> {
        let document = resolve_document(&self.documents, config, input).await?;
        let transformation = require_str(config, "transformation")?;

        info!(document_id = ?document.id, transformation, "Transforming document");

        let (content, mut metadata) = match transformation {
            "markdown_to_text" => (markdown_to_text(&document.content), document.metadata.clone()),
            "html_to_text" => (html_to_text(&document.content), document.metadata.clone()),
            "custom" => self.custom(config, &document).await?,
            other => {
                return Err(HandlerError::InvalidParameters(format!(
                    "Unsupported transformation: {other}"
                )));
            }
        };
        metadata.insert("transformation".into(), json!(transformation));

        serde_json::to_value(Document {
            id: Some(Uuid::new_v4().to_string()),
            content,
            metadata,
        })
        .map_err(|e| HandlerError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScriptConfig;
    use crate::execution::ScriptSandbox;

    fn config(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn splitter(size: usize, overlap: usize) -> TextSplitter {
        TextSplitter::new(size, overlap, Vec::new()).unwrap()
    }

    #[test]
    fn splits_on_words_without_overlap() {
        assert_eq!(
            splitter(9, 0).split("one two three four"),
            vec!["one two", "three", "four"]
        );
    }

    #[test]
    fn carries_overlap_between_chunks() {
        assert_eq!(
            splitter(3, 1).split("a b c d e"),
            vec!["a b", "b c", "c d", "d e"]
        );
    }

    #[test]
    fn prefers_paragraph_breaks() {
        let text = "first paragraph\n\nsecond paragraph";
        assert_eq!(
            splitter(20, 0).split(text),
            vec!["first paragraph", "second paragraph"]
        );
    }

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(TextSplitter::default().split("tiny"), vec!["tiny"]);
        assert!(TextSplitter::default().split("").is_empty());
    }

    #[test]
    fn rejects_overlap_larger_than_size() {
        assert!(TextSplitter::new(10, 11, Vec::new()).is_err());
        assert!(TextSplitter::new(0, 0, Vec::new()).is_err());
    }

    #[tokio::test]
    async fn split_handler_numbers_chunks_and_keeps_metadata() {
        let out = SplitDocumentHandler::new(Arc::default())
            .handle(
                &config(json!({"chunkSize": 9, "chunkOverlap": 0})),
                &json!({"document": {"id": "d1", "content": "one two three four", "metadata": {"source": "s3"}}}),
            )
            .await
            .unwrap();

        let chunks = out.as_array().unwrap();
        assert_eq!(chunks.len(), 3);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk["metadata"]["chunk"], json!(i));
            assert_eq!(chunk["metadata"]["source"], json!("s3"));
            assert!(chunk["id"].is_string());
        }
        assert_eq!(chunks[2]["content"], json!("four"));
    }

    #[test]
    fn markdown_is_flattened() {
        let md = "# Title\n\nSome **bold** and [a link](http://x.y) with `code`.\n![pic](p.png)\n```\nfn x() {}\n```";
        let text = markdown_to_text(md);
        assert_eq!(text.trim(), "Title\n\nSome bold and a link with code.");
    }

    #[test]
    fn html_is_flattened() {
        let html = "<html><head><style>p{}</style><script>alert(1)</script></head>\
                    <body><p>Fish &amp; chips</p><!-- hidden --></body></html>";
        assert_eq!(html_to_text(html), "Fish & chips");
    }

    fn transformer() -> TransformDocumentHandler {
        TransformDocumentHandler::new(
            Arc::new(ScriptSandbox::new(&ScriptConfig::default())),
            Arc::default(),
        )
    }

    #[tokio::test]
    async fn builtin_transformation_tags_metadata() {
        let out = transformer()
            .handle(
                &config(json!({"transformation": "markdown_to_text"})),
                &json!({"document": {"content": "## Hi", "metadata": {"lang": "en"}}}),
            )
            .await
            .unwrap();
        assert_eq!(out["content"], json!("Hi"));
        assert_eq!(out["metadata"]["lang"], json!("en"));
        assert_eq!(out["metadata"]["transformation"], json!("markdown_to_text"));
    }

    #[tokio::test]
    async fn custom_transformation_uses_transform_entry_point() {
        let code = r#"
            fn main(doc) { "from main" }
            fn transform(doc) { doc.content.to_upper() }
        "#;
        let out = transformer()
            .handle(
                &config(json!({"transformation": "custom", "code": code})),
                &json!({"content": "shout"}),
            )
            .await
            .unwrap();
        assert_eq!(out["content"], json!("SHOUT"));
        assert_eq!(out["metadata"]["transformation"], json!("custom"));
    }

    #[tokio::test]
    async fn custom_transformation_falls_back_to_main() {
        let code = r#"fn main(doc) { #{ content: doc.content + "!", metadata: #{ touched: true } } }"#;
        let out = transformer()
            .handle(
                &config(json!({"transformation": "custom", "code": code})),
                &json!({"content": "hey"}),
            )
            .await
            .unwrap();
        assert_eq!(out["content"], json!("hey!"));
        assert_eq!(out["metadata"]["touched"], json!(true));
    }

    #[tokio::test]
    async fn custom_transformation_without_entry_point_fails() {
        let err = transformer()
            .handle(
                &config(json!({"transformation": "custom", "code": "fn other(d) { d }"})),
                &json!({"content": "x"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Execution(crate::error::ExecutionError::EntryPointNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_transformation_is_rejected() {
        let err = transformer()
            .handle(
                &config(json!({"transformation": "summarize"})),
                &json!({"content": "x"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid parameters: Unsupported transformation: summarize");
    }

    #[tokio::test]
    async fn split_reads_a_loaded_document_by_id() {
        let documents: Arc<HandleTable<Document>> = Arc::default();
        let id = documents
            .insert(Document {
                id: None,
                content: "alpha beta gamma".into(),
                metadata: Map::from_iter([("type".to_string(), json!("txt"))]),
            })
            .await;

        let out = SplitDocumentHandler::new(Arc::clone(&documents))
            .handle(
                &config(json!({"documentId": id.to_string(), "chunkSize": 10, "chunkOverlap": 0})),
                &json!({}),
            )
            .await
            .unwrap();
        let chunks = out.as_array().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0]["metadata"]["type"], json!("txt"));

        let err = SplitDocumentHandler::new(documents)
            .handle(&config(json!({"documentId": "nope"})), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Document nope not found");
    }
}
