//! Agent tool surface: a manifest at `GET /mcp/tools` and JSON invocation
//! at `POST /mcp/invoke`.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::Instrument;

use super::observability::spans;
use super::rest::record_request;
use crate::config::KeywordMode;
use crate::query::{Query, QueryPlanner, QueryResponse};
use crate::watcher::WatchHealth;

const DEFAULT_SEARCH_LIMIT: u64 = 10;
const DEFAULT_LIST_LIMIT: u64 = 100;

/// State shared by every HTTP handler.
pub struct AppState {
    pub planner: QueryPlanner,
    health: Option<watch::Receiver<WatchHealth>>,
}

impl AppState {
    /// State without a running watcher; always reports healthy watches.
    #[must_use]
    pub const fn new(planner: QueryPlanner) -> Self {
        Self {
            planner,
            health: None,
        }
    }

    /// Report the given watcher's health on `/health`.
    #[must_use]
    pub fn with_watch_health(mut self, health: watch::Receiver<WatchHealth>) -> Self {
        self.health = Some(health);
        self
    }

    /// Current watch health.
    #[must_use]
    pub fn watch_health(&self) -> WatchHealth {
        self.health
            .as_ref()
            .map_or(WatchHealth::Healthy, |rx| rx.borrow().clone())
    }
}

/// Tool information with schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Tool definitions.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn get_tools() -> Vec<ToolInfo> {
    vec![
        ToolInfo {
            name: "search_vector".to_string(),
            description: Some("Find chunks semantically similar to a natural-language query".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Natural language query"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of results (default: 10)",
                        "default": DEFAULT_SEARCH_LIMIT
                    },
                    "filetype": {
                        "type": "string",
                        "description": "Only chunks of this filetype, e.g. \"py\""
                    },
                    "directory": {
                        "type": "string",
                        "description": "Only chunks under this absolute directory"
                    }
                },
                "required": ["query"]
            }),
        },
        ToolInfo {
            name: "search_keyword".to_string(),
            description: Some(
                "Find chunks whose path or metadata contain the given terms, case-insensitively"
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "terms": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Terms to match"
                    },
                    "limit": {
                        "type": "integer",
                        "description": "Maximum number of results (default: 10)",
                        "default": DEFAULT_SEARCH_LIMIT
                    },
                    "mode": {
                        "type": "string",
                        "enum": ["any", "all"],
                        "description": "Match any term or all terms (default: server setting)"
                    }
                },
                "required": ["terms"]
            }),
        },
        ToolInfo {
            name: "get_file_content".to_string(),
            description: Some("Return the indexed content of one file".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Absolute file path"
                    }
                },
                "required": ["path"]
            }),
        },
        ToolInfo {
            name: "get_file_metadata".to_string(),
            description: Some("Return size, mtime, hash and chunk counts of one file".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Absolute file path"
                    }
                },
                "required": ["path"]
            }),
        },
        ToolInfo {
            name: "list_indexed_files".to_string(),
            description: Some("List indexed file paths, most recently added first".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "integer",
                        "description": "Maximum paths to return (default: 100)",
                        "default": DEFAULT_LIST_LIMIT
                    }
                },
                "required": []
            }),
        },
        ToolInfo {
            name: "get_index_stats".to_string(),
            description: Some("Return file, chunk and pending-chunk counts".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        },
    ]
}

/// Create the tool router.
pub fn create_mcp_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp/tools", get(list_tools))
        .route("/mcp/invoke", post(invoke_tool))
        .with_state(state)
}

async fn list_tools() -> Json<Vec<ToolInfo>> {
    Json(get_tools())
}

/// Tool invocation request.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Tool invocation response. Exactly one of `content` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn invoke_tool(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ToolRequest>,
) -> Json<ToolResponse> {
    let started = Instant::now();
    let span = spans::tool_span(&request.name);

    let result = async {
        tracing::debug!(arguments = %request.arguments, "Invoking tool");
        let result = match tool_query(&request.name, &request.arguments) {
            Ok(query) => state
                .planner
                .execute(query)
                .await
                .map_err(|e| e.to_string())
                .and_then(|response| render(&request.name, response)),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            tracing::warn!(error = %e, "Tool invocation failed");
        }
        result
    }
    .instrument(span)
    .await;

    record_request("/mcp/invoke", "POST", StatusCode::OK, started);
    Json(match result {
        Ok(content) => ToolResponse {
            content,
            error: None,
        },
        Err(e) => ToolResponse {
            content: Value::Null,
            error: Some(e),
        },
    })
}

/// Translate tool arguments into a query.
fn tool_query(name: &str, args: &Value) -> std::result::Result<Query, String> {
    match name {
        "search_vector" => Ok(Query::Semantic {
            text: required_str(args, "query")?.to_string(),
            limit: limit_arg(args, DEFAULT_SEARCH_LIMIT),
            filetype: optional_str(args, "filetype"),
            directory: optional_str(args, "directory"),
        }),
        "search_keyword" => {
            let terms = match aliased(args, "terms", "keywords") {
                Value::Array(items) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect(),
                Value::String(s) => s.split_whitespace().map(ToString::to_string).collect(),
                _ => return Err("terms is required".to_string()),
            };
            let mode = optional_str(args, "mode")
                .map(|m| m.parse::<KeywordMode>())
                .transpose()?;
            Ok(Query::Keyword {
                terms,
                limit: limit_arg(args, DEFAULT_SEARCH_LIMIT),
                mode,
            })
        }
        "get_file_content" | "get_file_metadata" => {
            let path = aliased(args, "path", "filepath")
                .as_str()
                .ok_or_else(|| "path is required".to_string())?;
            Ok(Query::ExactPath {
                path: path.to_string(),
            })
        }
        "list_indexed_files" => Ok(Query::List {
            limit: limit_arg(args, DEFAULT_LIST_LIMIT),
        }),
        "get_index_stats" => Ok(Query::Stats),
        other => Err(format!("Unknown tool: {other}")),
    }
}

/// Shape a query response for the tool that asked for it.
fn render(name: &str, response: QueryResponse) -> std::result::Result<Value, String> {
    let value = match (name, response) {
        ("get_file_metadata", QueryResponse::File(doc)) => json!({
            "filepath": doc.filepath,
            "filetype": doc.filetype,
            "chunk_count": doc.chunk_count,
            "pending_chunks": doc.pending_chunks,
            "metadata": doc.metadata,
            "updated_at": doc.updated_at,
        }),
        ("get_file_content", QueryResponse::File(doc)) => json!({
            "filepath": doc.filepath,
            "filetype": doc.filetype,
            "content": doc.content,
        }),
        (_, QueryResponse::Hits(hits)) => json!({"count": hits.len(), "results": hits}),
        (_, QueryResponse::Files(files)) => json!({"count": files.len(), "files": files}),
        (_, QueryResponse::Stats(stats)) => serde_json::to_value(stats).map_err(|e| e.to_string())?,
        (_, QueryResponse::File(doc)) => serde_json::to_value(doc).map_err(|e| e.to_string())?,
    };
    Ok(value)
}

/// `key`, or `alias` when `key` is absent.
fn aliased<'a>(args: &'a Value, key: &str, alias: &str) -> &'a Value {
    match &args[key] {
        Value::Null => &args[alias],
        value => value,
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, String> {
    args[key].as_str().ok_or_else(|| format!("{key} is required"))
}

fn optional_str(args: &Value, key: &str) -> Option<String> {
    args[key].as_str().map(ToString::to_string)
}

#[allow(clippy::cast_possible_truncation)]
fn limit_arg(args: &Value, default: u64) -> usize {
    args["limit"].as_u64().unwrap_or(default) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::embeddings::{EmbeddingService, HashEmbedder};
    use crate::storage::{init_storage, ChunkRecord, ChunkStore, Database, SqliteStore};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const DIM: usize = 32;

    fn state() -> Arc<AppState> {
        let db = Database::open_in_memory().unwrap();
        init_storage(&db).unwrap();
        let store = SqliteStore::shared(db);
        store
            .upsert(
                &ChunkRecord::new("/proj/a.py", 0, 1, 2, "def f():\n    return 1", "py")
                    .with_meta("size", 22)
                    .with_embedding(HashEmbedder::new(DIM).embed_sync("def f():\n    return 1")),
            )
            .unwrap();
        let service = EmbeddingService::new(Arc::new(HashEmbedder::new(DIM)), RetryPolicy::immediate(1), 1, DIM);
        Arc::new(AppState::new(QueryPlanner::new(store, service, KeywordMode::Any, 100)))
    }

    async fn invoke(name: &str, arguments: Value) -> ToolResponse {
        let response = create_mcp_router(state())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/mcp/invoke")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"name": name, "arguments": arguments}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[test]
    fn test_tools_defined() {
        let names: Vec<String> = get_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            [
                "search_vector",
                "search_keyword",
                "get_file_content",
                "get_file_metadata",
                "list_indexed_files",
                "get_index_stats",
            ]
        );
    }

    #[test]
    fn test_every_tool_maps_to_a_query() {
        let args = json!({"query": "q", "terms": ["t"], "path": "/p"});
        for tool in get_tools() {
            assert!(tool_query(&tool.name, &args).is_ok(), "{}", tool.name);
        }
        assert!(tool_query("add_lesson", &args).is_err());
    }

    #[test]
    fn test_keyword_arguments() {
        let query = tool_query("search_keyword", &json!({"terms": "foo bar", "mode": "all", "limit": 3})).unwrap();
        assert_eq!(
            query,
            Query::Keyword {
                terms: vec!["foo".to_string(), "bar".to_string()],
                limit: 3,
                mode: Some(KeywordMode::All),
            }
        );
        assert!(tool_query("search_keyword", &json!({"terms": ["x"], "mode": "some"})).is_err());
        assert!(tool_query("search_keyword", &json!({})).is_err());
    }

    #[test]
    fn test_legacy_argument_names() {
        let query = tool_query("search_keyword", &json!({"keywords": ["foo"]})).unwrap();
        assert!(matches!(query, Query::Keyword { ref terms, .. } if terms == &["foo".to_string()]));

        let preferred = tool_query("search_keyword", &json!({"terms": ["a"], "keywords": ["b"]})).unwrap();
        assert!(matches!(preferred, Query::Keyword { ref terms, .. } if terms == &["a".to_string()]));

        for tool in ["get_file_content", "get_file_metadata"] {
            assert_eq!(
                tool_query(tool, &json!({"filepath": "/proj/a.py"})).unwrap(),
                Query::ExactPath {
                    path: "/proj/a.py".to_string()
                }
            );
        }
        assert!(tool_query("get_file_content", &json!({})).is_err());
    }

    #[tokio::test]
    async fn test_file_content_by_filepath() {
        let response = invoke("get_file_content", json!({"filepath": "/proj/a.py"})).await;
        assert!(response.error.is_none());
        assert_eq!(response.content["filepath"], "/proj/a.py");
    }

    #[tokio::test]
    async fn test_search_vector_tool() {
        let response = invoke("search_vector", json!({"query": "return value", "limit": 5})).await;

        assert!(response.error.is_none());
        assert_eq!(response.content["count"], 1);
        assert_eq!(response.content["results"][0]["filepath"], "/proj/a.py");
        assert!(response.content["results"][0]["score"].is_number());
    }

    #[tokio::test]
    async fn test_file_tools() {
        let content = invoke("get_file_content", json!({"path": "/proj/a.py"})).await;
        assert_eq!(content.content["content"], "def f():\n    return 1");

        let metadata = invoke("get_file_metadata", json!({"path": "/proj/a.py"})).await;
        assert_eq!(metadata.content["chunk_count"], 1);
        assert_eq!(metadata.content["metadata"]["size"], 22);
        assert!(metadata.content.get("content").is_none());

        let missing = invoke("get_file_content", json!({"path": "/proj/none.py"})).await;
        assert!(missing.error.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_unknown_tool_reports_error() {
        let response = invoke("trigger_reindex", json!({})).await;
        assert!(response.content.is_null());
        assert_eq!(response.error.as_deref(), Some("Unknown tool: trigger_reindex"));
    }

    #[tokio::test]
    async fn test_stats_tool() {
        let response = invoke("get_index_stats", Value::Null).await;
        assert_eq!(response.content["files"], 1);
        assert_eq!(response.content["chunks"], 1);
        assert_eq!(response.content["pending_chunks"], 0);
    }
}
