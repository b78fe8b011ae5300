//! HTTP tool server.
//!
//! Exposes the knowledge-base registry as JSON tools so agents and editors
//! can refresh and query source directories over HTTP.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/tools/list` | List tools with parameter schemas |
//! | `POST` | `/tools/refresh` | Refresh a knowledge base and return the summary |
//! | `POST` | `/tools/search` | Search a knowledge base |
//! | `POST` | `/tools/close` | Drop a knowledge base from the registry |
//!
//! Every tool body carries `source_path` plus the optional per-call
//! overrides (`embedding_model`, `chunk_size`, `chunk_overlap`, `top_k`,
//! `batch_size`).
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_path", "message": "invalid source path ..." } }
//! ```
//!
//! Codes come from [`KbError::code`]. Input problems map to 400, timeouts
//! to 408, provider failures to 502, everything else to 500.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use knowledge_sync_core::models::SearchHit;

use crate::config::RequestParams;
use crate::error::KbError;
use crate::knowledge_base::RefreshSummary;
use crate::registry::{cache_key, KnowledgeBaseRegistry};

#[derive(Clone)]
struct AppState {
    registry: Arc<KnowledgeBaseRegistry>,
}

/// Serve `registry` on its configured bind address until the process exits.
pub async fn run_server(registry: Arc<KnowledgeBaseRegistry>) -> anyhow::Result<()> {
    let bind_addr = registry.config().server.bind.clone();
    let app = router(registry);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(bind = %bind_addr, "tool server listening");
    println!("Tool server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Routes for the tool server, with permissive CORS.
pub fn router(registry: Arc<KnowledgeBaseRegistry>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/refresh", post(handle_refresh))
        .route("/tools/search", post(handle_search))
        .route("/tools/close", post(handle_close))
        .layer(cors)
        .with_state(AppState { registry })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<KbError> for AppError {
    fn from(err: KbError) -> Self {
        let status = match &err {
            KbError::InvalidPath { .. } | KbError::UnknownModel(_) | KbError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            KbError::TimedOut(_) => StatusCode::REQUEST_TIMEOUT,
            KbError::Embedding(_) => StatusCode::BAD_GATEWAY,
            KbError::Index(_) | KbError::Store(_) | KbError::Cancelled | KbError::Failed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!(code = err.code(), error = %err, "tool call failed");
        }
        AppError {
            status,
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    knowledge_bases: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        knowledge_bases: state.registry.keys().len(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolInfo {
    name: &'static str,
    description: &'static str,
    parameters: serde_json::Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

fn source_schema(extra: serde_json::Value) -> serde_json::Value {
    let mut properties = serde_json::json!({
        "source_path": { "type": "string", "description": "Directory to index" },
        "embedding_model": { "type": "string" },
        "chunk_size": { "type": "integer", "minimum": 1 },
        "chunk_overlap": { "type": "integer", "minimum": 0 },
        "top_k": { "type": "integer", "minimum": 1 },
        "batch_size": { "type": "integer", "minimum": 1 }
    });
    let mut required = vec![serde_json::json!("source_path")];
    if let (Some(props), serde_json::Value::Object(extra)) = (properties.as_object_mut(), extra) {
        for (name, schema) in extra {
            required.push(serde_json::json!(name.clone()));
            props.insert(name, schema);
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

async fn handle_list_tools() -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: vec![
            ToolInfo {
                name: "refresh",
                description: "Bring a directory's knowledge base up to date with the files on disk",
                parameters: source_schema(serde_json::json!({})),
            },
            ToolInfo {
                name: "search",
                description: "Return the chunks most similar to a query",
                parameters: source_schema(serde_json::json!({
                    "query": { "type": "string" }
                })),
            },
            ToolInfo {
                name: "close",
                description: "Release a knowledge base held by the server",
                parameters: source_schema(serde_json::json!({})),
            },
        ],
    })
}

// ============ POST /tools/refresh ============

#[derive(Serialize)]
struct RefreshResponse {
    key: String,
    summary: RefreshSummary,
}

async fn handle_refresh(
    State(state): State<AppState>,
    Json(params): Json<RequestParams>,
) -> Result<Json<RefreshResponse>, AppError> {
    let summary = state.registry.refresh(&params).await?;
    let key = resolved_key(&state.registry, &params)?;
    Ok(Json(RefreshResponse { key, summary }))
}

// ============ POST /tools/search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(flatten)]
    params: RequestParams,
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }
    let results = state.registry.search(&req.params, &req.query).await?;
    Ok(Json(SearchResponse { results }))
}

// ============ POST /tools/close ============

#[derive(Serialize)]
struct CloseResponse {
    key: String,
    closed: bool,
}

async fn handle_close(
    State(state): State<AppState>,
    Json(params): Json<RequestParams>,
) -> Result<Json<CloseResponse>, AppError> {
    let key = resolved_key(&state.registry, &params)?;
    let closed = state.registry.close(&key);
    Ok(Json(CloseResponse { key, closed }))
}

fn resolved_key(
    registry: &KnowledgeBaseRegistry,
    params: &RequestParams,
) -> Result<String, AppError> {
    let resolved = registry.resolve(params);
    let (key, _) = cache_key(&resolved.source_path, &resolved.embedding_model)?;
    Ok(key)
}
