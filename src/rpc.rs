//! The RPC surface: nine operations over the shared engine. The
//! transport stays thin; every handler validates its inputs, delegates
//! to the orchestrator, and converts typed errors into the JSON error
//! envelope.

use crate::config::{self, Config};
use crate::error::{Error, Result};
use crate::index_manager::IndexStats;
use crate::orchestrator::{Orchestrator, SearchParams, SearchResponse};
use crate::state::AppState;
use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Value, json};

/// Operation manifest. State-changing operations require confirmation
/// from interactive callers.
pub struct OperationSpec {
    pub name: &'static str,
    pub requires_confirmation: bool,
}

pub const OPERATIONS: &[OperationSpec] = &[
    OperationSpec { name: "create_index", requires_confirmation: true },
    OperationSpec { name: "search_code", requires_confirmation: false },
    OperationSpec { name: "search_docs", requires_confirmation: false },
    OperationSpec { name: "search_by_path", requires_confirmation: false },
    OperationSpec { name: "get_index_status", requires_confirmation: false },
    OperationSpec { name: "get_config", requires_confirmation: false },
    OperationSpec { name: "reindex_project", requires_confirmation: true },
    OperationSpec { name: "reindex_file", requires_confirmation: false },
    OperationSpec { name: "delete_index", requires_confirmation: true },
];

pub async fn list_operations() -> Json<Value> {
    Json(json!({
        "operations": OPERATIONS
            .iter()
            .map(|op| json!({
                "name": op.name,
                "requires_confirmation": op.requires_confirmation,
            }))
            .collect::<Vec<_>>(),
    }))
}

fn validate_query(query: &str) -> Result<()> {
    if query.trim().is_empty() {
        return Err(Error::InvalidQuery("query must not be empty".to_string()));
    }
    if query.len() > config::MAX_QUERY_LENGTH {
        return Err(Error::InvalidQuery(format!(
            "query is {} characters, cap is {}",
            query.len(),
            config::MAX_QUERY_LENGTH
        )));
    }
    Ok(())
}

fn index_payload(status: &str, orchestrator: &Orchestrator, stats: &IndexStats) -> Value {
    json!({
        "status": status,
        "project_path": orchestrator.project_root(),
        "index_path": orchestrator.index_dir(),
        "stats": {
            "files": stats.files,
            "chunks": stats.chunks,
            "duration_ms": stats.duration_ms,
            "error_count": stats.error_count,
        },
        "docs_stats": stats.docs,
        "errors": stats.errors,
    })
}

pub async fn create_index(State(state): State<AppState>) -> Result<Json<Value>> {
    // Exclusive slot access: concurrent creates serialize here, and the
    // loser sees the index the winner built.
    let mut slot = state.slot().await;
    if slot.is_some() {
        return Err(Error::IndexExists(state.project_root.to_string_lossy().to_string()));
    }
    let (orchestrator, stats) =
        Orchestrator::create(&state.project_root, Config::default(), state.embedder.clone())
            .await?;
    let payload = index_payload("created", &orchestrator, &stats);
    *slot = Some(orchestrator);
    Ok(Json(payload))
}

pub async fn search_code(
    State(state): State<AppState>,
    Json(params): Json<SearchParams>,
) -> Result<Json<SearchResponse>> {
    validate_query(&params.query)?;
    Ok(Json(state.orchestrator().await?.search_code(params).await?))
}

pub async fn search_docs(
    State(state): State<AppState>,
    Json(params): Json<SearchParams>,
) -> Result<Json<SearchResponse>> {
    validate_query(&params.query)?;
    Ok(Json(state.orchestrator().await?.search_docs(params).await?))
}

#[derive(Debug, Deserialize)]
pub struct PathSearchParams {
    pub pattern: String,
    pub limit: Option<usize>,
}

pub async fn search_by_path(
    State(state): State<AppState>,
    Json(params): Json<PathSearchParams>,
) -> Result<Json<Value>> {
    let limit = params.limit.unwrap_or(20).clamp(1, 1000);
    Ok(Json(state.orchestrator().await?.search_by_path(&params.pattern, limit).await?))
}

pub async fn get_index_status(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(Json(state.orchestrator().await?.status().await?))
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<Value>> {
    Ok(Json(state.orchestrator().await?.config_payload()))
}

pub async fn reindex_project(State(state): State<AppState>) -> Result<Json<Value>> {
    let orchestrator = state.orchestrator().await?;
    let stats = orchestrator.reindex_project().await?;
    Ok(Json(index_payload("complete", &orchestrator, &stats)))
}

#[derive(Debug, Deserialize)]
pub struct ReindexFileParams {
    pub file_path: String,
}

pub async fn reindex_file(
    State(state): State<AppState>,
    Json(params): Json<ReindexFileParams>,
) -> Result<Json<Value>> {
    let chunks = state.orchestrator().await?.reindex_file(&params.file_path).await?;
    Ok(Json(json!({
        "status": "ok",
        "file_path": params.file_path,
        "chunks_created": chunks,
    })))
}

pub async fn delete_index(State(state): State<AppState>) -> Result<Json<Value>> {
    let orchestrator = state
        .take_orchestrator()
        .await
        .ok_or_else(|| Error::IndexNotFound(state.project_root.to_string_lossy().to_string()))?;
    let project_path = orchestrator.project_root().to_path_buf();
    let index_path = orchestrator.index_dir().to_path_buf();
    orchestrator.delete_index().await?;
    Ok(Json(json!({
        "status": "deleted",
        "project_path": project_path,
        "index_path": index_path,
    })))
}
