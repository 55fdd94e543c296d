// HTTP surface of the coordinator. Every endpoint goes through the
// SyncCoordinator; binary bodies cross the boundary base64-encoded.

pub mod ws;

use axum::{
    extract::{Path as AxumPath, Query, State},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::core::sha256_hex;
use crate::core::vector_clock::VectorClock;
use crate::error::{AppError, AppResult};
use crate::models::{Delta, DeltaMetrics, DeltaOp, FileVersion, RegisterNodeRequest};

fn default_true() -> bool {
    true
}

// HTTP request/response types

#[derive(Deserialize)]
pub struct UploadRequest {
    pub file_id: Option<String>,
    pub file_name: String,
    pub node_id: String,
    /// Whole content, base64
    pub content: Option<String>,
    /// Alternatively, the chunk bodies in order, base64 each
    pub chunks: Option<Vec<String>>,
    pub vector_clock: Option<VectorClock>,
    pub content_hash: Option<String>,
    /// When false the upload is reported as a full transfer, with no
    /// savings against the prior head
    #[serde(default = "default_true")]
    pub use_delta_sync: bool,
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOpRequest {
    Copy {
        from_index: usize,
        #[serde(default)]
        count: Option<usize>,
        size: u64,
    },
    Insert {
        index: usize,
        chunk_hash: String,
        size: usize,
        /// Chunk body, base64; omitted when the coordinator already holds it
        data: Option<String>,
    },
}

#[derive(Deserialize)]
pub struct DeltaRequest {
    pub node_id: String,
    pub base_signature_digest: String,
    pub operations: Vec<DeltaOpRequest>,
    pub content_hash: String,
    pub vector_clock: Option<VectorClock>,
}

#[derive(Deserialize)]
pub struct RestoreRequest {
    pub version_id: String,
    pub node_id: String,
}

#[derive(Deserialize)]
pub struct ResolveRequest {
    pub winner_version_id: String,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct DiffQuery {
    pub from: String,
    pub to: String,
}

#[derive(Deserialize)]
pub struct ConflictQuery {
    #[serde(default)]
    pub include_resolved: bool,
}

fn decode_base64(field: &str, value: &str) -> AppResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| AppError::InvalidRequest(format!("{} is not valid base64: {}", field, e)))
}

fn version_json(version: &FileVersion) -> Value {
    json!({
        "file_id": version.file_id,
        "version_id": version.version_id,
        "parent_version_ids": version.parent_version_ids,
        "vector_clock": version.vector_clock,
        "size": version.size,
        "content_hash": version.content_hash,
        "created_by_node": version.created_by_node,
        "created_at": version.created_at,
        "chunk_count": version.chunk_list.len(),
    })
}

// Handlers

pub async fn register_node_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Result<Json<Value>, AppError> {
    let node = state.coordinator.register_node(req).await?;
    Ok(Json(json!({ "node": node })))
}

pub async fn list_nodes_handler(State(state): State<AppState>) -> Json<Value> {
    let nodes = state.coordinator.list_nodes().await;
    Json(json!({ "nodes": nodes }))
}

pub async fn remove_node_handler(
    State(state): State<AppState>,
    AxumPath(node_id): AxumPath<String>,
) -> Result<Json<Value>, AppError> {
    let node = state.coordinator.remove_node(&node_id).await?;
    Ok(Json(json!({ "removed": node.node_id })))
}

pub async fn heartbeat_handler(
    State(state): State<AppState>,
    AxumPath(node_id): AxumPath<String>,
) -> Result<Json<Value>, AppError> {
    state.coordinator.heartbeat(&node_id).await?;
    Ok(Json(json!({ "ok": true })))
}

pub async fn list_files_handler(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let mut entries = Vec::new();
    for file in state.coordinator.list_files().await {
        let heads = state.coordinator.file_heads(&file.file_id).await?;
        entries.push(json!({
            "file_id": file.file_id,
            "name": file.name,
            "created_at": file.created_at,
            "heads": heads.iter().map(version_json).collect::<Vec<_>>(),
        }));
    }
    Ok(Json(json!({ "files": entries })))
}

pub async fn file_head_handler(
    State(state): State<AppState>,
    AxumPath(file_id): AxumPath<String>,
) -> Result<Json<Value>, AppError> {
    let head = state.coordinator.primary_head(&file_id).await?;
    let heads = state.coordinator.file_heads(&file_id).await?;
    Ok(Json(json!({
        "head": version_json(&head),
        "head_count": heads.len(),
    })))
}

pub async fn file_chunks_handler(
    State(state): State<AppState>,
    AxumPath(file_id): AxumPath<String>,
) -> Result<Json<Value>, AppError> {
    let signature = state.coordinator.head_signature(&file_id).await?;
    Ok(Json(json!({
        "file_id": file_id,
        "chunk_size": state.coordinator.chunk_size(),
        "signature_digest": crate::infrastructure::DeltaEngine::signature_digest(&signature),
        "signature": signature,
    })))
}

pub async fn upload_handler(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<Value>, AppError> {
    let content = match (&req.content, &req.chunks) {
        (Some(content), _) => decode_base64("content", content)?,
        (None, Some(chunks)) => {
            let mut content = Vec::new();
            let chunk_size = state.coordinator.chunk_size();
            for (i, chunk) in chunks.iter().enumerate() {
                let bytes = decode_base64("chunks", chunk)?;
                if bytes.len() > chunk_size || (bytes.len() < chunk_size && i + 1 != chunks.len())
                {
                    return Err(AppError::InvalidRequest(format!(
                        "chunk {} has size {}, expected the fixed chunk size {}",
                        i,
                        bytes.len(),
                        chunk_size
                    )));
                }
                content.extend_from_slice(&bytes);
            }
            content
        }
        (None, None) => {
            return Err(AppError::InvalidRequest(
                "upload requires content or chunks".into(),
            ))
        }
    };
    crate::coordinator::SyncCoordinator::verify_declared_hash(
        &content,
        req.content_hash.as_deref(),
    )?;

    let file_id = req.file_id.clone().unwrap_or_else(|| req.file_name.clone());
    let outcome = state
        .coordinator
        .upload_file(
            &file_id,
            &req.file_name,
            content,
            &req.node_id,
            req.vector_clock.clone(),
        )
        .await?;

    let delta_metrics = if req.use_delta_sync {
        outcome.delta_metrics
    } else {
        DeltaMetrics {
            chunks_total: outcome.version.chunk_list.len(),
            chunks_copied: 0,
            chunks_inserted: outcome.version.chunk_list.len(),
            bytes_transferred: outcome.version.size,
            bytes_saved: 0,
            compression_ratio: 0.0,
        }
    };

    Ok(Json(json!({
        "version_id": outcome.version.version_id,
        "file_id": outcome.version.file_id,
        "content_hash": outcome.version.content_hash,
        "vector_clock": outcome.version.vector_clock,
        "delta_metrics": delta_metrics,
        "conflict_id": outcome.conflict.as_ref().map(|c| c.conflict_id.clone()),
        "sessions": outcome.session_ids,
    })))
}

pub async fn delta_handler(
    State(state): State<AppState>,
    AxumPath(file_id): AxumPath<String>,
    Json(req): Json<DeltaRequest>,
) -> Result<Json<Value>, AppError> {
    let mut operations = Vec::with_capacity(req.operations.len());
    for op in &req.operations {
        operations.push(match op {
            DeltaOpRequest::Copy {
                from_index,
                count,
                size,
            } => DeltaOp::Copy {
                from_index: *from_index,
                count: count.unwrap_or(1),
                size: *size,
            },
            DeltaOpRequest::Insert {
                index,
                chunk_hash,
                size,
                data,
            } => {
                let bytes = match data {
                    Some(data) => {
                        let bytes = decode_base64("operations.data", data)?;
                        if sha256_hex(&bytes) != *chunk_hash {
                            return Err(AppError::InvalidRequest(format!(
                                "insert bytes for index {} do not hash to {}",
                                index, chunk_hash
                            )));
                        }
                        Some(bytes)
                    }
                    None => None,
                };
                DeltaOp::Insert {
                    index: *index,
                    chunk_hash: chunk_hash.clone(),
                    size: *size,
                    bytes,
                }
            }
        });
    }

    let delta = Delta {
        base_signature_digest: req.base_signature_digest.clone(),
        operations,
    };
    let outcome = state
        .coordinator
        .submit_delta(
            &file_id,
            &delta,
            &req.content_hash,
            &req.node_id,
            req.vector_clock.clone(),
        )
        .await?;

    Ok(Json(json!({
        "version_id": outcome.version.version_id,
        "content_hash": outcome.version.content_hash,
        "vector_clock": outcome.version.vector_clock,
        "delta_metrics": outcome.delta_metrics,
        "conflict_id": outcome.conflict.as_ref().map(|c| c.conflict_id.clone()),
        "sessions": outcome.session_ids,
    })))
}

pub async fn history_handler(
    State(state): State<AppState>,
    AxumPath(file_id): AxumPath<String>,
) -> Result<Json<Value>, AppError> {
    let history = state.coordinator.history(&file_id).await?;
    Ok(Json(json!({
        "file_id": file_id,
        "versions": history.iter().map(version_json).collect::<Vec<_>>(),
    })))
}

pub async fn diff_handler(
    State(state): State<AppState>,
    AxumPath(file_id): AxumPath<String>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<Value>, AppError> {
    let delta = state
        .coordinator
        .diff(&file_id, &query.from, &query.to)
        .await?;
    let metrics = crate::infrastructure::DeltaEngine::metrics(&delta);
    Ok(Json(json!({
        "file_id": file_id,
        "from": query.from,
        "to": query.to,
        "base_signature_digest": delta.base_signature_digest,
        "operation_count": delta.operations.len(),
        "metrics": metrics,
    })))
}

pub async fn restore_handler(
    State(state): State<AppState>,
    AxumPath(file_id): AxumPath<String>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<Value>, AppError> {
    let outcome = state
        .coordinator
        .restore(&file_id, &req.version_id, &req.node_id)
        .await?;
    Ok(Json(json!({
        "version_id": outcome.version.version_id,
        "restored_from": req.version_id,
        "vector_clock": outcome.version.vector_clock,
        "sessions": outcome.session_ids,
    })))
}

pub async fn content_handler(
    State(state): State<AppState>,
    AxumPath(file_id): AxumPath<String>,
) -> Result<Json<Value>, AppError> {
    let content = state.coordinator.content(&file_id).await?;
    Ok(Json(json!({
        "file_id": file_id,
        "size": content.len(),
        "content": base64::engine::general_purpose::STANDARD.encode(&content),
    })))
}

pub async fn conflicts_handler(
    State(state): State<AppState>,
    Query(query): Query<ConflictQuery>,
) -> Json<Value> {
    let conflicts = state.coordinator.conflicts(query.include_resolved).await;
    Json(json!({ "conflicts": conflicts }))
}

pub async fn resolve_conflict_handler(
    State(state): State<AppState>,
    AxumPath(conflict_id): AxumPath<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Value>, AppError> {
    let (conflict, merged) = state
        .coordinator
        .resolve_conflict(&conflict_id, &req.winner_version_id)
        .await?;
    Ok(Json(json!({
        "conflict": conflict,
        "merged_version": version_json(&merged),
    })))
}

pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let events = state
        .coordinator
        .recent_events(query.limit.unwrap_or(50))
        .await;
    Json(json!({ "events": events }))
}

pub async fn causal_order_handler(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let events = state
        .coordinator
        .causal_events(query.limit.unwrap_or(50))
        .await;
    Json(json!({ "events": events }))
}

pub async fn vector_clocks_handler(State(state): State<AppState>) -> Json<Value> {
    let clocks = state.coordinator.vector_clocks().await;
    Json(json!({ "vector_clocks": clocks }))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.coordinator.metrics().await))
}

pub async fn delta_metrics_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.coordinator.delta_metrics().await))
}

// Create unified router
pub fn create_sync_router(state: AppState) -> Router {
    Router::new()
        // Node membership
        .route("/register", post(register_node_handler))
        .route("/nodes", get(list_nodes_handler))
        .route("/nodes/{id}", delete(remove_node_handler))
        .route("/nodes/{id}/heartbeat", post(heartbeat_handler))
        // Files and versions
        .route("/files", get(list_files_handler))
        .route("/files/upload", post(upload_handler))
        .route("/files/{id}", get(file_head_handler))
        .route("/files/{id}/chunks", get(file_chunks_handler))
        .route("/files/{id}/delta", post(delta_handler))
        .route("/files/{id}/diff", get(diff_handler))
        .route("/files/{id}/history", get(history_handler))
        .route("/files/{id}/restore", post(restore_handler))
        .route("/files/{id}/content", get(content_handler))
        // Conflicts
        .route("/conflicts", get(conflicts_handler))
        .route("/conflicts/{id}/resolve", post(resolve_conflict_handler))
        // Observability
        .route("/events", get(events_handler))
        .route("/causal-order", get(causal_order_handler))
        .route("/vector-clocks", get(vector_clocks_handler))
        .route("/metrics", get(metrics_handler))
        .route("/delta-metrics", get(delta_metrics_handler))
        // Push channel
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
