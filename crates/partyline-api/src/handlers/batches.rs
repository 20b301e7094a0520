//! Batch dispatch and audit handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use partyline_common::types::{BatchId, BatchType, Priority};
use partyline_storage::models::{Batch, SendRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::auth::AppState;
use crate::error::ApiError;

/// Request body for an immediate send
#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub batch_type: BatchType,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub template_data: Value,
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct BatchListResponse {
    pub batches: Vec<Batch>,
    pub count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequeueQuery {
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub batch_id: BatchId,
    pub requeued: Vec<SendRequest>,
}

/// POST /api/v1/admin/batches
///
/// Sends right away; failed recipients are not retried.
pub async fn dispatch(
    State(state): State<Arc<AppState>>,
    Json(input): Json<DispatchRequest>,
) -> Result<(StatusCode, Json<Batch>), ApiError> {
    let batch = state
        .dispatcher
        .dispatch(
            input.batch_type,
            input.recipients,
            input.template_data,
            Utc::now(),
        )
        .await?;
    info!(batch_id = %batch.id, "Admin send-now batch dispatched");
    Ok((StatusCode::CREATED, Json(batch)))
}

/// GET /api/v1/admin/batches
pub async fn recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<BatchListResponse>, ApiError> {
    let batches = state.dispatcher.recent(query.limit).await?;
    Ok(Json(BatchListResponse {
        count: batches.len(),
        batches,
    }))
}

/// GET /api/v1/admin/batches/:id
pub async fn get_batch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BatchId>,
) -> Result<Json<Batch>, ApiError> {
    state
        .dispatcher
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Batch not found: {}", id)))
}

/// POST /api/v1/admin/batches/:id/requeue
pub async fn requeue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<BatchId>,
    Query(query): Query<RequeueQuery>,
) -> Result<Json<RequeueResponse>, ApiError> {
    let requeued = state
        .queue
        .requeue_failed(id, query.priority, Utc::now())
        .await?;
    Ok(Json(RequeueResponse {
        batch_id: id,
        requeued,
    }))
}
