//! Send queue handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use partyline_common::types::{SendRequestId, SendStatus};
use partyline_core::{EnqueueRequest, ProcessOutcome};
use partyline_storage::models::SendRequest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AppState;
use crate::error::ApiError;

/// Query parameters for listing send requests
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<SendStatus>,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub requests: Vec<SendRequest>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub ids: Vec<SendRequestId>,
    #[serde(default)]
    pub reset_attempts: bool,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub retried: u64,
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub older_than_days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub deleted: u64,
    pub older_than_days: i64,
}

#[derive(Debug, Deserialize)]
pub struct ProcessQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
    pub processed: usize,
    pub outcomes: Vec<ProcessOutcome>,
}

/// POST /api/v1/admin/queue
pub async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(input): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<SendRequest>), ApiError> {
    let created = state.queue.enqueue(input, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/v1/admin/queue
pub async fn list_requests(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let requests = state.queue.list(query.status, query.limit).await?;
    Ok(Json(ListResponse {
        count: requests.len(),
        requests,
    }))
}

/// GET /api/v1/admin/queue/stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    let stats = state.queue.stats().await?;
    Ok(Json(StatsResponse {
        total: stats.total(),
        pending: stats.pending,
        processing: stats.processing,
        sent: stats.sent,
        failed: stats.failed,
    }))
}

/// PUT /api/v1/admin/queue/retry
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Json(input): Json<RetryRequest>,
) -> Result<Json<RetryResponse>, ApiError> {
    if input.ids.is_empty() {
        return Err(ApiError::bad_request("At least one id is required"));
    }
    let retried = state
        .queue
        .retry(&input.ids, input.reset_attempts, Utc::now())
        .await?;
    Ok(Json(RetryResponse { retried }))
}

/// DELETE /api/v1/admin/queue/cleanup
///
/// Defaults to the configured retention period.
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CleanupQuery>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let older_than_days = query
        .older_than_days
        .unwrap_or(state.queue.config().retention_days);
    let deleted = state.queue.cleanup(older_than_days, Utc::now()).await?;
    Ok(Json(CleanupResponse {
        deleted,
        older_than_days,
    }))
}

/// POST /api/v1/admin/queue/process
///
/// Runs one processing pass immediately.
pub async fn process(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProcessQuery>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(state.queue.config().batch_size)
        .max(1);
    let outcomes = state.queue.process_due(Utc::now(), limit).await?;
    Ok(Json(ProcessResponse {
        processed: outcomes.len(),
        outcomes,
    }))
}
