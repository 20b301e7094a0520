//! Mail transport webhook receiver

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use partyline_core::IngestReport;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::auth::{verify_webhook, AppState};
use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

/// POST /api/v1/events/ingest
///
/// Accepts a JSON array, a single object or newline-delimited JSON. Bad
/// records are counted in the report; the response is 200 unless the whole
/// request is unusable.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<IngestReport>, ApiError> {
    if let Some(secret) = state.auth.webhook_secret.as_deref() {
        if !verify_webhook(secret, &headers, query.token.as_deref(), body.as_bytes()) {
            warn!("Rejected webhook delivery with invalid signature");
            return Err(ApiError::unauthorized("Invalid webhook signature"));
        }
    }

    let report = state.ingestor.ingest(&body, Utc::now()).await?;
    Ok(Json(report))
}
