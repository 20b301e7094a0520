//! Countdown trigger handlers

use axum::{extract::State, Json};
use chrono::Utc;
use partyline_core::{PollOutcome, TriggerState};
use std::sync::Arc;
use tracing::warn;

use crate::auth::AppState;
use crate::error::ApiError;

/// POST /api/v1/trigger/poll
///
/// Called by the external scheduler. Safe to call repeatedly and concurrently.
pub async fn poll(State(state): State<Arc<AppState>>) -> Result<Json<PollOutcome>, ApiError> {
    let outcome = state.trigger.poll(Utc::now()).await?;
    Ok(Json(outcome))
}

/// GET /api/v1/admin/trigger
pub async fn get_state(State(state): State<Arc<AppState>>) -> Result<Json<TriggerState>, ApiError> {
    Ok(Json(state.trigger.state(Utc::now()).await?))
}

/// POST /api/v1/admin/trigger/reset
///
/// Re-arms the trigger for testing.
pub async fn reset(State(state): State<Arc<AppState>>) -> Result<Json<TriggerState>, ApiError> {
    let now = Utc::now();
    warn!("Trigger reset requested through the admin API");
    state.trigger.reset(now).await?;
    Ok(Json(state.trigger.state(now).await?))
}
