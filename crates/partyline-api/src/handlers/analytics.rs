//! Analytics handlers

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::Utc;
use partyline_core::events::{AnalyticsSummary, CategoryBucket, DailyBucket};
use partyline_core::AnalyticsQuery;
use std::sync::Arc;

use crate::auth::AppState;
use crate::error::ApiError;

/// GET /api/v1/admin/analytics
pub async fn summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsSummary>, ApiError> {
    Ok(Json(state.analytics.summary(&query, Utc::now()).await?))
}

/// GET /api/v1/admin/analytics/daily
pub async fn daily(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<Vec<DailyBucket>>, ApiError> {
    Ok(Json(state.analytics.daily_series(&query, Utc::now()).await?))
}

/// GET /api/v1/admin/analytics/categories
pub async fn categories(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<Vec<CategoryBucket>>, ApiError> {
    Ok(Json(state.analytics.by_category(&query, Utc::now()).await?))
}
