//! Delivery-outcome events: webhook ingestion and analytics

mod analytics;
mod ingest;

pub use analytics::{
    by_category, daily_series, AnalyticsAggregator, AnalyticsQuery, AnalyticsSummary,
    CategoryBucket, DailyBucket, EventCounts, UNCATEGORIZED,
};
pub use ingest::{
    derive_event_id, normalize_event, parse_payload, EventIngestor, IngestError, IngestReport,
    RecordError,
};
