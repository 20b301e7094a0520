//! Persisted data models

use chrono::{DateTime, NaiveDate, Utc};
use partyline_common::types::{
    BatchId, BatchStatus, BatchType, EmailEventType, Priority, SendRequestId, SendStatus,
};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;

/// Celebration configuration row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CelebrationConfig {
    pub instant: Option<DateTime<Utc>>,
    pub timezone: String,
    pub celebrant_email: Option<String>,
    pub celebrant_name: Option<String>,
    pub already_fired: bool,
    pub fired_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Celebration row written on first start
#[derive(Debug, Clone)]
pub struct SeedCelebration {
    pub instant: DateTime<Utc>,
    pub timezone: String,
    pub celebrant_email: String,
    pub celebrant_name: Option<String>,
}

/// A reminder kind claimed by a poll
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TriggerMark {
    pub kind: String,
    pub fired_at: DateTime<Utc>,
}

/// Queued, individually retryable send request
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SendRequest {
    pub id: SendRequestId,
    pub recipient: String,
    pub subject: String,
    pub template_id: String,
    pub template_data: serde_json::Value,
    pub priority: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub provider_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SendRequest {
    /// Get status enum
    pub fn status_enum(&self) -> Option<SendStatus> {
        self.status.parse().ok()
    }

    /// Get priority enum
    pub fn priority_enum(&self) -> Priority {
        self.priority.parse().unwrap_or_default()
    }

    /// Eligible for processing: pending and due
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status_enum() == Some(SendStatus::Pending) && self.scheduled_for <= now
    }
}

/// Create send request input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSendRequest {
    pub recipient: String,
    pub subject: String,
    pub template_id: String,
    pub template_data: serde_json::Value,
    pub priority: Priority,
    pub scheduled_for: DateTime<Utc>,
    pub max_attempts: i32,
}

/// Queue counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub sent: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.sent + self.failed
    }
}

/// Outcome of one recipient within a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientResult {
    pub recipient: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Notification batch, kept as an audit record
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub batch_type: String,
    pub recipients: Json<Vec<String>>,
    pub template_data: serde_json::Value,
    pub status: String,
    pub results: Json<Vec<RecipientResult>>,
    pub created_at: DateTime<Utc>,
    /// Set when processing claims the batch
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Get status enum
    pub fn status_enum(&self) -> Option<BatchStatus> {
        self.status.parse().ok()
    }

    /// Get type enum
    pub fn type_enum(&self) -> Option<BatchType> {
        self.batch_type.parse().ok()
    }

    pub fn succeeded(&self) -> usize {
        self.results.0.iter().filter(|r| r.success).count()
    }

    /// Recipients whose delivery failed
    pub fn failed_recipients(&self) -> Vec<&str> {
        self.results
            .0
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.recipient.as_str())
            .collect()
    }
}

/// Create batch input
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub batch_type: BatchType,
    pub recipients: Vec<String>,
    pub template_data: serde_json::Value,
}

/// Immutable delivery outcome event
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct EmailEvent {
    pub event_id: String,
    pub event_type: String,
    pub provider_message_id: Option<String>,
    pub recipient: String,
    pub occurred_at: DateTime<Utc>,
    pub category: String,
    pub custom_variables: serde_json::Value,
    pub bounce_category: Option<String>,
    pub response_code: Option<String>,
    pub user_agent: Option<String>,
    pub clicked_url: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl EmailEvent {
    /// Get event type enum
    pub fn type_enum(&self) -> Option<EmailEventType> {
        self.event_type.parse().ok()
    }
}

/// Event query filter
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub category: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn matches(&self, event: &EmailEvent) -> bool {
        self.category
            .as_deref()
            .map_or(true, |c| event.category == c)
            && self.start.map_or(true, |s| event.occurred_at >= s)
            && self.end.map_or(true, |e| event.occurred_at < e)
    }
}

/// Number of events of one type
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct TypeCount {
    pub event_type: String,
    pub count: i64,
}

/// Number of events of one type on one UTC date
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DailyCount {
    pub day: NaiveDate,
    pub event_type: String,
    pub count: i64,
}

/// Number of events of one type under one category label
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CategoryCount {
    pub category: String,
    pub event_type: String,
    pub count: i64,
}
