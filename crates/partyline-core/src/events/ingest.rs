//! Event Ingestor - persists delivery-outcome webhooks as deduplicated events
//!
//! Accepts our own event shape as well as the Mailjet event format. Each
//! record is handled on its own: a malformed record is logged and counted as
//! rejected, and never blocks the rest of the payload.

use chrono::{DateTime, TimeZone, Utc};
use partyline_common::types::{normalize_address, retention_cutoff, EmailEventType};
use partyline_storage::models::EmailEvent;
use partyline_storage::Store;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Rejected records echoed back in the report
const MAX_REPORTED_ERRORS: usize = 20;

/// Whole-request ingestion failures
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Unparseable payload: {0}")]
    InvalidPayload(String),

    #[error("Retention must be a positive number of days within range")]
    InvalidRetention,

    #[error(transparent)]
    Store(#[from] partyline_common::Error),
}

impl From<IngestError> for partyline_common::Error {
    fn from(e: IngestError) -> Self {
        match e {
            IngestError::Store(inner) => inner,
            other => partyline_common::Error::Validation(other.to_string()),
        }
    }
}

/// One rejected record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordError {
    pub index: usize,
    pub error: String,
}

/// Outcome of one ingest call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub received: usize,
    /// Stored now or already stored earlier
    pub accepted: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RecordError>,
}

impl IngestReport {
    fn reject(&mut self, index: usize, error: String) {
        self.rejected += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(RecordError { index, error });
        }
    }
}

/// Event ingestor
pub struct EventIngestor {
    store: Store,
}

impl EventIngestor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Ingest a raw webhook body: JSON array, single object or NDJSON
    pub async fn ingest(&self, body: &str, now: DateTime<Utc>) -> Result<IngestReport, IngestError> {
        let records = parse_payload(body)?;
        self.ingest_records(records, now).await
    }

    /// Ingest already split records; `Err` entries are lines that did not parse
    pub async fn ingest_records(
        &self,
        records: Vec<Result<Value, String>>,
        now: DateTime<Utc>,
    ) -> Result<IngestReport, IngestError> {
        let mut report = IngestReport {
            received: records.len(),
            ..Default::default()
        };
        let mut store_failures = 0;
        let mut last_store_error = None;

        for (index, record) in records.into_iter().enumerate() {
            let event = match record.and_then(|value| normalize_event(&value, now)) {
                Ok(event) => event,
                Err(e) => {
                    warn!(index, "Rejected malformed event: {}", e);
                    report.reject(index, e);
                    continue;
                }
            };

            match self.store.events.insert(&event).await {
                Ok(true) => {
                    report.accepted += 1;
                    report.inserted += 1;
                }
                Ok(false) => {
                    debug!(event_id = %event.event_id, "Duplicate event ignored");
                    report.accepted += 1;
                    report.duplicates += 1;
                }
                Err(e) => {
                    error!(event_id = %event.event_id, "Failed to store event: {}", e);
                    if e.is_store_failure() {
                        store_failures += 1;
                    }
                    report.reject(index, e.to_string());
                    last_store_error = Some(e);
                }
            }
        }

        if store_failures > 0 && store_failures == report.received {
            if let Some(e) = last_store_error {
                return Err(IngestError::Store(e));
            }
        }

        info!(
            received = report.received,
            inserted = report.inserted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            "Events ingested"
        );
        Ok(report)
    }

    /// Delete events older than `older_than_days`
    pub async fn cleanup(&self, older_than_days: i64, now: DateTime<Utc>) -> Result<u64, IngestError> {
        let cutoff = retention_cutoff(now, older_than_days).ok_or(IngestError::InvalidRetention)?;
        let removed = self.store.events.cleanup(cutoff).await?;
        info!(older_than_days, removed, "Event cleanup completed");
        Ok(removed)
    }
}

/// Split a webhook body into records.
///
/// A body starting with `[` must be a valid JSON array; anything else is
/// read as one object or as newline-delimited JSON.
pub fn parse_payload(body: &str) -> Result<Vec<Result<Value, String>>, IngestError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        let values: Vec<Value> = serde_json::from_str(trimmed)
            .map_err(|e| IngestError::InvalidPayload(e.to_string()))?;
        return Ok(values.into_iter().map(Ok).collect());
    }

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(vec![Ok(value)]);
    }

    Ok(trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_str::<Value>(line).map_err(|e| format!("invalid JSON: {}", e)))
        .collect())
}

/// Map one record to an event, accepting our field names or Mailjet's
pub fn normalize_event(value: &Value, received_at: DateTime<Utc>) -> Result<EmailEvent, String> {
    let fields = value
        .as_object()
        .ok_or_else(|| "event must be a JSON object".to_string())?;

    let event_name = text(fields, &["event_type", "event"])
        .ok_or_else(|| "missing event type".to_string())?;
    let event_type = map_event_type(&event_name, fields)?;

    let recipient = text(fields, &["recipient", "email"])
        .map(|r| normalize_address(&r))
        .filter(|r| !r.is_empty())
        .ok_or_else(|| "missing recipient".to_string())?;

    let occurred_at = timestamp(fields, &["occurred_at", "time"])?
        .ok_or_else(|| "missing occurred_at".to_string())?;

    let provider_message_id = text(fields, &["provider_message_id", "MessageID", "message_id"]);
    let clicked_url = text(fields, &["clicked_url", "url"]).filter(|u| !u.is_empty());

    let event_id = match text(fields, &["event_id"]).filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => derive_event_id(
            event_type,
            occurred_at,
            provider_message_id.as_deref(),
            &recipient,
            clicked_url.as_deref(),
        ),
    };

    Ok(EmailEvent {
        event_id,
        event_type: event_type.to_string(),
        provider_message_id,
        recipient,
        occurred_at,
        category: text(fields, &["category", "customcampaign", "CustomCampaign"]).unwrap_or_default(),
        custom_variables: custom_variables(fields),
        bounce_category: text(fields, &["bounce_category", "error_related_to"]).filter(|s| !s.is_empty()),
        response_code: text(fields, &["response_code", "smtp_reply", "error"]).filter(|s| !s.is_empty()),
        user_agent: text(fields, &["user_agent", "agent"]).filter(|s| !s.is_empty()),
        clicked_url,
        received_at,
    })
}

fn map_event_type(name: &str, fields: &Map<String, Value>) -> Result<EmailEventType, String> {
    let event_type = match name.to_ascii_lowercase().as_str() {
        "delivery" | "delivered" | "sent" => EmailEventType::Delivery,
        "open" | "opened" => EmailEventType::Open,
        "click" | "clicked" => EmailEventType::Click,
        "bounce" | "bounced" => {
            if fields.get("hard_bounce").and_then(Value::as_bool) == Some(false) {
                EmailEventType::SoftBounce
            } else {
                EmailEventType::Bounce
            }
        }
        "soft_bounce" => EmailEventType::SoftBounce,
        "blocked" => EmailEventType::Bounce,
        "spam" | "complaint" => EmailEventType::Spam,
        "unsubscribe" | "unsub" => EmailEventType::Unsubscribe,
        other => return Err(format!("unknown event type: {}", other)),
    };
    Ok(event_type)
}

/// First present key as a string; numbers are stringified
fn text(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match fields.get(*key) {
        Some(Value::String(s)) => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// RFC 3339 string or unix seconds
fn timestamp(fields: &Map<String, Value>, keys: &[&str]) -> Result<Option<DateTime<Utc>>, String> {
    for key in keys {
        match fields.get(*key) {
            Some(Value::String(s)) => {
                return DateTime::parse_from_rfc3339(s.trim())
                    .map(|t| Some(t.with_timezone(&Utc)))
                    .map_err(|e| format!("invalid {}: {}", key, e));
            }
            Some(Value::Number(n)) => {
                let secs = n
                    .as_i64()
                    .ok_or_else(|| format!("invalid {}: {}", key, n))?;
                return Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .map(Some)
                    .ok_or_else(|| format!("invalid {}: {}", key, secs));
            }
            _ => {}
        }
    }
    Ok(None)
}

/// `custom_variables` object, or Mailjet's `Payload` string decoded when it holds JSON
fn custom_variables(fields: &Map<String, Value>) -> Value {
    match fields.get("custom_variables").or_else(|| fields.get("Payload")) {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::String(s)) if !s.is_empty() => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Value::Object(map),
            _ => json!({ "payload": s }),
        },
        _ => json!({}),
    }
}

/// Stable id for providers that do not send one
pub fn derive_event_id(
    event_type: EmailEventType,
    occurred_at: DateTime<Utc>,
    provider_message_id: Option<&str>,
    recipient: &str,
    clicked_url: Option<&str>,
) -> String {
    let key = format!(
        "{}|{}|{}|{}|{}",
        event_type,
        occurred_at.timestamp(),
        provider_message_id.unwrap_or(""),
        recipient,
        clicked_url.unwrap_or("")
    );
    hex::encode(Sha256::digest(key.as_bytes()))
}
