//! Send Queue - durable, individually retryable sends

use crate::delivery::{Deliverer, DeliveryError};
use crate::render::GENERIC_TEMPLATE;
use chrono::{DateTime, Duration, Utc};
use partyline_common::config::QueueConfig;
use partyline_common::types::{
    is_valid_email, normalize_address, retention_cutoff, BatchId, Priority, SendRequestId, SendStatus,
};
use partyline_storage::models::{NewSendRequest, QueueStats, SendRequest};
use partyline_storage::Store;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Upper bound for listing endpoints
pub const MAX_LIST_LIMIT: i64 = 500;

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Template data must be a JSON object")]
    InvalidData,

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("Retention must be a positive number of days within range")]
    InvalidRetention,

    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error(transparent)]
    Store(#[from] partyline_common::Error),
}

impl From<QueueError> for partyline_common::Error {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Store(inner) => inner,
            QueueError::BatchNotFound(_) => partyline_common::Error::NotFound(e.to_string()),
            other => partyline_common::Error::Validation(other.to_string()),
        }
    }
}

/// Enqueue input
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnqueueRequest {
    pub recipient: String,
    /// Replaces the rendered subject when non-empty
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_data: Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

/// Result of one request within a processing pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessOutcome {
    pub id: SendRequestId,
    pub recipient: String,
    pub status: SendStatus,
    pub attempts: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Send queue manager
pub struct SendQueue {
    store: Store,
    deliverer: Arc<Deliverer>,
    config: QueueConfig,
}

impl SendQueue {
    pub fn new(store: Store, deliverer: Arc<Deliverer>, config: QueueConfig) -> Self {
        Self {
            store,
            deliverer,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Validate and persist a pending send request
    pub async fn enqueue(
        &self,
        request: EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<SendRequest, QueueError> {
        let recipient = normalize_address(&request.recipient);
        if !is_valid_email(&recipient) {
            return Err(QueueError::InvalidRecipient(request.recipient));
        }

        let template_id = request
            .template_id
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| GENERIC_TEMPLATE.to_string());
        if !self.deliverer.renderer().has_template(&template_id) {
            return Err(QueueError::UnknownTemplate(template_id));
        }

        let template_data = match request.template_data {
            Value::Null => json!({}),
            Value::Object(map) => Value::Object(map),
            _ => return Err(QueueError::InvalidData),
        };

        let max_attempts = request.max_attempts.unwrap_or(self.config.max_attempts);
        if max_attempts < 1 {
            return Err(QueueError::InvalidMaxAttempts);
        }

        let created = self
            .store
            .send_requests
            .create(
                NewSendRequest {
                    recipient,
                    subject: request.subject.unwrap_or_default(),
                    template_id,
                    template_data,
                    priority: request.priority,
                    scheduled_for: request.scheduled_for.unwrap_or(now),
                    max_attempts,
                },
                now,
            )
            .await?;

        info!(
            id = %created.id,
            recipient = %created.recipient,
            priority = %created.priority,
            scheduled_for = %created.scheduled_for,
            "Send request enqueued"
        );
        Ok(created)
    }

    /// Process up to `limit` eligible requests.
    ///
    /// Requests are taken highest priority first, then oldest due first.
    /// Each one is claimed with a conditional write; a request claimed by
    /// another worker in the meantime is skipped.
    pub async fn process_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ProcessOutcome>, QueueError> {
        let due = self
            .store
            .send_requests
            .list_due(now, limit as i64)
            .await?;

        if due.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Processing {} due send requests", due.len());

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handles = Vec::new();

        for request in due {
            let claimed = match self.store.send_requests.claim(request.id, now).await? {
                Some(claimed) => claimed,
                None => {
                    debug!(id = %request.id, "Send request already claimed, skipping");
                    continue;
                }
            };

            let permit = semaphore.clone().acquire_owned().await;
            let store = self.store.clone();
            let deliverer = self.deliverer.clone();
            let backoff = self.backoff(claimed.attempts);

            let handle = tokio::spawn(async move {
                let result = deliverer
                    .deliver(
                        &claimed.recipient,
                        &claimed.template_id,
                        &claimed.template_data,
                        Some(claimed.subject.as_str()),
                        json!({ "send_request_id": claimed.id }),
                    )
                    .await;
                let outcome = Self::handle_result(&store, &claimed, result, now, backoff).await;
                drop(permit);
                outcome
            });
            handles.push(handle);
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        let mut store_failure = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => {
                    error!("Failed to record send outcome: {}", e);
                    store_failure.get_or_insert(e);
                }
                Err(e) => error!("Task error: {}", e),
            }
        }

        if let Some(e) = store_failure {
            return Err(QueueError::Store(e));
        }
        Ok(outcomes)
    }

    /// Record the result of a delivery attempt
    async fn handle_result(
        store: &Store,
        request: &SendRequest,
        result: Result<String, DeliveryError>,
        now: DateTime<Utc>,
        backoff: Duration,
    ) -> partyline_common::Result<ProcessOutcome> {
        let mut outcome = ProcessOutcome {
            id: request.id,
            recipient: request.recipient.clone(),
            status: SendStatus::Sent,
            attempts: request.attempts,
            provider_message_id: None,
            error: None,
            next_attempt_at: None,
        };

        match result {
            Ok(provider_message_id) => {
                info!(id = %request.id, provider_id = %provider_message_id, "Send request sent");
                store
                    .send_requests
                    .mark_sent(request.id, &provider_message_id, now)
                    .await?;
                outcome.provider_message_id = Some(provider_message_id);
            }

            Err(e) if e.is_permanent() || request.attempts >= request.max_attempts => {
                let error = e.to_string();
                error!(
                    id = %request.id,
                    attempts = request.attempts,
                    permanent = e.is_permanent(),
                    "Send request failed: {}",
                    error
                );
                store.send_requests.mark_failed(request.id, &error, now).await?;
                outcome.status = SendStatus::Failed;
                outcome.attempts = request.attempts.max(request.max_attempts);
                outcome.error = Some(error);
            }

            Err(e) => {
                let error = e.to_string();
                let next_at = now + backoff;
                warn!(
                    id = %request.id,
                    attempts = request.attempts,
                    next_attempt_at = %next_at,
                    "Send request attempt failed: {}",
                    error
                );
                store
                    .send_requests
                    .mark_retry(request.id, &error, next_at, now)
                    .await?;
                outcome.status = SendStatus::Pending;
                outcome.error = Some(error);
                outcome.next_attempt_at = Some(next_at);
            }
        }

        Ok(outcome)
    }

    /// Delay before the next attempt after `attempts` tries.
    ///
    /// Doubles from `backoff_base_secs` and is capped at `backoff_max_secs`.
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
        let secs = self
            .config
            .backoff_base_secs
            .max(0)
            .saturating_mul(2_i64.saturating_pow(exponent))
            .min(self.config.backoff_max_secs.max(0));
        Duration::seconds(secs)
    }

    /// Force the given requests back to pending; processing rows are left alone
    pub async fn retry(
        &self,
        ids: &[SendRequestId],
        reset_attempts: bool,
        now: DateTime<Utc>,
    ) -> Result<u64, QueueError> {
        let count = self
            .store
            .send_requests
            .retry(ids, reset_attempts, now)
            .await?;
        info!(requested = ids.len(), retried = count, reset_attempts, "Send requests retried");
        Ok(count)
    }

    /// Delete sent and failed requests older than `older_than_days`
    pub async fn cleanup(&self, older_than_days: i64, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let cutoff = retention_cutoff(now, older_than_days).ok_or(QueueError::InvalidRetention)?;
        let removed = self.store.send_requests.cleanup(cutoff).await?;
        info!(older_than_days, removed, "Send queue cleanup completed");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.send_requests.stats().await?)
    }

    pub async fn list(
        &self,
        status: Option<SendStatus>,
        limit: i64,
    ) -> Result<Vec<SendRequest>, QueueError> {
        Ok(self
            .store
            .send_requests
            .list(status, limit.clamp(1, MAX_LIST_LIMIT))
            .await?)
    }

    pub async fn get(&self, id: SendRequestId) -> Result<Option<SendRequest>, QueueError> {
        Ok(self.store.send_requests.get(id).await?)
    }

    /// Release processing claims older than the configured lease
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<u64, QueueError> {
        let lease = Duration::seconds(self.config.processing_timeout_secs.max(1));
        let recovered = self
            .store
            .send_requests
            .recover_stale(now - lease, now)
            .await?;
        if recovered > 0 {
            warn!(recovered, "Recovered abandoned processing claims");
        }
        Ok(recovered)
    }

    /// Enqueue every failed recipient of a batch with the batch's template and data
    pub async fn requeue_failed(
        &self,
        batch_id: BatchId,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Result<Vec<SendRequest>, QueueError> {
        let batch = self
            .store
            .batches
            .get(batch_id)
            .await?
            .ok_or(QueueError::BatchNotFound(batch_id))?;

        let template_id = batch
            .type_enum()
            .map(|t| t.template_id().to_string())
            .unwrap_or_else(|| batch.batch_type.clone());

        let mut requeued = Vec::new();
        for recipient in batch.failed_recipients() {
            let request = self
                .enqueue(
                    EnqueueRequest {
                        recipient: recipient.to_string(),
                        template_id: Some(template_id.clone()),
                        template_data: batch.template_data.clone(),
                        priority,
                        ..Default::default()
                    },
                    now,
                )
                .await?;
            requeued.push(request);
        }

        info!(batch_id = %batch_id, requeued = requeued.len(), "Failed batch recipients requeued");
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deliverer, FakeTransport};
    use pretty_assertions::assert_eq;

    fn queue(transport: Arc<FakeTransport>) -> Arc<SendQueue> {
        Arc::new(SendQueue::new(
            Store::memory(),
            deliverer(transport),
            QueueConfig::default(),
        ))
    }

    fn request(recipient: &str, priority: Priority) -> EnqueueRequest {
        EnqueueRequest {
            recipient: recipient.to_string(),
            template_data: json!({ "message": "hello" }),
            priority,
            ..Default::default()
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let queue = queue(Arc::new(FakeTransport::new()));
        assert_eq!(queue.backoff(1), Duration::minutes(1));
        assert_eq!(queue.backoff(2), Duration::minutes(2));
        assert_eq!(queue.backoff(3), Duration::minutes(4));
        assert_eq!(queue.backoff(4), Duration::minutes(8));
        assert_eq!(queue.backoff(20), Duration::hours(4));
    }

    #[tokio::test]
    async fn test_enqueue_validates() {
        let queue = queue(Arc::new(FakeTransport::new()));
        let now = Utc::now();

        let created = queue.enqueue(request(" Ann@Example.com", Priority::High), now).await.unwrap();
        assert_eq!(created.recipient, "ann@example.com");
        assert_eq!(created.template_id, GENERIC_TEMPLATE);
        assert_eq!(created.status, "pending");
        assert_eq!(created.attempts, 0);
        assert_eq!(created.max_attempts, 3);
        assert_eq!(created.scheduled_for, now);

        let err = queue.enqueue(request("nope", Priority::Normal), now).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidRecipient(_)));

        let mut unknown = request("a@example.com", Priority::Normal);
        unknown.template_id = Some("cake".to_string());
        let err = queue.enqueue(unknown, now).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownTemplate(_)));

        let mut zero = request("a@example.com", Priority::Normal);
        zero.max_attempts = Some(0);
        let err = queue.enqueue(zero, now).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidMaxAttempts));
    }

    #[tokio::test]
    async fn test_process_due_sends_in_priority_order() {
        let transport = Arc::new(FakeTransport::new());
        let queue = queue(transport.clone());
        let now = Utc::now();

        queue.enqueue(request("low@example.com", Priority::Low), now).await.unwrap();
        queue.enqueue(request("high@example.com", Priority::High), now).await.unwrap();
        let mut later = request("later@example.com", Priority::High);
        later.scheduled_for = Some(now + Duration::hours(1));
        queue.enqueue(later, now).await.unwrap();

        let outcomes = queue.process_due(now, 1).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].recipient, "high@example.com");
        assert_eq!(outcomes[0].status, SendStatus::Sent);

        let outcomes = queue.process_due(now, 10).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].recipient, "low@example.com");

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.pending, 1);

        let sent = queue.list(Some(SendStatus::Sent), 10).await.unwrap();
        assert!(sent.iter().all(|r| r.sent_at.is_some() && r.last_error.is_none()));
    }

    #[tokio::test]
    async fn test_retry_bound_with_backoff() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_transient("flaky@example.com").await;
        let queue = queue(transport.clone());
        let t0 = Utc::now();

        let created = queue.enqueue(request("flaky@example.com", Priority::Normal), t0).await.unwrap();

        let first = queue.process_due(t0, 10).await.unwrap();
        assert_eq!(first[0].status, SendStatus::Pending);
        assert_eq!(first[0].next_attempt_at, Some(t0 + Duration::minutes(1)));

        // Not eligible again before the backoff elapses
        assert!(queue.process_due(t0 + Duration::seconds(30), 10).await.unwrap().is_empty());

        let t1 = t0 + Duration::minutes(1);
        let second = queue.process_due(t1, 10).await.unwrap();
        assert_eq!(second[0].next_attempt_at, Some(t1 + Duration::minutes(2)));

        let t2 = t1 + Duration::minutes(2);
        let third = queue.process_due(t2, 10).await.unwrap();
        assert_eq!(third[0].status, SendStatus::Failed);

        let stored = queue.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.attempts, 3);
        assert!(stored.last_error.is_some());

        assert!(queue.process_due(t2 + Duration::days(1), 10).await.unwrap().is_empty());
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_permanent("gone@example.com").await;
        let queue = queue(transport.clone());
        let now = Utc::now();

        let created = queue.enqueue(request("gone@example.com", Priority::Normal), now).await.unwrap();
        let outcomes = queue.process_due(now, 10).await.unwrap();
        assert_eq!(outcomes[0].status, SendStatus::Failed);

        let stored = queue.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, stored.max_attempts);
        assert_eq!(transport.attempts(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_workers_never_double_send() {
        let transport = Arc::new(FakeTransport::new());
        let queue = queue(transport.clone());
        let now = Utc::now();

        for i in 0..20 {
            queue
                .enqueue(request(&format!("guest{}@example.com", i), Priority::Normal), now)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move { queue.process_due(now, 50).await.unwrap() }));
        }

        let mut processed = 0;
        for handle in handles {
            processed += handle.await.unwrap().len();
        }

        assert_eq!(processed, 20);
        assert_eq!(transport.attempts(), 20);
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.sent, 20);
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_manual_retry_resurrects_failed_send() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_permanent("a@example.com").await;
        let queue = queue(transport);
        let now = Utc::now();

        let created = queue.enqueue(request("a@example.com", Priority::Normal), now).await.unwrap();
        queue.process_due(now, 10).await.unwrap();

        assert_eq!(queue.retry(&[created.id], true, now).await.unwrap(), 1);
        let stored = queue.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "pending");
        assert_eq!(stored.attempts, 0);
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_respects_retention() {
        let queue = queue(Arc::new(FakeTransport::new()));
        let old = Utc::now() - Duration::days(40);

        queue.enqueue(request("a@example.com", Priority::Normal), old).await.unwrap();
        queue.enqueue(request("b@example.com", Priority::Normal), old).await.unwrap();
        queue.process_due(old, 1).await.unwrap();

        assert!(matches!(
            queue.cleanup(0, Utc::now()).await.unwrap_err(),
            QueueError::InvalidRetention
        ));
        assert_eq!(queue.cleanup(30, Utc::now()).await.unwrap(), 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total(), 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_cleanup_rejects_out_of_range_retention() {
        let queue = queue(Arc::new(FakeTransport::new()));
        let now = Utc::now();
        queue.enqueue(request("a@example.com", Priority::Normal), now).await.unwrap();

        for days in [100_000_000, i64::MAX] {
            assert!(matches!(
                queue.cleanup(days, now).await.unwrap_err(),
                QueueError::InvalidRetention
            ));
        }
        assert_eq!(queue.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_recover_stale_claims() {
        let store = Store::memory();
        let queue = SendQueue::new(
            store.clone(),
            deliverer(Arc::new(FakeTransport::new())),
            QueueConfig::default(),
        );
        let now = Utc::now();
        let created = queue.enqueue(request("a@example.com", Priority::Normal), now).await.unwrap();

        // A worker claimed it and vanished
        store.send_requests.claim(created.id, now).await.unwrap();

        assert_eq!(queue.recover_stale(now + Duration::minutes(5)).await.unwrap(), 0);
        assert_eq!(queue.recover_stale(now + Duration::minutes(16)).await.unwrap(), 1);
        assert_eq!(queue.get(created.id).await.unwrap().unwrap().status, "pending");
    }
}
