//! Batch Dispatcher - immediate render + send of one logical notification

use crate::delivery::Deliverer;
use chrono::{DateTime, Duration, Utc};
use partyline_common::config::DispatchConfig;
use partyline_common::types::{is_valid_email, normalize_address, BatchId, BatchStatus, BatchType};
use partyline_storage::models::{Batch, NewBatch, RecipientResult};
use partyline_storage::Store;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Upper bound for the audit view
pub const MAX_RECENT_BATCHES: usize = 100;

/// Batch creation and processing errors
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Batch has no recipients")]
    EmptyRecipients,

    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),

    #[error("Template data must be a JSON object")]
    InvalidData,

    #[error("Batch not found: {0}")]
    NotFound(BatchId),

    #[error("Batch {0} is not pending")]
    NotPending(BatchId),

    #[error(transparent)]
    Store(#[from] partyline_common::Error),
}

impl From<BatchError> for partyline_common::Error {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::Store(inner) => inner,
            BatchError::NotFound(_) => partyline_common::Error::NotFound(e.to_string()),
            BatchError::NotPending(_) => partyline_common::Error::Conflict(e.to_string()),
            other => partyline_common::Error::Validation(other.to_string()),
        }
    }
}

/// Compact view of a finished batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub batch_type: String,
    pub status: String,
    pub recipients: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl From<&Batch> for BatchSummary {
    fn from(batch: &Batch) -> Self {
        let succeeded = batch.succeeded();
        Self {
            batch_id: batch.id,
            batch_type: batch.batch_type.clone(),
            status: batch.status.clone(),
            recipients: batch.recipients.0.len(),
            succeeded,
            failed: batch.results.0.len() - succeeded,
        }
    }
}

/// Sends batches immediately, isolating failures per recipient
pub struct BatchDispatcher {
    store: Store,
    deliverer: Arc<Deliverer>,
    concurrency: usize,
    recent_limit: usize,
    processing_timeout: Duration,
}

impl BatchDispatcher {
    pub fn new(store: Store, deliverer: Arc<Deliverer>, config: &DispatchConfig) -> Self {
        Self {
            store,
            deliverer,
            concurrency: config.concurrency.max(1),
            recent_limit: config.recent_limit.clamp(1, MAX_RECENT_BATCHES),
            processing_timeout: Duration::seconds(config.processing_timeout_secs.max(1)),
        }
    }

    /// Validate, deduplicate and persist a pending batch
    pub async fn create_batch(
        &self,
        batch_type: BatchType,
        recipients: Vec<String>,
        template_data: Value,
        now: DateTime<Utc>,
    ) -> Result<Batch, BatchError> {
        let template_data = match template_data {
            Value::Null => json!({}),
            Value::Object(map) => Value::Object(map),
            _ => return Err(BatchError::InvalidData),
        };

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let address = normalize_address(&recipient);
            if !is_valid_email(&address) {
                return Err(BatchError::InvalidRecipient(recipient));
            }
            if seen.insert(address.clone()) {
                unique.push(address);
            }
        }
        if unique.is_empty() {
            return Err(BatchError::EmptyRecipients);
        }

        let batch = self
            .store
            .batches
            .create(
                NewBatch {
                    batch_type,
                    recipients: unique,
                    template_data,
                },
                now,
            )
            .await?;

        info!(
            batch_id = %batch.id,
            batch_type = %batch.batch_type,
            recipients = batch.recipients.0.len(),
            "Batch created"
        );
        Ok(batch)
    }

    /// Render and send to every recipient of a pending batch.
    ///
    /// One recipient failing never stops the others. The batch ends
    /// `completed` when at least one recipient succeeded, `failed` otherwise.
    /// Nothing is retried here; failed recipients can be requeued.
    pub async fn process_batch(
        &self,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecipientResult>, BatchError> {
        let batch = self
            .store
            .batches
            .get(batch_id)
            .await?
            .ok_or(BatchError::NotFound(batch_id))?;

        if !self.store.batches.claim(batch_id, now).await? {
            return Err(BatchError::NotPending(batch_id));
        }

        let template_id = batch
            .type_enum()
            .map(|t| t.template_id().to_string())
            .unwrap_or_else(|| batch.batch_type.clone());
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(batch.recipients.0.len());

        for recipient in batch.recipients.0.iter().cloned() {
            let semaphore = semaphore.clone();
            let deliverer = self.deliverer.clone();
            let template_id = template_id.clone();
            let data = batch.template_data.clone();
            let metadata = json!({ "batch_id": batch.id, "batch_type": batch.batch_type });

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let outcome = deliverer
                    .deliver(&recipient, &template_id, &data, None, metadata)
                    .await;
                (recipient, outcome)
            });
            handles.push(handle);
        }

        let mut results = Vec::with_capacity(handles.len());
        for (handle, recipient) in handles.into_iter().zip(batch.recipients.0.iter()) {
            let result = match handle.await {
                Ok((recipient, Ok(provider_message_id))) => RecipientResult {
                    recipient,
                    success: true,
                    provider_message_id: Some(provider_message_id),
                    error: None,
                },
                Ok((recipient, Err(e))) => {
                    warn!(batch_id = %batch.id, recipient = %recipient, error = %e, "Recipient delivery failed");
                    RecipientResult {
                        recipient,
                        success: false,
                        provider_message_id: None,
                        error: Some(e.to_string()),
                    }
                }
                Err(e) => {
                    error!(batch_id = %batch.id, recipient = %recipient, "Send task error: {}", e);
                    RecipientResult {
                        recipient: recipient.clone(),
                        success: false,
                        provider_message_id: None,
                        error: Some(format!("send task aborted: {}", e)),
                    }
                }
            };
            results.push(result);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let status = if succeeded > 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Failed
        };

        self.store
            .batches
            .complete(batch.id, status, results.clone(), now)
            .await?;

        info!(
            batch_id = %batch.id,
            batch_type = %batch.batch_type,
            status = %status,
            succeeded,
            failed = results.len() - succeeded,
            "Batch processed"
        );
        Ok(results)
    }

    /// Create and process in one step; returns the finished batch
    pub async fn dispatch(
        &self,
        batch_type: BatchType,
        recipients: Vec<String>,
        template_data: Value,
        now: DateTime<Utc>,
    ) -> Result<Batch, BatchError> {
        let batch = self
            .create_batch(batch_type, recipients, template_data, now)
            .await?;
        self.process_batch(batch.id, now).await?;
        self.get(batch.id).await?.ok_or(BatchError::NotFound(batch.id))
    }

    /// Close batches whose processing never finished.
    ///
    /// Delivery state of their recipients is unknown, so every recipient is
    /// recorded as failed and the batch ends `failed`; `requeue_failed` can
    /// resend them.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<u64, BatchError> {
        let stale = self.store.batches.stale(now - self.processing_timeout).await?;
        let mut recovered = 0;

        for batch in stale {
            let results = batch
                .recipients
                .0
                .iter()
                .map(|recipient| RecipientResult {
                    recipient: recipient.clone(),
                    success: false,
                    provider_message_id: None,
                    error: Some("processing interrupted, delivery state unknown".to_string()),
                })
                .collect();

            if self
                .store
                .batches
                .complete(batch.id, BatchStatus::Failed, results, now)
                .await?
            {
                warn!(
                    batch_id = %batch.id,
                    batch_type = %batch.batch_type,
                    started_at = ?batch.started_at,
                    "Closed interrupted batch"
                );
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    pub async fn get(&self, batch_id: BatchId) -> Result<Option<Batch>, BatchError> {
        Ok(self.store.batches.get(batch_id).await?)
    }

    /// Most recent batches, newest first
    pub async fn recent(&self, limit: Option<usize>) -> Result<Vec<Batch>, BatchError> {
        let limit = limit
            .unwrap_or(self.recent_limit)
            .clamp(1, MAX_RECENT_BATCHES);
        Ok(self.store.batches.recent(limit as i64).await?)
    }
}
