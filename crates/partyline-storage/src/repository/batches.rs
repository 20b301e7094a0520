//! Batch repository

use crate::db::{db_error, DatabasePool};
use crate::models::{Batch, NewBatch, RecipientResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use partyline_common::types::{BatchId, BatchStatus};
use partyline_common::Result;
use sqlx::types::Json;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Batch repository trait
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create(&self, input: NewBatch, now: DateTime<Utc>) -> Result<Batch>;

    async fn get(&self, id: BatchId) -> Result<Option<Batch>>;

    /// Move a batch from pending to processing; returns whether this call won
    async fn claim(&self, id: BatchId, now: DateTime<Utc>) -> Result<bool>;

    /// Batches still processing that were claimed before `started_before`
    async fn stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Batch>>;

    /// Record the terminal status and per-recipient results of a processing
    /// batch; returns false when the batch was already finished
    async fn complete(
        &self,
        id: BatchId,
        status: BatchStatus,
        results: Vec<RecipientResult>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Newest batches first
    async fn recent(&self, limit: i64) -> Result<Vec<Batch>>;
}

/// Database batch repository
pub struct DbBatchRepository {
    pool: DatabasePool,
}

impl DbBatchRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchRepository for DbBatchRepository {
    async fn create(&self, input: NewBatch, now: DateTime<Utc>) -> Result<Batch> {
        sqlx::query_as::<_, Batch>(
            r#"
            INSERT INTO batches (id, batch_type, recipients, template_data, status, results, created_at)
            VALUES ($1, $2, $3, $4, 'pending', '[]'::jsonb, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.batch_type.to_string())
        .bind(Json(&input.recipients))
        .bind(&input.template_data)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn get(&self, id: BatchId) -> Result<Option<Batch>> {
        sqlx::query_as::<_, Batch>("SELECT * FROM batches WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn claim(&self, id: BatchId, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET status = 'processing', started_at = $2
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Batch>> {
        sqlx::query_as::<_, Batch>(
            r#"
            SELECT * FROM batches
            WHERE status = 'processing' AND COALESCE(started_at, created_at) < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(started_before)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn complete(
        &self,
        id: BatchId,
        status: BatchStatus,
        results: Vec<RecipientResult>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET
                status = $2,
                results = $3,
                completed_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(Json(&results))
        .bind(completed_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn recent(&self, limit: i64) -> Result<Vec<Batch>> {
        sqlx::query_as::<_, Batch>("SELECT * FROM batches ORDER BY created_at DESC, id DESC LIMIT $1")
            .bind(limit)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)
    }
}

/// In-memory batch repository
#[derive(Default)]
pub struct MemoryBatchRepository {
    batches: Mutex<HashMap<BatchId, Batch>>,
}

impl MemoryBatchRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchRepository for MemoryBatchRepository {
    async fn create(&self, input: NewBatch, now: DateTime<Utc>) -> Result<Batch> {
        let batch = Batch {
            id: Uuid::now_v7(),
            batch_type: input.batch_type.to_string(),
            recipients: Json(input.recipients),
            template_data: input.template_data,
            status: BatchStatus::Pending.to_string(),
            results: Json(Vec::new()),
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.batches.lock().await.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn get(&self, id: BatchId) -> Result<Option<Batch>> {
        Ok(self.batches.lock().await.get(&id).cloned())
    }

    async fn claim(&self, id: BatchId, now: DateTime<Utc>) -> Result<bool> {
        let mut batches = self.batches.lock().await;
        match batches.get_mut(&id) {
            Some(batch) if batch.status_enum() == Some(BatchStatus::Pending) => {
                batch.status = BatchStatus::Processing.to_string();
                batch.started_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stale(&self, started_before: DateTime<Utc>) -> Result<Vec<Batch>> {
        let mut stale: Vec<Batch> = self
            .batches
            .lock()
            .await
            .values()
            .filter(|b| {
                b.status_enum() == Some(BatchStatus::Processing)
                    && b.started_at.unwrap_or(b.created_at) < started_before
            })
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(stale)
    }

    async fn complete(
        &self,
        id: BatchId,
        status: BatchStatus,
        results: Vec<RecipientResult>,
        completed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut batches = self.batches.lock().await;
        match batches
            .get_mut(&id)
            .filter(|b| b.status_enum() == Some(BatchStatus::Processing))
        {
            Some(batch) => {
                batch.status = status.to_string();
                batch.results = Json(results);
                batch.completed_at = Some(completed_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recent(&self, limit: i64) -> Result<Vec<Batch>> {
        let mut batches: Vec<Batch> = self.batches.lock().await.values().cloned().collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        batches.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use partyline_common::types::BatchType;
    use pretty_assertions::assert_eq;

    fn new_batch(recipients: &[&str]) -> NewBatch {
        NewBatch {
            batch_type: BatchType::ContributorNotification,
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            template_data: serde_json::json!({ "celebrant_name": "Sam" }),
        }
    }

    #[tokio::test]
    async fn test_batch_lifecycle() {
        let repo = MemoryBatchRepository::new();
        let now = Utc::now();
        let batch = repo
            .create(new_batch(&["a@example.com", "b@example.com"]), now)
            .await
            .unwrap();
        assert_eq!(batch.status, "pending");

        assert!(repo.claim(batch.id, now).await.unwrap());
        assert!(!repo.claim(batch.id, now).await.unwrap());

        let results = vec![
            RecipientResult {
                recipient: "a@example.com".to_string(),
                success: true,
                provider_message_id: Some("m-1".to_string()),
                error: None,
            },
            RecipientResult {
                recipient: "b@example.com".to_string(),
                success: false,
                provider_message_id: None,
                error: Some("mailbox full".to_string()),
            },
        ];
        assert!(repo
            .complete(batch.id, BatchStatus::Completed, results.clone(), now)
            .await
            .unwrap());
        assert!(!repo
            .complete(batch.id, BatchStatus::Failed, results, now)
            .await
            .unwrap());

        let stored = repo.get(batch.id).await.unwrap().unwrap();
        assert_eq!(stored.status_enum(), Some(BatchStatus::Completed));
        assert_eq!(stored.succeeded(), 1);
        assert_eq!(stored.failed_recipients(), vec!["b@example.com"]);
        assert_eq!(stored.completed_at, Some(now));
    }

    #[tokio::test]
    async fn test_recent_is_newest_first() {
        let repo = MemoryBatchRepository::new();
        let now = Utc::now();
        let older = repo
            .create(new_batch(&["a@example.com"]), now - Duration::hours(1))
            .await
            .unwrap();
        let newer = repo.create(new_batch(&["b@example.com"]), now).await.unwrap();

        let recent: Vec<_> = repo
            .recent(10)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(recent, vec![newer.id, older.id]);
        assert_eq!(repo.recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_lists_old_processing_batches() {
        let repo = MemoryBatchRepository::new();
        let now = Utc::now();
        let stuck = repo.create(new_batch(&["a@example.com"]), now).await.unwrap();
        let fresh = repo.create(new_batch(&["b@example.com"]), now).await.unwrap();
        repo.create(new_batch(&["c@example.com"]), now).await.unwrap();

        repo.claim(stuck.id, now - Duration::hours(1)).await.unwrap();
        repo.claim(fresh.id, now).await.unwrap();

        let stale: Vec<_> = repo
            .stale(now - Duration::minutes(15))
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(stale, vec![stuck.id]);
    }
}
