//! Send request repository

use crate::db::{db_error, DatabasePool};
use crate::models::{NewSendRequest, QueueStats, SendRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use partyline_common::types::{SendRequestId, SendStatus};
use partyline_common::Result;
use sqlx::Row;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Error recorded when a processing claim outlives its lease
pub const LEASE_EXPIRED_ERROR: &str = "processing lease expired";

/// Send request repository trait
#[async_trait]
pub trait SendRequestRepository: Send + Sync {
    async fn create(&self, input: NewSendRequest, now: DateTime<Utc>) -> Result<SendRequest>;

    async fn get(&self, id: SendRequestId) -> Result<Option<SendRequest>>;

    /// Most recent requests first
    async fn list(&self, status: Option<SendStatus>, limit: i64) -> Result<Vec<SendRequest>>;

    /// Eligible requests ordered by priority, then oldest due first
    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<SendRequest>>;

    /// Conditionally move a due request from pending to processing.
    ///
    /// The attempt is counted here. Returns `None` when another worker got
    /// there first or the request is no longer due.
    async fn claim(&self, id: SendRequestId, now: DateTime<Utc>) -> Result<Option<SendRequest>>;

    async fn mark_sent(
        &self,
        id: SendRequestId,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Return a processing request to pending, due again at `next_at`
    async fn mark_retry(
        &self,
        id: SendRequestId,
        error: &str,
        next_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Terminal failure; attempts is raised to at least max_attempts
    async fn mark_failed(&self, id: SendRequestId, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// Force the given non-processing requests back to pending
    async fn retry(
        &self,
        ids: &[SendRequestId],
        reset_attempts: bool,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Release processing claims taken before `claimed_before`
    async fn recover_stale(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    /// Delete sent and failed requests created before `created_before`
    async fn cleanup(&self, created_before: DateTime<Utc>) -> Result<u64>;

    async fn stats(&self) -> Result<QueueStats>;
}

/// Database send request repository
pub struct DbSendRequestRepository {
    pool: DatabasePool,
}

impl DbSendRequestRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SendRequestRepository for DbSendRequestRepository {
    async fn create(&self, input: NewSendRequest, now: DateTime<Utc>) -> Result<SendRequest> {
        sqlx::query_as::<_, SendRequest>(
            r#"
            INSERT INTO send_requests (
                id, recipient, subject, template_id, template_data, priority,
                status, attempts, max_attempts, scheduled_for, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, $7, $8, $9, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&input.recipient)
        .bind(&input.subject)
        .bind(&input.template_id)
        .bind(&input.template_data)
        .bind(input.priority.to_string())
        .bind(input.max_attempts)
        .bind(input.scheduled_for)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn get(&self, id: SendRequestId) -> Result<Option<SendRequest>> {
        sqlx::query_as::<_, SendRequest>("SELECT * FROM send_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn list(&self, status: Option<SendStatus>, limit: i64) -> Result<Vec<SendRequest>> {
        if let Some(status) = status {
            sqlx::query_as::<_, SendRequest>(
                "SELECT * FROM send_requests WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
            )
            .bind(status.to_string())
            .bind(limit)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)
        } else {
            sqlx::query_as::<_, SendRequest>(
                "SELECT * FROM send_requests ORDER BY created_at DESC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)
        }
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<SendRequest>> {
        sqlx::query_as::<_, SendRequest>(
            r#"
            SELECT * FROM send_requests
            WHERE status = 'pending'
              AND scheduled_for <= $1
            ORDER BY
                CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 ELSE 2 END ASC,
                scheduled_for ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn claim(&self, id: SendRequestId, now: DateTime<Utc>) -> Result<Option<SendRequest>> {
        sqlx::query_as::<_, SendRequest>(
            r#"
            UPDATE send_requests SET
                status = 'processing',
                attempts = attempts + 1,
                claimed_at = $2,
                updated_at = $2
            WHERE id = $1 AND status = 'pending' AND scheduled_for <= $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn mark_sent(
        &self,
        id: SendRequestId,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE send_requests SET
                status = 'sent',
                sent_at = $3,
                provider_message_id = $2,
                last_error = NULL,
                claimed_at = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(provider_message_id)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn mark_retry(
        &self,
        id: SendRequestId,
        error: &str,
        next_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE send_requests SET
                status = 'pending',
                last_error = $2,
                scheduled_for = $3,
                claimed_at = NULL,
                updated_at = $4
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_at)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn mark_failed(&self, id: SendRequestId, error: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE send_requests SET
                status = 'failed',
                attempts = GREATEST(attempts, max_attempts),
                last_error = $2,
                claimed_at = NULL,
                updated_at = $3
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn retry(
        &self,
        ids: &[SendRequestId],
        reset_attempts: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE send_requests SET
                status = 'pending',
                attempts = CASE WHEN $2 THEN 0 ELSE attempts END,
                last_error = CASE WHEN $2 THEN NULL ELSE last_error END,
                scheduled_for = $3,
                claimed_at = NULL,
                sent_at = NULL,
                provider_message_id = NULL,
                updated_at = $3
            WHERE id = ANY($1) AND status <> 'processing'
            "#,
        )
        .bind(ids)
        .bind(reset_attempts)
        .bind(now)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE send_requests SET
                status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                last_error = COALESCE(last_error, $3),
                claimed_at = NULL,
                updated_at = $2
            WHERE status = 'processing' AND claimed_at < $1
            "#,
        )
        .bind(claimed_before)
        .bind(now)
        .bind(LEASE_EXPIRED_ERROR)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn cleanup(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM send_requests WHERE status IN ('sent', 'failed') AND created_at < $1",
        )
        .bind(created_before)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'processing') as processing,
                COUNT(*) FILTER (WHERE status = 'sent') as sent,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM send_requests
            "#,
        )
        .fetch_one(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(QueueStats {
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
            processing: row.get::<Option<i64>, _>("processing").unwrap_or(0),
            sent: row.get::<Option<i64>, _>("sent").unwrap_or(0),
            failed: row.get::<Option<i64>, _>("failed").unwrap_or(0),
        })
    }
}

/// In-memory send request repository
#[derive(Default)]
pub struct MemorySendRequestRepository {
    requests: Mutex<HashMap<SendRequestId, SendRequest>>,
}

impl MemorySendRequestRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_status(request: &SendRequest, status: SendStatus) -> bool {
    request.status_enum() == Some(status)
}

#[async_trait]
impl SendRequestRepository for MemorySendRequestRepository {
    async fn create(&self, input: NewSendRequest, now: DateTime<Utc>) -> Result<SendRequest> {
        let request = SendRequest {
            id: Uuid::now_v7(),
            recipient: input.recipient,
            subject: input.subject,
            template_id: input.template_id,
            template_data: input.template_data,
            priority: input.priority.to_string(),
            status: SendStatus::Pending.to_string(),
            attempts: 0,
            max_attempts: input.max_attempts,
            scheduled_for: input.scheduled_for,
            claimed_at: None,
            sent_at: None,
            last_error: None,
            provider_message_id: None,
            created_at: now,
            updated_at: now,
        };
        self.requests
            .lock()
            .await
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn get(&self, id: SendRequestId) -> Result<Option<SendRequest>> {
        Ok(self.requests.lock().await.get(&id).cloned())
    }

    async fn list(&self, status: Option<SendStatus>, limit: i64) -> Result<Vec<SendRequest>> {
        let mut requests: Vec<SendRequest> = self
            .requests
            .lock()
            .await
            .values()
            .filter(|r| status.map_or(true, |s| is_status(r, s)))
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        requests.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(requests)
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<SendRequest>> {
        let mut due: Vec<SendRequest> = self
            .requests
            .lock()
            .await
            .values()
            .filter(|r| r.is_eligible(now))
            .cloned()
            .collect();
        due.sort_by_key(|r| (r.priority_enum().rank(), r.scheduled_for, r.id));
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn claim(&self, id: SendRequestId, now: DateTime<Utc>) -> Result<Option<SendRequest>> {
        let mut requests = self.requests.lock().await;
        match requests.get_mut(&id) {
            Some(request) if request.is_eligible(now) => {
                request.status = SendStatus::Processing.to_string();
                request.attempts += 1;
                request.claimed_at = Some(now);
                request.updated_at = now;
                Ok(Some(request.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_sent(
        &self,
        id: SendRequestId,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut requests = self.requests.lock().await;
        if let Some(request) = requests
            .get_mut(&id)
            .filter(|r| is_status(r, SendStatus::Processing))
        {
            request.status = SendStatus::Sent.to_string();
            request.sent_at = Some(now);
            request.provider_message_id = Some(provider_message_id.to_string());
            request.last_error = None;
            request.claimed_at = None;
            request.updated_at = now;
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: SendRequestId,
        error: &str,
        next_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut requests = self.requests.lock().await;
        if let Some(request) = requests
            .get_mut(&id)
            .filter(|r| is_status(r, SendStatus::Processing))
        {
            request.status = SendStatus::Pending.to_string();
            request.last_error = Some(error.to_string());
            request.scheduled_for = next_at;
            request.claimed_at = None;
            request.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: SendRequestId, error: &str, now: DateTime<Utc>) -> Result<()> {
        let mut requests = self.requests.lock().await;
        if let Some(request) = requests
            .get_mut(&id)
            .filter(|r| is_status(r, SendStatus::Processing))
        {
            request.status = SendStatus::Failed.to_string();
            request.attempts = request.attempts.max(request.max_attempts);
            request.last_error = Some(error.to_string());
            request.claimed_at = None;
            request.updated_at = now;
        }
        Ok(())
    }

    async fn retry(
        &self,
        ids: &[SendRequestId],
        reset_attempts: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut requests = self.requests.lock().await;
        let mut count = 0;
        for id in ids {
            if let Some(request) = requests
                .get_mut(id)
                .filter(|r| !is_status(r, SendStatus::Processing))
            {
                request.status = SendStatus::Pending.to_string();
                if reset_attempts {
                    request.attempts = 0;
                    request.last_error = None;
                }
                request.scheduled_for = now;
                request.claimed_at = None;
                request.sent_at = None;
                request.provider_message_id = None;
                request.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn recover_stale(&self, claimed_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let mut requests = self.requests.lock().await;
        let mut count = 0;
        for request in requests.values_mut() {
            let stale = is_status(request, SendStatus::Processing)
                && request.claimed_at.map_or(false, |at| at < claimed_before);
            if !stale {
                continue;
            }
            request.status = if request.attempts >= request.max_attempts {
                SendStatus::Failed.to_string()
            } else {
                SendStatus::Pending.to_string()
            };
            if request.last_error.is_none() {
                request.last_error = Some(LEASE_EXPIRED_ERROR.to_string());
            }
            request.claimed_at = None;
            request.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn cleanup(&self, created_before: DateTime<Utc>) -> Result<u64> {
        let mut requests = self.requests.lock().await;
        let before = requests.len();
        requests.retain(|_, r| {
            let finished = is_status(r, SendStatus::Sent) || is_status(r, SendStatus::Failed);
            !(finished && r.created_at < created_before)
        });
        Ok((before - requests.len()) as u64)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let requests = self.requests.lock().await;
        let mut stats = QueueStats::default();
        for request in requests.values() {
            match request.status_enum() {
                Some(SendStatus::Pending) => stats.pending += 1,
                Some(SendStatus::Processing) => stats.processing += 1,
                Some(SendStatus::Sent) => stats.sent += 1,
                Some(SendStatus::Failed) => stats.failed += 1,
                None => {}
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use partyline_common::types::Priority;
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn new_request(
        recipient: &str,
        priority: Priority,
        scheduled_for: DateTime<Utc>,
    ) -> NewSendRequest {
        NewSendRequest {
            recipient: recipient.to_string(),
            subject: String::new(),
            template_id: "generic".to_string(),
            template_data: serde_json::json!({}),
            priority,
            scheduled_for,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn test_list_due_orders_by_priority_then_schedule() {
        let repo = MemorySendRequestRepository::new();
        let now = Utc::now();

        let low = repo
            .create(new_request("low@example.com", Priority::Low, now - Duration::hours(3)), now)
            .await
            .unwrap();
        let normal_late = repo
            .create(new_request("n1@example.com", Priority::Normal, now - Duration::minutes(5)), now)
            .await
            .unwrap();
        let normal_early = repo
            .create(new_request("n2@example.com", Priority::Normal, now - Duration::hours(1)), now)
            .await
            .unwrap();
        let high = repo
            .create(new_request("high@example.com", Priority::High, now), now)
            .await
            .unwrap();
        repo.create(new_request("future@example.com", Priority::High, now + Duration::hours(1)), now)
            .await
            .unwrap();

        let due: Vec<_> = repo
            .list_due(now, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(due, vec![high.id, normal_early.id, normal_late.id, low.id]);

        assert_eq!(repo.list_due(now, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let repo = MemorySendRequestRepository::new();
        let now = Utc::now();
        let request = repo
            .create(new_request("a@example.com", Priority::Normal, now), now)
            .await
            .unwrap();

        let claimed = repo.claim(request.id, now).await.unwrap().unwrap();
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.status, "processing");
        assert!(repo.claim(request.id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_keeps_attempt_invariant() {
        let repo = MemorySendRequestRepository::new();
        let now = Utc::now();
        let request = repo
            .create(new_request("a@example.com", Priority::Normal, now), now)
            .await
            .unwrap();

        repo.claim(request.id, now).await.unwrap();
        repo.mark_failed(request.id, "550 no such user", now).await.unwrap();

        let stored = repo.get(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "failed");
        assert_eq!(stored.attempts, stored.max_attempts);
        assert_eq!(stored.last_error.as_deref(), Some("550 no such user"));
    }

    #[tokio::test]
    async fn test_retry_skips_processing_and_resets() {
        let repo = MemorySendRequestRepository::new();
        let now = Utc::now();
        let failed = repo
            .create(new_request("f@example.com", Priority::Normal, now), now)
            .await
            .unwrap();
        let busy = repo
            .create(new_request("b@example.com", Priority::Normal, now), now)
            .await
            .unwrap();

        repo.claim(failed.id, now).await.unwrap();
        repo.mark_failed(failed.id, "boom", now).await.unwrap();
        repo.claim(busy.id, now).await.unwrap();

        let later = now + Duration::minutes(1);
        let count = repo.retry(&[failed.id, busy.id], true, later).await.unwrap();
        assert_eq!(count, 1);

        let revived = repo.get(failed.id).await.unwrap().unwrap();
        assert_eq!(revived.status, "pending");
        assert_eq!(revived.attempts, 0);
        assert!(revived.last_error.is_none());
        assert_eq!(revived.scheduled_for, later);
        assert_eq!(repo.get(busy.id).await.unwrap().unwrap().status, "processing");
    }

    #[tokio::test]
    async fn test_cleanup_never_touches_live_rows() {
        let repo = MemorySendRequestRepository::new();
        let old = Utc::now() - Duration::days(90);
        let pending = repo
            .create(new_request("p@example.com", Priority::Normal, old), old)
            .await
            .unwrap();
        let processing = repo
            .create(new_request("q@example.com", Priority::Normal, old), old)
            .await
            .unwrap();
        let sent = repo
            .create(new_request("s@example.com", Priority::Normal, old), old)
            .await
            .unwrap();
        repo.claim(processing.id, old).await.unwrap();
        repo.claim(sent.id, old).await.unwrap();
        repo.mark_sent(sent.id, "msg-1", old).await.unwrap();

        let removed = repo.cleanup(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get(pending.id).await.unwrap().is_some());
        assert!(repo.get(processing.id).await.unwrap().is_some());
        assert!(repo.get(sent.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recover_stale_claims() {
        let repo = MemorySendRequestRepository::new();
        let now = Utc::now();
        let request = repo
            .create(new_request("a@example.com", Priority::Normal, now), now)
            .await
            .unwrap();
        repo.claim(request.id, now).await.unwrap();

        assert_eq!(repo.recover_stale(now, now).await.unwrap(), 0);

        let later = now + Duration::minutes(30);
        assert_eq!(repo.recover_stale(later, later).await.unwrap(), 1);

        let stored = repo.get(request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, "pending");
        assert_eq!(stored.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
        assert_eq!(
            repo.stats().await.unwrap(),
            QueueStats {
                pending: 1,
                ..Default::default()
            }
        );
    }
}
