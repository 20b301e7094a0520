//! Email event repository

use crate::db::{db_error, DatabasePool};
use crate::models::{CategoryCount, DailyCount, EmailEvent, EventFilter, TypeCount};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use partyline_common::Result;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Email event repository trait
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert unless an event with the same id exists; returns whether it was inserted
    async fn insert(&self, event: &EmailEvent) -> Result<bool>;

    /// Events matching the filter, oldest first
    async fn list(&self, filter: &EventFilter) -> Result<Vec<EmailEvent>>;

    /// Matching events counted per type
    async fn count_by_type(&self, filter: &EventFilter) -> Result<Vec<TypeCount>>;

    /// Matching events counted per UTC date and type, oldest date first
    async fn count_by_day(&self, filter: &EventFilter) -> Result<Vec<DailyCount>>;

    /// Matching events counted per category and type, sorted by category
    async fn count_by_category(&self, filter: &EventFilter) -> Result<Vec<CategoryCount>>;

    /// Delete events that occurred before `before`
    async fn cleanup(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Database event repository
pub struct DbEventRepository {
    pool: DatabasePool,
}

impl DbEventRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventRepository for DbEventRepository {
    async fn insert(&self, event: &EmailEvent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_events (
                event_id, event_type, provider_message_id, recipient, occurred_at,
                category, custom_variables, bounce_category, response_code,
                user_agent, clicked_url, received_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.provider_message_id)
        .bind(&event.recipient)
        .bind(event.occurred_at)
        .bind(&event.category)
        .bind(&event.custom_variables)
        .bind(&event.bounce_category)
        .bind(&event.response_code)
        .bind(&event.user_agent)
        .bind(&event.clicked_url)
        .bind(event.received_at)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<EmailEvent>> {
        sqlx::query_as::<_, EmailEvent>(
            r#"
            SELECT * FROM email_events
            WHERE ($1::TEXT IS NULL OR category = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR occurred_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR occurred_at < $3)
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(&filter.category)
        .bind(filter.start)
        .bind(filter.end)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn count_by_type(&self, filter: &EventFilter) -> Result<Vec<TypeCount>> {
        sqlx::query_as::<_, TypeCount>(
            r#"
            SELECT event_type, COUNT(*) AS count FROM email_events
            WHERE ($1::TEXT IS NULL OR category = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR occurred_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR occurred_at < $3)
            GROUP BY event_type
            ORDER BY event_type
            "#,
        )
        .bind(&filter.category)
        .bind(filter.start)
        .bind(filter.end)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn count_by_day(&self, filter: &EventFilter) -> Result<Vec<DailyCount>> {
        sqlx::query_as::<_, DailyCount>(
            r#"
            SELECT (occurred_at AT TIME ZONE 'UTC')::DATE AS day, event_type, COUNT(*) AS count
            FROM email_events
            WHERE ($1::TEXT IS NULL OR category = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR occurred_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR occurred_at < $3)
            GROUP BY day, event_type
            ORDER BY day, event_type
            "#,
        )
        .bind(&filter.category)
        .bind(filter.start)
        .bind(filter.end)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn count_by_category(&self, filter: &EventFilter) -> Result<Vec<CategoryCount>> {
        sqlx::query_as::<_, CategoryCount>(
            r#"
            SELECT category, event_type, COUNT(*) AS count FROM email_events
            WHERE ($1::TEXT IS NULL OR category = $1)
              AND ($2::TIMESTAMPTZ IS NULL OR occurred_at >= $2)
              AND ($3::TIMESTAMPTZ IS NULL OR occurred_at < $3)
            GROUP BY category, event_type
            ORDER BY category, event_type
            "#,
        )
        .bind(&filter.category)
        .bind(filter.start)
        .bind(filter.end)
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM email_events WHERE occurred_at < $1")
            .bind(before)
            .execute(self.pool.pool())
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

/// In-memory event repository
#[derive(Default)]
pub struct MemoryEventRepository {
    events: RwLock<HashMap<String, EmailEvent>>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count matching events per `(key, event_type)`, ordered by key then type
    async fn grouped<K: Ord>(
        &self,
        filter: &EventFilter,
        key: impl Fn(&EmailEvent) -> K,
    ) -> Vec<(K, String, i64)> {
        let mut groups: BTreeMap<(K, String), i64> = BTreeMap::new();
        for event in self.events.read().await.values().filter(|e| filter.matches(e)) {
            *groups.entry((key(event), event.event_type.clone())).or_default() += 1;
        }
        groups
            .into_iter()
            .map(|((key, event_type), count)| (key, event_type, count))
            .collect()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn insert(&self, event: &EmailEvent) -> Result<bool> {
        let mut events = self.events.write().await;
        if events.contains_key(&event.event_id) {
            return Ok(false);
        }
        events.insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn list(&self, filter: &EventFilter) -> Result<Vec<EmailEvent>> {
        let mut events: Vec<EmailEvent> = self
            .events
            .read()
            .await
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        Ok(events)
    }

    async fn count_by_type(&self, filter: &EventFilter) -> Result<Vec<TypeCount>> {
        Ok(self
            .grouped(filter, |_| ())
            .await
            .into_iter()
            .map(|((), event_type, count)| TypeCount { event_type, count })
            .collect())
    }

    async fn count_by_day(&self, filter: &EventFilter) -> Result<Vec<DailyCount>> {
        Ok(self
            .grouped(filter, |e| e.occurred_at.date_naive())
            .await
            .into_iter()
            .map(|(day, event_type, count)| DailyCount {
                day,
                event_type,
                count,
            })
            .collect())
    }

    async fn count_by_category(&self, filter: &EventFilter) -> Result<Vec<CategoryCount>> {
        Ok(self
            .grouped(filter, |e| e.category.clone())
            .await
            .into_iter()
            .map(|(category, event_type, count)| CategoryCount {
                category,
                event_type,
                count,
            })
            .collect())
    }

    async fn cleanup(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut events = self.events.write().await;
        let count = events.len();
        events.retain(|_, e| e.occurred_at >= before);
        Ok((count - events.len()) as u64)
    }
}
