//! Celebration configuration repository
//!
//! The `already_fired` flag and the reminder marks are the only state
//! contended by concurrent pollers. Both are changed exclusively through
//! conditional writes so that any number of process instances can poll.

use crate::db::{db_error, DatabasePool};
use crate::models::{CelebrationConfig, SeedCelebration, TriggerMark};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use partyline_common::Result;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Celebration repository trait
#[async_trait]
pub trait CelebrationRepository: Send + Sync {
    /// Read the configuration row, `None` when nothing is configured
    async fn get(&self) -> Result<Option<CelebrationConfig>>;

    /// Flip `already_fired` away from `expected_prior`.
    ///
    /// Returns `false` when the stored flag no longer equals `expected_prior`
    /// (or no row exists); nothing is written in that case.
    async fn set_already_fired(&self, expected_prior: bool, at: DateTime<Utc>) -> Result<bool>;

    /// Record `kind` as fired if it was not already; returns whether this call won
    async fn claim_mark(&self, kind: &str, at: DateTime<Utc>) -> Result<bool>;

    async fn marks(&self) -> Result<Vec<TriggerMark>>;

    /// Clear the fired flag and every reminder mark
    async fn reset(&self, at: DateTime<Utc>) -> Result<()>;

    /// Insert the configuration row if none exists; returns whether it was inserted
    async fn seed(&self, seed: SeedCelebration, at: DateTime<Utc>) -> Result<bool>;
}

/// Database celebration repository
pub struct DbCelebrationRepository {
    pool: DatabasePool,
}

impl DbCelebrationRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CelebrationRepository for DbCelebrationRepository {
    async fn get(&self) -> Result<Option<CelebrationConfig>> {
        sqlx::query_as::<_, CelebrationConfig>(
            r#"
            SELECT instant, timezone, celebrant_email, celebrant_name,
                   already_fired, fired_at, updated_at
            FROM celebration_config
            WHERE id = 1
            "#,
        )
        .fetch_optional(self.pool.pool())
        .await
        .map_err(db_error)
    }

    async fn set_already_fired(&self, expected_prior: bool, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE celebration_config SET
                already_fired = NOT $1,
                fired_at = CASE WHEN $1 THEN NULL ELSE $2 END,
                updated_at = $2
            WHERE id = 1 AND already_fired = $1
            "#,
        )
        .bind(expected_prior)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_mark(&self, kind: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO trigger_marks (kind, fired_at) VALUES ($1, $2) ON CONFLICT (kind) DO NOTHING",
        )
        .bind(kind)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn marks(&self) -> Result<Vec<TriggerMark>> {
        sqlx::query_as::<_, TriggerMark>("SELECT kind, fired_at FROM trigger_marks ORDER BY fired_at")
            .fetch_all(self.pool.pool())
            .await
            .map_err(db_error)
    }

    async fn reset(&self, at: DateTime<Utc>) -> Result<()> {
        let mut tx = self.pool.pool().begin().await.map_err(db_error)?;

        sqlx::query(
            "UPDATE celebration_config SET already_fired = FALSE, fired_at = NULL, updated_at = $1 WHERE id = 1",
        )
        .bind(at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query("DELETE FROM trigger_marks")
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)
    }

    async fn seed(&self, seed: SeedCelebration, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO celebration_config (id, instant, timezone, celebrant_email, celebrant_name, updated_at)
            VALUES (1, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(seed.instant)
        .bind(&seed.timezone)
        .bind(&seed.celebrant_email)
        .bind(&seed.celebrant_name)
        .bind(at)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }
}

/// In-memory celebration repository
#[derive(Default)]
pub struct MemoryCelebrationRepository {
    config: Mutex<Option<CelebrationConfig>>,
    marks: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl MemoryCelebrationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configuration row
    pub async fn put(&self, config: CelebrationConfig) {
        *self.config.lock().await = Some(config);
    }
}

#[async_trait]
impl CelebrationRepository for MemoryCelebrationRepository {
    async fn get(&self) -> Result<Option<CelebrationConfig>> {
        Ok(self.config.lock().await.clone())
    }

    async fn set_already_fired(&self, expected_prior: bool, at: DateTime<Utc>) -> Result<bool> {
        let mut guard = self.config.lock().await;
        match guard.as_mut() {
            Some(config) if config.already_fired == expected_prior => {
                config.already_fired = !expected_prior;
                config.fired_at = if expected_prior { None } else { Some(at) };
                config.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_mark(&self, kind: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut marks = self.marks.lock().await;
        if marks.contains_key(kind) {
            return Ok(false);
        }
        marks.insert(kind.to_string(), at);
        Ok(true)
    }

    async fn marks(&self) -> Result<Vec<TriggerMark>> {
        let mut marks: Vec<TriggerMark> = self
            .marks
            .lock()
            .await
            .iter()
            .map(|(kind, fired_at)| TriggerMark {
                kind: kind.clone(),
                fired_at: *fired_at,
            })
            .collect();
        marks.sort_by_key(|m| m.fired_at);
        Ok(marks)
    }

    async fn reset(&self, at: DateTime<Utc>) -> Result<()> {
        if let Some(config) = self.config.lock().await.as_mut() {
            config.already_fired = false;
            config.fired_at = None;
            config.updated_at = at;
        }
        self.marks.lock().await.clear();
        Ok(())
    }

    async fn seed(&self, seed: SeedCelebration, at: DateTime<Utc>) -> Result<bool> {
        let mut guard = self.config.lock().await;
        if guard.is_some() {
            return Ok(false);
        }
        *guard = Some(CelebrationConfig {
            instant: Some(seed.instant),
            timezone: seed.timezone,
            celebrant_email: Some(seed.celebrant_email),
            celebrant_name: seed.celebrant_name,
            already_fired: false,
            fired_at: None,
            updated_at: at,
        });
        Ok(true)
    }
}
