//! Contributor repository

use crate::db::{db_error, DatabasePool};
use async_trait::async_trait;
use partyline_common::types::normalize_address;
use partyline_common::Result;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Source of approved contributor addresses
#[async_trait]
pub trait ContributorRepository: Send + Sync {
    async fn approved_addresses(&self) -> Result<Vec<String>>;

    /// Register a contributor unless the address is already known; returns whether it was added
    async fn add(&self, email: &str, approved: bool) -> Result<bool>;
}

/// Database contributor repository
pub struct DbContributorRepository {
    pool: DatabasePool,
}

impl DbContributorRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContributorRepository for DbContributorRepository {
    async fn approved_addresses(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT email FROM contributors WHERE approved = TRUE ORDER BY created_at ASC",
        )
        .fetch_all(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(|(email,)| email).collect())
    }

    async fn add(&self, email: &str, approved: bool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO contributors (id, email, approved)
            SELECT $1, $2, $3
            WHERE NOT EXISTS (SELECT 1 FROM contributors WHERE lower(email) = $2)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(normalize_address(email))
        .bind(approved)
        .execute(self.pool.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }
}

/// In-memory contributor repository
#[derive(Default)]
pub struct MemoryContributorRepository {
    contributors: RwLock<Vec<(String, bool)>>,
}

impl MemoryContributorRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContributorRepository for MemoryContributorRepository {
    async fn approved_addresses(&self) -> Result<Vec<String>> {
        Ok(self
            .contributors
            .read()
            .await
            .iter()
            .filter(|(_, approved)| *approved)
            .map(|(email, _)| email.clone())
            .collect())
    }

    async fn add(&self, email: &str, approved: bool) -> Result<bool> {
        let email = normalize_address(email);
        let mut contributors = self.contributors.write().await;
        if contributors.iter().any(|(known, _)| *known == email) {
            return Ok(false);
        }
        contributors.push((email, approved));
        Ok(true)
    }
}
