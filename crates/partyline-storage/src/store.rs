//! Repository bundle shared by the services

use crate::db::DatabasePool;
use crate::repository::*;
use partyline_common::Result;
use std::sync::Arc;

/// Every repository the engine needs, behind trait objects
#[derive(Clone)]
pub struct Store {
    pub celebration: Arc<dyn CelebrationRepository>,
    pub contributors: Arc<dyn ContributorRepository>,
    pub send_requests: Arc<dyn SendRequestRepository>,
    pub batches: Arc<dyn BatchRepository>,
    pub events: Arc<dyn EventRepository>,
    pool: Option<DatabasePool>,
}

impl Store {
    /// PostgreSQL-backed store
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            celebration: Arc::new(DbCelebrationRepository::new(pool.clone())),
            contributors: Arc::new(DbContributorRepository::new(pool.clone())),
            send_requests: Arc::new(DbSendRequestRepository::new(pool.clone())),
            batches: Arc::new(DbBatchRepository::new(pool.clone())),
            events: Arc::new(DbEventRepository::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Process-local store; state is lost on restart
    pub fn memory() -> Self {
        Self {
            celebration: Arc::new(MemoryCelebrationRepository::new()),
            contributors: Arc::new(MemoryContributorRepository::new()),
            send_requests: Arc::new(MemorySendRequestRepository::new()),
            batches: Arc::new(MemoryBatchRepository::new()),
            events: Arc::new(MemoryEventRepository::new()),
            pool: None,
        }
    }

    /// Backend name for logs and readiness output
    pub fn backend(&self) -> &'static str {
        if self.pool.is_some() {
            "postgres"
        } else {
            "memory"
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.health_check().await,
            None => Ok(()),
        }
    }
}
