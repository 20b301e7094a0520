//! Queue Worker - periodic processing, lease recovery and retention

use super::manager::SendQueue;
use crate::dispatch::BatchDispatcher;
use crate::events::EventIngestor;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{interval, Duration as TokioDuration, MissedTickBehavior};
use tracing::{error, info};

const RETENTION_SWEEP_SECS: u64 = 24 * 60 * 60;

/// Drives the send queue until the task is aborted
pub struct QueueWorker {
    queue: Arc<SendQueue>,
    events: Option<Arc<EventIngestor>>,
    batches: Option<Arc<BatchDispatcher>>,
    poll_interval_secs: u64,
    batch_size: usize,
    retention_days: i64,
}

impl QueueWorker {
    pub fn new(queue: Arc<SendQueue>) -> Self {
        let config = queue.config();
        Self {
            poll_interval_secs: config.poll_interval_secs.max(1),
            batch_size: config.batch_size.max(1),
            retention_days: config.retention_days,
            queue,
            events: None,
            batches: None,
        }
    }

    /// Also prune ingested events during the retention sweep
    pub fn with_event_retention(mut self, events: Arc<EventIngestor>) -> Self {
        self.events = Some(events);
        self
    }

    /// Also close batches left processing by a crashed dispatcher
    pub fn with_batch_recovery(mut self, batches: Arc<BatchDispatcher>) -> Self {
        self.batches = Some(batches);
        self
    }

    /// Run the worker
    pub async fn run(&self) {
        let mut ticker = interval(TokioDuration::from_secs(self.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweeper = interval(TokioDuration::from_secs(RETENTION_SWEEP_SECS));
        sweeper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Queue worker started (batch: {}, interval: {}s, retention: {}d)",
            self.batch_size, self.poll_interval_secs, self.retention_days
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = sweeper.tick() => self.sweep().await,
            }
        }
    }

    /// One processing pass
    pub async fn tick(&self) {
        let now = Utc::now();

        if let Err(e) = self.queue.recover_stale(now).await {
            error!("Error recovering stale send requests: {}", e);
        }

        if let Some(batches) = &self.batches {
            if let Err(e) = batches.recover_stale(now).await {
                error!("Error recovering interrupted batches: {}", e);
            }
        }

        match self.queue.process_due(now, self.batch_size).await {
            Ok(outcomes) if !outcomes.is_empty() => {
                info!(processed = outcomes.len(), "Send queue pass completed");
            }
            Ok(_) => {}
            Err(e) => error!("Error processing send queue: {}", e),
        }
    }

    /// Age-based retention of finished requests and events
    pub async fn sweep(&self) {
        if self.retention_days < 1 {
            return;
        }
        let now = Utc::now();

        if let Err(e) = self.queue.cleanup(self.retention_days, now).await {
            error!("Error cleaning up send queue: {}", e);
        }

        if let Some(events) = &self.events {
            if let Err(e) = events.cleanup(self.retention_days, now).await {
                error!("Error cleaning up email events: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueueRequest;
    use crate::testing::{deliverer, FakeTransport};
    use chrono::Duration;
    use partyline_common::config::{DispatchConfig, QueueConfig};
    use partyline_common::types::BatchType;
    use partyline_storage::Store;
    use serde_json::json;

    #[tokio::test]
    async fn test_tick_and_sweep() {
        let store = Store::memory();
        let transport = Arc::new(FakeTransport::new());
        let queue = Arc::new(SendQueue::new(
            store.clone(),
            deliverer(transport.clone()),
            QueueConfig::default(),
        ));
        let worker = QueueWorker::new(queue.clone())
            .with_event_retention(Arc::new(EventIngestor::new(store.clone())));

        let old = Utc::now() - Duration::days(45);
        queue
            .enqueue(
                EnqueueRequest {
                    recipient: "a@example.com".to_string(),
                    template_data: json!({ "message": "hi" }),
                    ..Default::default()
                },
                old,
            )
            .await
            .unwrap();

        worker.tick().await;
        assert_eq!(transport.attempts(), 1);
        assert_eq!(queue.stats().await.unwrap().sent, 1);

        worker.sweep().await;
        assert_eq!(queue.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_tick_closes_interrupted_batches() {
        let store = Store::memory();
        let transport = Arc::new(FakeTransport::new());
        let queue = Arc::new(SendQueue::new(
            store.clone(),
            deliverer(transport.clone()),
            QueueConfig::default(),
        ));
        let dispatcher = Arc::new(BatchDispatcher::new(
            store.clone(),
            deliverer(transport),
            &DispatchConfig::default(),
        ));
        let worker = QueueWorker::new(queue).with_batch_recovery(dispatcher.clone());

        let started = Utc::now() - Duration::hours(2);
        let batch = dispatcher
            .create_batch(
                BatchType::CelebrantNotification,
                vec!["sam@example.com".to_string()],
                json!({}),
                started,
            )
            .await
            .unwrap();
        store.batches.claim(batch.id, started).await.unwrap();

        worker.tick().await;

        let closed = store.batches.get(batch.id).await.unwrap().unwrap();
        assert_eq!(closed.status, "failed");
        assert_eq!(closed.failed_recipients(), vec!["sam@example.com"]);
    }
}
