//! Countdown Trigger
//!
//! Polled by an external scheduler (or the in-process poller). Decides
//! whether the celebration instant has been crossed and, if so, arms the
//! birthday fan-out exactly once. Concurrent polls are expected: the
//! conditional write on the `already_fired` flag picks the single winner.
//! Once a poll wins, the fan-out runs on its own task so a caller that goes
//! away mid-request cannot leave it half done.

use crate::dispatch::{BatchDispatcher, BatchError, BatchSummary};
use chrono::{DateTime, Duration, Utc};
use partyline_common::config::TriggerConfig;
use partyline_common::types::{is_valid_email, BatchId, BatchType};
use partyline_storage::models::{CelebrationConfig, TriggerMark};
use partyline_storage::Store;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{interval, Duration as TokioDuration, MissedTickBehavior};
use tracing::{error, info, warn};

/// Trigger errors; only store failures reach the caller
#[derive(Error, Debug)]
pub enum TriggerError {
    #[error(transparent)]
    Store(#[from] partyline_common::Error),

    #[error("Dispatch failed: {0}")]
    Dispatch(BatchError),

    #[error("Fan-out task failed: {0}")]
    Task(String),
}

impl From<BatchError> for TriggerError {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::Store(inner) => TriggerError::Store(inner),
            other => TriggerError::Dispatch(other),
        }
    }
}

impl From<TriggerError> for partyline_common::Error {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::Store(inner) => inner,
            TriggerError::Dispatch(inner) => inner.into(),
            TriggerError::Task(_) => partyline_common::Error::Internal(e.to_string()),
        }
    }
}

/// Why a poll did or did not fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    /// This poll won the conditional write and dispatched the fan-out
    Fired,
    /// The fan-out happened on an earlier poll
    AlreadyFired,
    /// The celebration instant is still ahead
    NotDue,
    /// Another poll flipped the flag first
    RaceLost,
    /// No celebration instant is configured
    NotConfigured,
}

/// A reminder armed by this poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReminderOutcome {
    pub kind: BatchType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
}

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollOutcome {
    pub fired: bool,
    pub status: PollStatus,
    /// Celebrant and contributor batch ids, in that order
    pub batches: Vec<BatchId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_alert: Option<BatchId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminder: Option<ReminderOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub celebration_instant: Option<DateTime<Utc>>,
}

impl PollOutcome {
    fn idle(status: PollStatus, instant: Option<DateTime<Utc>>) -> Self {
        Self {
            fired: false,
            status,
            batches: Vec::new(),
            admin_alert: None,
            reminder: None,
            celebration_instant: instant,
        }
    }
}

/// Trigger state derived from the celebration row and the clock
#[derive(Debug, Clone, Serialize)]
pub struct TriggerState {
    pub configured: bool,
    pub celebration_instant: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub celebrant_email: Option<String>,
    pub already_fired: bool,
    pub fired_at: Option<DateTime<Utc>>,
    /// Seconds until the instant; negative once it has passed
    pub seconds_remaining: Option<i64>,
    pub reminders: Vec<TriggerMark>,
}

/// Reminder kind whose window contains `now`.
///
/// Windows are `[T-7d, T-1d)`, `[T-1d, T-1h)` and `[T-1h, T)`.
pub fn reminder_window(now: DateTime<Utc>, instant: DateTime<Utc>) -> Option<BatchType> {
    let remaining = instant - now;
    if remaining <= Duration::zero() || remaining > Duration::days(7) {
        None
    } else if remaining > Duration::days(1) {
        Some(BatchType::ReminderWeek)
    } else if remaining > Duration::hours(1) {
        Some(BatchType::ReminderDay)
    } else {
        Some(BatchType::ReminderHour)
    }
}

/// Countdown trigger
pub struct CountdownTrigger {
    store: Store,
    fan_out: FanOut,
    reminders: bool,
}

impl CountdownTrigger {
    pub fn new(store: Store, dispatcher: Arc<BatchDispatcher>, config: &TriggerConfig) -> Self {
        Self {
            fan_out: FanOut {
                store: store.clone(),
                dispatcher,
                admin_alert_address: config.admin_alert_address.clone(),
            },
            store,
            reminders: config.reminders,
        }
    }

    /// Decide whether the celebration instant has passed and fire at most once
    pub async fn poll(&self, now: DateTime<Utc>) -> Result<PollOutcome, TriggerError> {
        let config = match self.store.celebration.get().await? {
            Some(config) => config,
            None => {
                warn!("Trigger polled but no celebration is configured");
                return Ok(PollOutcome::idle(PollStatus::NotConfigured, None));
            }
        };

        let instant = match config.instant {
            Some(instant) => instant,
            None => {
                warn!("Trigger polled but the celebration instant is not set");
                return Ok(PollOutcome::idle(PollStatus::NotConfigured, None));
            }
        };

        if config.already_fired {
            return Ok(PollOutcome::idle(PollStatus::AlreadyFired, Some(instant)));
        }

        if now < instant {
            let mut outcome = PollOutcome::idle(PollStatus::NotDue, Some(instant));
            if self.reminders {
                outcome.reminder = self.arm_reminder(now, instant, &config).await?;
            }
            return Ok(outcome);
        }

        if !self.store.celebration.set_already_fired(false, now).await? {
            info!("Trigger race lost, another poll already fired");
            return Ok(PollOutcome::idle(PollStatus::RaceLost, Some(instant)));
        }

        info!(celebration_instant = %instant, fired_at = %now, "Trigger fired, dispatching fan-out");

        let fan_out = self.fan_out.clone();
        let (batches, admin_alert) =
            detached(async move { fan_out.fire(config, instant, now).await }).await?;

        Ok(PollOutcome {
            fired: true,
            status: PollStatus::Fired,
            batches,
            admin_alert,
            reminder: None,
            celebration_instant: Some(instant),
        })
    }

    /// Poll on a fixed interval until the task is aborted.
    ///
    /// Only for deployments without an external scheduler; overlapping
    /// pollers in other processes remain safe.
    pub async fn run(&self, interval_secs: u64) {
        let mut ticker = interval(TokioDuration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Trigger poller started (interval: {}s)", interval_secs.max(1));

        loop {
            ticker.tick().await;
            match self.poll(Utc::now()).await {
                Ok(outcome) if outcome.fired => {
                    info!(batches = outcome.batches.len(), "Scheduled poll fired the fan-out")
                }
                Ok(_) => {}
                Err(e) => error!("Trigger poll failed: {}", e),
            }
        }
    }

    /// Clear the fired flag and reminder marks. Administrative use only.
    pub async fn reset(&self, now: DateTime<Utc>) -> Result<(), TriggerError> {
        self.store.celebration.reset(now).await?;
        warn!("Trigger reset, the fan-out can fire again");
        Ok(())
    }

    pub async fn state(&self, now: DateTime<Utc>) -> Result<TriggerState, TriggerError> {
        let config = self.store.celebration.get().await?;
        let reminders = self.store.celebration.marks().await?;

        Ok(match config {
            Some(config) => TriggerState {
                configured: config.instant.is_some(),
                celebration_instant: config.instant,
                timezone: Some(config.timezone),
                celebrant_email: config.celebrant_email,
                already_fired: config.already_fired,
                fired_at: config.fired_at,
                seconds_remaining: config.instant.map(|i| (i - now).num_seconds()),
                reminders,
            },
            None => TriggerState {
                configured: false,
                celebration_instant: None,
                timezone: None,
                celebrant_email: None,
                already_fired: false,
                fired_at: None,
                seconds_remaining: None,
                reminders,
            },
        })
    }

    async fn arm_reminder(
        &self,
        now: DateTime<Utc>,
        instant: DateTime<Utc>,
        config: &CelebrationConfig,
    ) -> Result<Option<ReminderOutcome>, TriggerError> {
        let kind = match reminder_window(now, instant) {
            Some(kind) => kind,
            None => return Ok(None),
        };

        if !self.store.celebration.claim_mark(kind.as_str(), now).await? {
            return Ok(None);
        }

        info!(kind = %kind, "Reminder armed");

        let fan_out = self.fan_out.clone();
        let data = template_data(config, instant);
        let batch_id = detached(async move { fan_out.remind(kind, data, now).await }).await?;
        Ok(Some(ReminderOutcome { kind, batch_id }))
    }
}

/// Run `work` on its own task; dropping the caller does not cancel it
async fn detached<T, F>(work: F) -> Result<T, TriggerError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, TriggerError>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| TriggerError::Task(e.to_string()))?
}

/// Batches sent once the trigger has been claimed
#[derive(Clone)]
struct FanOut {
    store: Store,
    dispatcher: Arc<BatchDispatcher>,
    admin_alert_address: Option<String>,
}

impl FanOut {
    /// Celebrant and contributor batches, then the admin alert
    async fn fire(
        &self,
        config: CelebrationConfig,
        instant: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(Vec<BatchId>, Option<BatchId>), TriggerError> {
        let data = template_data(&config, instant);
        let mut batches = Vec::new();
        let mut summaries = Vec::new();

        match config.celebrant_email.as_deref() {
            Some(email) if is_valid_email(email) => {
                let batch = self
                    .dispatch(BatchType::CelebrantNotification, vec![email.to_string()], &data, now)
                    .await?;
                if let Some(batch) = batch {
                    batches.push(batch.batch_id);
                    summaries.push(batch);
                }
            }
            _ => warn!("No valid celebrant address configured, celebrant notification skipped"),
        }

        let contributors = self.contributor_addresses().await?;
        if contributors.is_empty() {
            warn!("No approved contributors, contributor notification skipped");
        } else {
            let batch = self
                .dispatch(BatchType::ContributorNotification, contributors, &data, now)
                .await?;
            if let Some(batch) = batch {
                batches.push(batch.batch_id);
                summaries.push(batch);
            }
        }

        let admin_alert = self.alert_admin(&config, now, &summaries).await?;
        Ok((batches, admin_alert))
    }

    async fn remind(
        &self,
        kind: BatchType,
        data: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchId>, TriggerError> {
        let contributors = self.contributor_addresses().await?;
        if contributors.is_empty() {
            warn!(kind = %kind, "No approved contributors, reminder skipped");
            return Ok(None);
        }

        let batch = self.dispatch(kind, contributors, &data, now).await?;
        Ok(batch.map(|b| b.batch_id))
    }

    async fn alert_admin(
        &self,
        config: &CelebrationConfig,
        now: DateTime<Utc>,
        summaries: &[BatchSummary],
    ) -> Result<Option<BatchId>, TriggerError> {
        let address = match &self.admin_alert_address {
            Some(address) => address.clone(),
            None => return Ok(None),
        };

        let mut data = Map::new();
        data.insert("fired_at".to_string(), json!(now.to_rfc3339()));
        data.insert("batches".to_string(), json!(summaries));
        if let Some(name) = &config.celebrant_name {
            data.insert("celebrant_name".to_string(), json!(name));
        }

        let batch = self
            .dispatch(BatchType::AdminAlert, vec![address], &Value::Object(data), now)
            .await?;
        Ok(batch.map(|b| b.batch_id))
    }

    /// Approved contributors with a usable address
    async fn contributor_addresses(&self) -> Result<Vec<String>, TriggerError> {
        let addresses = self.store.contributors.approved_addresses().await?;
        Ok(addresses
            .into_iter()
            .filter(|address| {
                let valid = is_valid_email(address);
                if !valid {
                    warn!(address = %address, "Skipping contributor with invalid address");
                }
                valid
            })
            .collect())
    }

    /// Dispatch one batch; validation problems are logged, store failures propagate
    async fn dispatch(
        &self,
        batch_type: BatchType,
        recipients: Vec<String>,
        data: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchSummary>, TriggerError> {
        match self
            .dispatcher
            .dispatch(batch_type, recipients, data.clone(), now)
            .await
        {
            Ok(batch) => Ok(Some(BatchSummary::from(&batch))),
            Err(BatchError::Store(e)) => Err(TriggerError::Store(e)),
            Err(e) => {
                error!(batch_type = %batch_type, "Batch dispatch rejected: {}", e);
                Ok(None)
            }
        }
    }
}

fn template_data(config: &CelebrationConfig, instant: DateTime<Utc>) -> Value {
    let mut data = Map::new();
    data.insert("celebration_instant".to_string(), json!(instant.to_rfc3339()));
    data.insert("timezone".to_string(), json!(config.timezone));
    if let Some(name) = &config.celebrant_name {
        data.insert("celebrant_name".to_string(), json!(name));
    }
    Value::Object(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{deliverer, FakeTransport};
    use chrono::TimeZone;
    use partyline_common::config::DispatchConfig;
    use partyline_storage::models::SeedCelebration;
    use partyline_storage::{ContributorRepository, MemoryContributorRepository};
    use pretty_assertions::assert_eq;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 11, 2, 18, 0, 0).unwrap()
    }

    async fn setup(
        contributors: &[&str],
        config: TriggerConfig,
    ) -> (Arc<CountdownTrigger>, Store, Arc<FakeTransport>) {
        setup_with(contributors, config, Arc::new(FakeTransport::new())).await
    }

    async fn setup_with(
        contributors: &[&str],
        config: TriggerConfig,
        transport: Arc<FakeTransport>,
    ) -> (Arc<CountdownTrigger>, Store, Arc<FakeTransport>) {
        let repo = Arc::new(MemoryContributorRepository::new());
        for address in contributors {
            repo.add(address, true).await.unwrap();
        }
        let mut store = Store::memory();
        store.contributors = repo;

        store
            .celebration
            .seed(
                SeedCelebration {
                    instant: instant(),
                    timezone: "Europe/Paris".to_string(),
                    celebrant_email: "sam@example.com".to_string(),
                    celebrant_name: Some("Sam".to_string()),
                },
                instant() - Duration::days(30),
            )
            .await
            .unwrap();

        let dispatcher = Arc::new(BatchDispatcher::new(
            store.clone(),
            deliverer(transport.clone()),
            &DispatchConfig::default(),
        ));
        let trigger = Arc::new(CountdownTrigger::new(store.clone(), dispatcher, &config));
        (trigger, store, transport)
    }

    #[test]
    fn test_reminder_windows() {
        let t = instant();
        assert_eq!(reminder_window(t - Duration::days(8), t), None);
        assert_eq!(reminder_window(t - Duration::days(7), t), Some(BatchType::ReminderWeek));
        assert_eq!(reminder_window(t - Duration::hours(25), t), Some(BatchType::ReminderWeek));
        assert_eq!(reminder_window(t - Duration::days(1), t), Some(BatchType::ReminderDay));
        assert_eq!(reminder_window(t - Duration::minutes(61), t), Some(BatchType::ReminderDay));
        assert_eq!(reminder_window(t - Duration::hours(1), t), Some(BatchType::ReminderHour));
        assert_eq!(reminder_window(t - Duration::seconds(1), t), Some(BatchType::ReminderHour));
        assert_eq!(reminder_window(t, t), None);
    }

    #[tokio::test]
    async fn test_poll_scenario() {
        let (trigger, store, transport) =
            setup(&["ann@example.com", "bo@example.com"], TriggerConfig::default()).await;
        let t = instant();

        let before = trigger.poll(t - Duration::hours(1)).await.unwrap();
        assert!(!before.fired);
        assert_eq!(before.status, PollStatus::NotDue);
        assert!(before.reminder.is_none());

        let fired = trigger.poll(t + Duration::minutes(1)).await.unwrap();
        assert!(fired.fired);
        assert_eq!(fired.status, PollStatus::Fired);
        assert_eq!(fired.batches.len(), 2);
        assert!(fired.admin_alert.is_none());

        let celebrant = store.batches.get(fired.batches[0]).await.unwrap().unwrap();
        assert_eq!(celebrant.batch_type, "celebrant_notification");
        assert_eq!(celebrant.recipients.0, vec!["sam@example.com".to_string()]);
        let contributors = store.batches.get(fired.batches[1]).await.unwrap().unwrap();
        assert_eq!(contributors.batch_type, "contributor_notification");
        assert_eq!(contributors.recipients.0.len(), 2);

        let after = trigger.poll(t + Duration::minutes(5)).await.unwrap();
        assert!(!after.fired);
        assert_eq!(after.status, PollStatus::AlreadyFired);

        assert_eq!(transport.sent().await.len(), 3);
        let state = trigger.state(t + Duration::minutes(5)).await.unwrap();
        assert!(state.already_fired);
        assert_eq!(state.fired_at, Some(t + Duration::minutes(1)));
    }

    #[tokio::test]
    async fn test_concurrent_polls_fire_once() {
        let (trigger, _store, transport) =
            setup(&["ann@example.com"], TriggerConfig::default()).await;
        let now = instant() + Duration::seconds(1);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let trigger = trigger.clone();
            handles.push(tokio::spawn(async move { trigger.poll(now).await.unwrap() }));
        }

        let mut fired = 0;
        for handle in handles {
            if handle.await.unwrap().fired {
                fired += 1;
            }
        }

        assert_eq!(fired, 1);
        assert_eq!(transport.sent().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_poll_still_completes_fan_out() {
        let transport = Arc::new(FakeTransport::new().with_delay(TokioDuration::from_millis(200)));
        let (trigger, store, transport) =
            setup_with(&["ann@example.com"], TriggerConfig::default(), transport).await;
        let t = instant();

        let cut_short = tokio::time::timeout(TokioDuration::from_millis(100), trigger.poll(t)).await;
        assert!(cut_short.is_err());

        tokio::time::sleep(TokioDuration::from_secs(5)).await;

        let batches = store.batches.recent(10).await.unwrap();
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            assert_eq!(batch.status, "completed", "{}", batch.batch_type);
            assert_eq!(batch.results.0.len(), batch.recipients.0.len());
            assert!(batch.completed_at.is_some());
        }
        assert_eq!(transport.sent().await.len(), 2);

        let again = trigger.poll(t + Duration::minutes(1)).await.unwrap();
        assert_eq!(again.status, PollStatus::AlreadyFired);
    }

    #[tokio::test]
    async fn test_not_configured_is_reported() {
        let store = Store::memory();
        let dispatcher = Arc::new(BatchDispatcher::new(
            store.clone(),
            deliverer(Arc::new(FakeTransport::new())),
            &DispatchConfig::default(),
        ));
        let trigger = CountdownTrigger::new(store, dispatcher, &TriggerConfig::default());

        let outcome = trigger.poll(Utc::now()).await.unwrap();
        assert!(!outcome.fired);
        assert_eq!(outcome.status, PollStatus::NotConfigured);
        assert!(!trigger.state(Utc::now()).await.unwrap().configured);
    }

    #[tokio::test]
    async fn test_failed_batches_do_not_rearm() {
        let (trigger, _store, transport) =
            setup(&["ann@example.com"], TriggerConfig::default()).await;
        transport.fail_all_transient().await;

        let fired = trigger.poll(instant()).await.unwrap();
        assert!(fired.fired);
        assert_eq!(fired.batches.len(), 2);

        let again = trigger.poll(instant() + Duration::minutes(15)).await.unwrap();
        assert!(!again.fired);
    }

    #[tokio::test]
    async fn test_reset_rearms() {
        let (trigger, _store, transport) = setup(&[], TriggerConfig::default()).await;

        let first = trigger.poll(instant()).await.unwrap();
        assert_eq!(first.batches.len(), 1);

        trigger.reset(instant()).await.unwrap();
        let second = trigger.poll(instant()).await.unwrap();
        assert!(second.fired);
        assert_eq!(transport.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn test_reminders_fire_once_per_window() {
        let config = TriggerConfig {
            reminders: true,
            ..Default::default()
        };
        let (trigger, store, transport) = setup(&["ann@example.com"], config).await;
        let t = instant();

        let week = trigger.poll(t - Duration::days(3)).await.unwrap();
        let reminder = week.reminder.unwrap();
        assert_eq!(reminder.kind, BatchType::ReminderWeek);
        assert!(reminder.batch_id.is_some());

        assert!(trigger.poll(t - Duration::days(2)).await.unwrap().reminder.is_none());

        let day = trigger.poll(t - Duration::hours(2)).await.unwrap();
        assert_eq!(day.reminder.unwrap().kind, BatchType::ReminderDay);

        assert_eq!(transport.sent().await.len(), 2);
        assert_eq!(store.celebration.marks().await.unwrap().len(), 2);

        trigger.reset(t).await.unwrap();
        assert!(store.celebration.marks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_alert_is_reported_separately() {
        let config = TriggerConfig {
            admin_alert_address: Some("admin@example.com".to_string()),
            ..Default::default()
        };
        let (trigger, store, transport) = setup(&["ann@example.com"], config).await;

        let fired = trigger.poll(instant()).await.unwrap();
        assert_eq!(fired.batches.len(), 2);
        let alert = store
            .batches
            .get(fired.admin_alert.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.batch_type, "admin_alert");

        let sent = transport.sent().await;
        let alert_mail = sent.iter().find(|m| m.to == "admin@example.com").unwrap();
        assert!(alert_mail.html.contains("contributor_notification"));
    }
}
