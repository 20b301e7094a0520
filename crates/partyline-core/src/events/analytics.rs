//! Analytics Aggregator - delivery, engagement and bounce rates over stored events
//!
//! Counting happens in the store; this module only folds grouped counts into rates.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use partyline_common::types::EmailEventType;
use partyline_common::Result;
use partyline_storage::models::{CategoryCount, DailyCount, EventFilter};
use partyline_storage::Store;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label used for events without a category
pub const UNCATEGORIZED: &str = "uncategorized";

/// Query parameters accepted by the analytics endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsQuery {
    /// Category label filter
    #[serde(rename = "type")]
    pub category: Option<String>,
    #[serde(alias = "windowStart")]
    pub start: Option<DateTime<Utc>>,
    #[serde(alias = "windowEnd")]
    pub end: Option<DateTime<Utc>>,
    /// Shorthand window ending now: 24h, 7d, 30d or 90d
    pub range: Option<String>,
}

impl AnalyticsQuery {
    /// Resolve into a store filter
    pub fn to_filter(&self, now: DateTime<Utc>) -> Result<EventFilter> {
        let start = match (self.start, self.range.as_deref()) {
            (Some(start), _) => Some(start),
            (None, Some(range)) => Some(now - parse_range(range)?),
            (None, None) => None,
        };
        if let (Some(start), Some(end)) = (start, self.end) {
            if start > end {
                return Err(partyline_common::Error::Validation(
                    "start must not be after end".to_string(),
                ));
            }
        }

        Ok(EventFilter {
            category: self.category.clone().filter(|c| !c.is_empty()),
            start,
            end: self.end,
        })
    }
}

fn parse_range(range: &str) -> Result<Duration> {
    match range {
        "24h" => Ok(Duration::hours(24)),
        "7d" => Ok(Duration::days(7)),
        "30d" => Ok(Duration::days(30)),
        "90d" => Ok(Duration::days(90)),
        other => Err(partyline_common::Error::Validation(format!(
            "Invalid range: {}",
            other
        ))),
    }
}

/// Raw event counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventCounts {
    pub delivered: u64,
    pub opened: u64,
    pub clicked: u64,
    pub bounced: u64,
    pub soft_bounced: u64,
    pub spam: u64,
    pub unsubscribed: u64,
}

impl EventCounts {
    /// Add `count` events of `event_type`; unknown types are ignored
    pub fn add(&mut self, event_type: &str, count: i64) {
        let count = u64::try_from(count).unwrap_or(0);
        let slot = match event_type.parse::<EmailEventType>() {
            Ok(EmailEventType::Delivery) => &mut self.delivered,
            Ok(EmailEventType::Open) => &mut self.opened,
            Ok(EmailEventType::Click) => &mut self.clicked,
            Ok(EmailEventType::Bounce) => &mut self.bounced,
            Ok(EmailEventType::SoftBounce) => &mut self.soft_bounced,
            Ok(EmailEventType::Spam) => &mut self.spam,
            Ok(EmailEventType::Unsubscribe) => &mut self.unsubscribed,
            Err(_) => return,
        };
        *slot += count;
    }
}

/// Counts plus derived rates
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSummary {
    #[serde(flatten)]
    pub counts: EventCounts,
    pub delivery_rate: f64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub bounce_rate: f64,
}

impl From<EventCounts> for AnalyticsSummary {
    fn from(counts: EventCounts) -> Self {
        let attempted = counts.delivered + counts.bounced;
        Self {
            counts,
            delivery_rate: rate(counts.delivered, attempted),
            open_rate: rate(counts.opened, counts.delivered),
            click_rate: rate(counts.clicked, counts.delivered),
            bounce_rate: rate(counts.bounced, attempted),
        }
    }
}

fn rate(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyBucket {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub counts: EventCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryBucket {
    pub category: String,
    #[serde(flatten)]
    pub summary: AnalyticsSummary,
}

/// Aggregates events on demand; nothing is precomputed
pub struct AnalyticsAggregator {
    store: Store,
}

impl AnalyticsAggregator {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn summary(&self, query: &AnalyticsQuery, now: DateTime<Utc>) -> Result<AnalyticsSummary> {
        let filter = query.to_filter(now)?;
        let mut counts = EventCounts::default();
        for row in self.store.events.count_by_type(&filter).await? {
            counts.add(&row.event_type, row.count);
        }
        Ok(counts.into())
    }

    pub async fn daily_series(&self, query: &AnalyticsQuery, now: DateTime<Utc>) -> Result<Vec<DailyBucket>> {
        let filter = query.to_filter(now)?;
        Ok(daily_series(&self.store.events.count_by_day(&filter).await?))
    }

    pub async fn by_category(&self, query: &AnalyticsQuery, now: DateTime<Utc>) -> Result<Vec<CategoryBucket>> {
        let filter = query.to_filter(now)?;
        Ok(by_category(&self.store.events.count_by_category(&filter).await?))
    }
}

/// Counts per UTC date, oldest first
pub fn daily_series(rows: &[DailyCount]) -> Vec<DailyBucket> {
    let mut days: BTreeMap<NaiveDate, EventCounts> = BTreeMap::new();
    for row in rows {
        days.entry(row.day).or_default().add(&row.event_type, row.count);
    }
    days.into_iter()
        .map(|(date, counts)| DailyBucket { date, counts })
        .collect()
}

/// Summary per category label, sorted by label
pub fn by_category(rows: &[CategoryCount]) -> Vec<CategoryBucket> {
    let mut categories: BTreeMap<String, EventCounts> = BTreeMap::new();
    for row in rows {
        let label = if row.category.is_empty() {
            UNCATEGORIZED.to_string()
        } else {
            row.category.clone()
        };
        categories
            .entry(label)
            .or_default()
            .add(&row.event_type, row.count);
    }
    categories
        .into_iter()
        .map(|(category, counts)| CategoryBucket {
            category,
            summary: counts.into(),
        })
        .collect()
}
