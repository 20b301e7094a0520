//! Common types for Partyline

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for send requests
pub type SendRequestId = Uuid;

/// Unique identifier for batches
pub type BatchId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Send request priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Processing order, lower is served first
    pub fn rank(&self) -> i16 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(crate::Error::Validation(format!("Invalid priority: {}", s))),
        }
    }
}

/// Send request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Processing,
    Sent,
    Failed,
}

impl std::fmt::Display for SendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendStatus::Pending => write!(f, "pending"),
            SendStatus::Processing => write!(f, "processing"),
            SendStatus::Sent => write!(f, "sent"),
            SendStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for SendStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SendStatus::Pending),
            "processing" => Ok(SendStatus::Processing),
            "sent" => Ok(SendStatus::Sent),
            "failed" => Ok(SendStatus::Failed),
            _ => Err(crate::Error::Validation(format!("Invalid send status: {}", s))),
        }
    }
}

/// Logical notification event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    CelebrantNotification,
    ContributorNotification,
    ReminderWeek,
    ReminderDay,
    ReminderHour,
    ThankYou,
    AdminAlert,
}

impl BatchType {
    pub const ALL: [BatchType; 7] = [
        BatchType::CelebrantNotification,
        BatchType::ContributorNotification,
        BatchType::ReminderWeek,
        BatchType::ReminderDay,
        BatchType::ReminderHour,
        BatchType::ThankYou,
        BatchType::AdminAlert,
    ];

    /// Template rendered for recipients of this batch type
    pub fn template_id(&self) -> &'static str {
        self.as_str()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::CelebrantNotification => "celebrant_notification",
            BatchType::ContributorNotification => "contributor_notification",
            BatchType::ReminderWeek => "reminder_week",
            BatchType::ReminderDay => "reminder_day",
            BatchType::ReminderHour => "reminder_hour",
            BatchType::ThankYou => "thank_you",
            BatchType::AdminAlert => "admin_alert",
        }
    }

    pub fn is_reminder(&self) -> bool {
        matches!(
            self,
            BatchType::ReminderWeek | BatchType::ReminderDay | BatchType::ReminderHour
        )
    }
}

impl std::fmt::Display for BatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::Validation(format!("Invalid batch type: {}", s)))
    }
}

/// Batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchStatus::Pending => write!(f, "pending"),
            BatchStatus::Processing => write!(f, "processing"),
            BatchStatus::Completed => write!(f, "completed"),
            BatchStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            _ => Err(crate::Error::Validation(format!("Invalid batch status: {}", s))),
        }
    }
}

/// Delivery outcome event kinds reported by the mail transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Delivery,
    Open,
    Click,
    Bounce,
    SoftBounce,
    Spam,
    Unsubscribe,
}

impl std::fmt::Display for EmailEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmailEventType::Delivery => write!(f, "delivery"),
            EmailEventType::Open => write!(f, "open"),
            EmailEventType::Click => write!(f, "click"),
            EmailEventType::Bounce => write!(f, "bounce"),
            EmailEventType::SoftBounce => write!(f, "soft_bounce"),
            EmailEventType::Spam => write!(f, "spam"),
            EmailEventType::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

impl std::str::FromStr for EmailEventType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delivery" => Ok(EmailEventType::Delivery),
            "open" => Ok(EmailEventType::Open),
            "click" => Ok(EmailEventType::Click),
            "bounce" => Ok(EmailEventType::Bounce),
            "soft_bounce" => Ok(EmailEventType::SoftBounce),
            "spam" => Ok(EmailEventType::Spam),
            "unsubscribe" => Ok(EmailEventType::Unsubscribe),
            _ => Err(crate::Error::Validation(format!("Invalid event type: {}", s))),
        }
    }
}

/// Validate email address format
pub fn is_valid_email(email: &str) -> bool {
    // Basic validation: contains @ and has domain part
    if let Some(at_pos) = email.rfind('@') {
        let domain = &email[at_pos + 1..];
        !email[..at_pos].is_empty()
            && !domain.is_empty()
            && domain.contains('.')
            && !email.chars().any(char::is_whitespace)
    } else {
        false
    }
}

/// Canonical form used for recipient deduplication
pub fn normalize_address(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Instant `days` days before `now`, or `None` when `days` is below 1 or
/// the result falls outside the representable range
pub fn retention_cutoff(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    if days < 1 {
        return None;
    }
    Duration::try_days(days).and_then(|age| now.checked_sub_signed(age))
}
