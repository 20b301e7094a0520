//! Configuration for Partyline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "PARTYLINE_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Outbound mail configuration
    #[serde(default)]
    pub mail: MailConfig,

    /// Send queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Countdown trigger configuration
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Batch dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Shared secrets for the admin, scheduler and webhook surfaces
    #[serde(default)]
    pub auth: AuthConfig,

    /// Celebration row inserted on first start when none exists
    pub celebration: Option<CelebrationSeed>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Public URL of the countdown site, exposed to templates
    #[serde(default = "default_site_url")]
    pub site_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            site_url: default_site_url(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_site_url() -> String {
    "http://localhost:3000".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default = "default_db_backend")]
    pub backend: String,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_db_backend() -> String {
    "postgres".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Outbound mail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// Transport: "smtp", "mailjet" or "log"
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Sender address
    #[serde(default = "default_from_address")]
    pub from_address: String,

    /// Sender display name
    pub from_name: Option<String>,

    /// Per-send timeout in seconds
    #[serde(default = "default_send_timeout")]
    pub timeout_secs: u64,

    /// SMTP relay settings
    #[serde(default)]
    pub smtp: SmtpSettings,

    /// Mailjet API settings
    #[serde(default)]
    pub mailjet: MailjetSettings,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            from_address: default_from_address(),
            from_name: None,
            timeout_secs: default_send_timeout(),
            smtp: SmtpSettings::default(),
            mailjet: MailjetSettings::default(),
        }
    }
}

fn default_transport() -> String {
    "log".to_string()
}

fn default_from_address() -> String {
    "noreply@localhost.localdomain".to_string()
}

fn default_send_timeout() -> u64 {
    30
}

/// SMTP relay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_true")]
    pub use_starttls: bool,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            use_tls: false,
            use_starttls: true,
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

/// Mailjet API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailjetSettings {
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    #[serde(default = "default_mailjet_url")]
    pub base_url: String,
}

impl Default for MailjetSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            base_url: default_mailjet_url(),
        }
    }
}

fn default_mailjet_url() -> String {
    "https://api.mailjet.com".to_string()
}

/// Send queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker poll interval in seconds
    #[serde(default = "default_queue_interval")]
    pub poll_interval_secs: u64,

    /// Maximum requests taken per processing pass
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: usize,

    /// Concurrent sends within one pass
    #[serde(default = "default_queue_concurrency")]
    pub concurrency: usize,

    /// Attempts before a request is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// First retry delay in seconds
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: i64,

    /// Upper bound on the retry delay in seconds
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: i64,

    /// Age after which a processing claim is considered abandoned
    #[serde(default = "default_processing_timeout")]
    pub processing_timeout_secs: i64,

    /// Days sent/failed requests and events are kept
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_queue_interval(),
            batch_size: default_queue_batch_size(),
            concurrency: default_queue_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            processing_timeout_secs: default_processing_timeout(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_queue_interval() -> u64 {
    30
}

fn default_queue_batch_size() -> usize {
    50
}

fn default_queue_concurrency() -> usize {
    5
}

fn default_max_attempts() -> i32 {
    3
}

fn default_backoff_base() -> i64 {
    60
}

fn default_backoff_max() -> i64 {
    4 * 60 * 60
}

fn default_processing_timeout() -> i64 {
    15 * 60
}

fn default_retention_days() -> i64 {
    30
}

/// Countdown trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// In-process poll interval in seconds; 0 leaves polling to an external scheduler
    #[serde(default)]
    pub poll_interval_secs: u64,

    /// Send week/day/hour reminders to contributors
    #[serde(default)]
    pub reminders: bool,

    /// Address notified when the fan-out fires
    pub admin_alert_address: Option<String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 0,
            reminders: false,
            admin_alert_address: None,
        }
    }
}

/// Batch dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Concurrent sends within one batch
    #[serde(default = "default_dispatch_concurrency")]
    pub concurrency: usize,

    /// Default number of batches returned by the audit view
    #[serde(default = "default_recent_batches")]
    pub recent_limit: usize,

    /// Age after which a batch still processing is closed as interrupted
    #[serde(default = "default_batch_timeout")]
    pub processing_timeout_secs: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_dispatch_concurrency(),
            recent_limit: default_recent_batches(),
            processing_timeout_secs: default_batch_timeout(),
        }
    }
}

fn default_dispatch_concurrency() -> usize {
    4
}

fn default_recent_batches() -> usize {
    20
}

fn default_batch_timeout() -> i64 {
    900
}

/// Shared secrets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Argon2 (or legacy SHA-256 hex) hash of the admin API key
    pub admin_key_hash: Option<String>,

    /// Hash of the bearer secret the scheduler presents to the poll endpoint
    pub scheduler_secret_hash: Option<String>,

    /// Secret used to verify webhook deliveries
    pub webhook_secret: Option<String>,
}

/// Initial celebration row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CelebrationSeed {
    /// Target instant, RFC 3339 string
    pub instant: DateTime<Utc>,

    /// IANA timezone name used for display
    #[serde(default = "default_timezone")]
    pub timezone: String,

    pub celebrant_email: String,

    pub celebrant_name: Option<String>,

    /// Approved contributor addresses registered alongside the seed
    #[serde(default)]
    pub contributors: Vec<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from environment and file
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::from_file(Path::new(&path));
        }

        let paths = [
            PathBuf::from("./partyline.toml"),
            PathBuf::from("/etc/partyline/partyline.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}
