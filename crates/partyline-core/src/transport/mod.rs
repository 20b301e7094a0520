//! Outbound mail transports

mod log;
mod mailjet;
mod smtp;

pub use self::log::LogTransport;
pub use mailjet::MailjetTransport;
pub use smtp::SmtpTransport;

use async_trait::async_trait;
use partyline_common::config::MailConfig;
use partyline_common::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error as ThisError;

/// One rendered message addressed to one recipient
#[derive(Debug, Clone, Serialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    /// Campaign label echoed back by provider webhooks
    pub category: String,
    /// Opaque record echoed back by provider webhooks
    pub metadata: serde_json::Value,
}

/// Transport failure classification
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Worth retrying later: network trouble, throttling, provider 5xx
    #[error("Transient transport failure: {0}")]
    Transient(String),

    /// Retrying cannot help: rejected address, rejected request
    #[error("Permanent transport failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Permanent(_))
    }
}

/// Delivers a single message; no retry logic of its own
#[async_trait]
pub trait MailTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns the provider message id
    async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, TransportError>;
}

/// Build the transport selected by `[mail] transport`
pub fn from_config(config: &MailConfig) -> Result<Arc<dyn MailTransport>> {
    match config.transport.as_str() {
        "smtp" => Ok(Arc::new(SmtpTransport::new(config)?)),
        "mailjet" => Ok(Arc::new(MailjetTransport::new(config)?)),
        "log" => Ok(Arc::new(LogTransport::new())),
        other => Err(Error::Config(format!("Unknown mail transport: {}", other))),
    }
}
