//! Development transport that only logs

use super::{MailTransport, OutboundEmail, TransportError};
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

/// Logs every message and reports success
#[derive(Debug, Default, Clone)]
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let id = format!("log-{}", Uuid::new_v4());
        info!(
            to = %email.to,
            subject = %email.subject,
            category = %email.category,
            provider_id = %id,
            "Mail transport disabled, message logged"
        );
        Ok(id)
    }
}
