//! SMTP relay transport

use super::{MailTransport, OutboundEmail, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use partyline_common::config::MailConfig;
use partyline_common::{Error, Result};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Sends through an SMTP relay
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpTransport {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let smtp = &config.smtp;

        let from: Mailbox = match &config.from_name {
            Some(name) => format!("{} <{}>", name, config.from_address).parse(),
            None => config.from_address.parse(),
        }
        .map_err(|e| Error::Config(format!("Invalid from address: {}", e)))?;

        let mut builder = if smtp.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
                .map_err(|e| Error::Config(format!("Failed to create SMTP transport: {}", e)))?
        } else if smtp.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
                .map_err(|e| Error::Config(format!("Failed to create SMTP transport: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
        };

        builder = builder
            .port(smtp.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&smtp.username, &smtp.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            mailer: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, TransportError> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| TransportError::Permanent(format!("Invalid recipient address: {}", e)))?;

        let msg_id = format!("<{}.{}@partyline>", Uuid::new_v4(), Utc::now().timestamp());

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&email.subject)
            .message_id(Some(msg_id.clone()))
            .header(ContentType::TEXT_HTML)
            .body(email.html.clone())
            .map_err(|e| TransportError::Permanent(format!("Failed to build email: {}", e)))?;

        match self.mailer.send(message).await {
            Ok(response) => {
                debug!(to = %email.to, code = %response.code(), "SMTP relay accepted message");
                Ok(msg_id)
            }
            Err(e) if e.is_permanent() => Err(TransportError::Permanent(e.to_string())),
            Err(e) => Err(TransportError::Transient(e.to_string())),
        }
    }
}
