//! Mailjet Send API v3.1 transport

use super::{MailTransport, OutboundEmail, TransportError};
use async_trait::async_trait;
use partyline_common::config::MailConfig;
use partyline_common::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Sends through the Mailjet HTTP API
#[derive(Clone)]
pub struct MailjetTransport {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    from_email: String,
    from_name: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SendPayload<'a> {
    messages: Vec<PayloadMessage<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PayloadMessage<'a> {
    from: Address<'a>,
    to: Vec<Address<'a>>,
    subject: &'a str,
    #[serde(rename = "HTMLPart")]
    html_part: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    custom_campaign: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_payload: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Address<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SendResponse {
    #[serde(default)]
    messages: Vec<ResponseMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponseMessage {
    status: String,
    #[serde(default)]
    to: Vec<ResponseRecipient>,
    #[serde(default)]
    errors: Vec<ResponseError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponseRecipient {
    #[serde(rename = "MessageID")]
    message_id: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponseError {
    #[serde(default)]
    error_message: String,
}

impl MailjetTransport {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let settings = &config.mailjet;
        let api_key = settings
            .api_key
            .clone()
            .ok_or_else(|| Error::Config("mail.mailjet.api_key is required".to_string()))?;
        let api_secret = settings
            .api_secret
            .clone()
            .ok_or_else(|| Error::Config("mail.mailjet.api_secret is required".to_string()))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
            from_email: config.from_address.clone(),
            from_name: config.from_name.clone(),
        })
    }

    fn payload<'a>(&'a self, email: &'a OutboundEmail) -> SendPayload<'a> {
        let event_payload = match &email.metadata {
            serde_json::Value::Null => None,
            serde_json::Value::Object(map) if map.is_empty() => None,
            other => Some(other.to_string()),
        };

        SendPayload {
            messages: vec![PayloadMessage {
                from: Address {
                    email: &self.from_email,
                    name: self.from_name.as_deref(),
                },
                to: vec![Address {
                    email: &email.to,
                    name: None,
                }],
                subject: &email.subject,
                html_part: &email.html,
                custom_campaign: &email.category,
                event_payload,
            }],
        }
    }
}

fn classify(status: StatusCode, body: String) -> TransportError {
    let message = format!("Mailjet API error {}: {}", status.as_u16(), body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        TransportError::Transient(message)
    } else {
        TransportError::Permanent(message)
    }
}

#[async_trait]
impl MailTransport for MailjetTransport {
    fn name(&self) -> &'static str {
        "mailjet"
    }

    async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, TransportError> {
        let res = self
            .client
            .post(format!("{}/v3.1/send", self.base_url))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .json(&self.payload(email))
            .send()
            .await
            .map_err(|e| TransportError::Transient(format!("Mail send failed: {}", e)))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify(status, body));
        }

        let response: SendResponse = res
            .json()
            .await
            .map_err(|e| TransportError::Transient(format!("Unreadable Mailjet response: {}", e)))?;

        let message = response
            .messages
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Transient("Empty Mailjet response".to_string()))?;

        if message.status != "success" {
            let reason = message
                .errors
                .into_iter()
                .map(|e| e.error_message)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(TransportError::Permanent(format!(
                "Mailjet rejected message: {}",
                reason
            )));
        }

        let id = message
            .to
            .into_iter()
            .next()
            .map(|r| match r.message_id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            })
            .ok_or_else(|| TransportError::Transient("Mailjet response without MessageID".to_string()))?;

        debug!(to = %email.to, provider_id = %id, "Mailjet accepted message");
        Ok(id)
    }
}
