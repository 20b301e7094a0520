//! Render + send primitive shared by the batch dispatcher and the send queue

use crate::render::{TemplateError, TemplateRenderer};
use crate::transport::{MailTransport, OutboundEmail, TransportError};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

/// Why one message could not be delivered
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DeliveryError {
    /// Template errors never heal on their own
    pub fn is_permanent(&self) -> bool {
        match self {
            DeliveryError::Template(_) => true,
            DeliveryError::Transport(e) => e.is_permanent(),
        }
    }
}

/// Renders one template for one recipient and hands it to the transport
pub struct Deliverer {
    renderer: Arc<dyn TemplateRenderer>,
    transport: Arc<dyn MailTransport>,
    defaults: Map<String, Value>,
}

impl Deliverer {
    pub fn new(renderer: Arc<dyn TemplateRenderer>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            renderer,
            transport,
            defaults: Map::new(),
        }
    }

    /// Values visible to every template unless the data overrides them
    pub fn with_default(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.defaults.insert(key.to_string(), value.into());
        self
    }

    pub fn renderer(&self) -> &Arc<dyn TemplateRenderer> {
        &self.renderer
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Render `template_id` for `recipient` and send it.
    ///
    /// The recipient address is exposed to the template as `recipient`. A
    /// non-empty `subject_override` replaces the rendered subject. The
    /// template id doubles as the campaign category reported back by
    /// delivery webhooks.
    pub async fn deliver(
        &self,
        recipient: &str,
        template_id: &str,
        data: &Value,
        subject_override: Option<&str>,
        metadata: Value,
    ) -> Result<String, DeliveryError> {
        let context = self.context(recipient, data);
        let rendered = self.renderer.render(template_id, &context)?;

        let subject = match subject_override {
            Some(subject) if !subject.trim().is_empty() => subject.to_string(),
            _ => rendered.subject,
        };

        let email = OutboundEmail {
            to: recipient.to_string(),
            subject,
            html: rendered.html,
            category: template_id.to_string(),
            metadata,
        };

        Ok(self.transport.send(&email).await?)
    }

    fn context(&self, recipient: &str, data: &Value) -> Value {
        match data {
            Value::Object(fields) => {
                let mut context = self.defaults.clone();
                context.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                context.insert("recipient".to_string(), Value::String(recipient.to_string()));
                Value::Object(context)
            }
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::MiniJinjaRenderer;
    use crate::testing::FakeTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn deliverer(transport: Arc<FakeTransport>) -> Deliverer {
        Deliverer::new(Arc::new(MiniJinjaRenderer::new().unwrap()), transport)
            .with_default("site_url", "https://party.example.com")
    }

    #[tokio::test]
    async fn test_deliver_renders_and_sends() {
        let transport = Arc::new(FakeTransport::new());
        let id = deliverer(transport.clone())
            .deliver(
                "ann@example.com",
                "celebrant_notification",
                &json!({ "celebrant_name": "Ann" }),
                None,
                json!({ "batch_id": "b" }),
            )
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ann@example.com");
        assert_eq!(sent[0].subject, "Happy birthday, Ann!");
        assert_eq!(sent[0].category, "celebrant_notification");
        assert!(sent[0].html.contains("https://party.example.com"));
        assert!(id.starts_with("fake-"));
    }

    #[tokio::test]
    async fn test_subject_override() {
        let transport = Arc::new(FakeTransport::new());
        deliverer(transport.clone())
            .deliver(
                "ann@example.com",
                "generic",
                &json!({ "message": "hello" }),
                Some("Custom subject"),
                Value::Null,
            )
            .await
            .unwrap();
        assert_eq!(transport.sent().await[0].subject, "Custom subject");
    }

    #[tokio::test]
    async fn test_template_errors_are_permanent_and_skip_transport() {
        let transport = Arc::new(FakeTransport::new());
        let err = deliverer(transport.clone())
            .deliver("ann@example.com", "nope", &json!({}), None, Value::Null)
            .await
            .unwrap_err();

        assert!(err.is_permanent());
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_transport_errors_keep_classification() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_transient("ann@example.com").await;
        let err = deliverer(transport)
            .deliver("ann@example.com", "generic", &json!({ "message": "x" }), None, Value::Null)
            .await
            .unwrap_err();
        assert!(!err.is_permanent());
    }
}
