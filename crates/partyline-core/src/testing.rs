//! Test doubles shared by the core unit tests

use crate::delivery::Deliverer;
use crate::render::MiniJinjaRenderer;
use crate::transport::{MailTransport, OutboundEmail, TransportError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Clone, Copy)]
enum Failure {
    Transient,
    Permanent,
}

/// Records every message; failures can be scripted per address
#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    failures: Mutex<HashMap<String, Failure>>,
    fail_everything: Mutex<Option<Failure>>,
    attempts: AtomicUsize,
    delay: Option<Duration>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send takes `delay` before it answers
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn fail_transient(&self, address: &str) {
        self.failures
            .lock()
            .await
            .insert(address.to_string(), Failure::Transient);
    }

    pub async fn fail_permanent(&self, address: &str) {
        self.failures
            .lock()
            .await
            .insert(address.to_string(), Failure::Permanent);
    }

    pub async fn fail_all_transient(&self) {
        *self.fail_everything.lock().await = Some(Failure::Transient);
    }

    /// Successfully sent messages
    pub async fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().await.clone()
    }

    /// Every call, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, TransportError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst);
        match self.delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }

        let scripted = match *self.fail_everything.lock().await {
            Some(failure) => Some(failure),
            None => self.failures.lock().await.get(&email.to).copied(),
        };
        match scripted {
            Some(Failure::Transient) => Err(TransportError::Transient(format!(
                "421 try again later ({})",
                email.to
            ))),
            Some(Failure::Permanent) => Err(TransportError::Permanent(format!(
                "550 no such user ({})",
                email.to
            ))),
            None => {
                self.sent.lock().await.push(email.clone());
                Ok(format!("fake-{}", n))
            }
        }
    }
}

pub fn deliverer(transport: Arc<FakeTransport>) -> Arc<Deliverer> {
    Arc::new(
        Deliverer::new(Arc::new(MiniJinjaRenderer::new().unwrap()), transport)
            .with_default("site_url", "https://party.example.com"),
    )
}
