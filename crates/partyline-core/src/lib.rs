//! Partyline Core - countdown trigger, batch dispatch, send queue and event analytics
//!
//! Everything that sends mail goes through [`Deliverer`], which renders a
//! template and hands the result to a [`MailTransport`]. Batches send
//! immediately and never retry; the send queue retries with backoff.

pub mod delivery;
pub mod dispatch;
pub mod events;
pub mod queue;
pub mod render;
pub mod transport;
pub mod trigger;

#[cfg(test)]
mod testing;

pub use delivery::{Deliverer, DeliveryError};
pub use dispatch::{BatchDispatcher, BatchError, BatchSummary};
pub use events::{AnalyticsAggregator, AnalyticsQuery, EventIngestor, IngestError, IngestReport};
pub use queue::{EnqueueRequest, ProcessOutcome, QueueError, QueueWorker, SendQueue};
pub use render::{MiniJinjaRenderer, RenderedEmail, TemplateError, TemplateRenderer};
pub use transport::{MailTransport, OutboundEmail, TransportError};
pub use trigger::{CountdownTrigger, PollOutcome, PollStatus, TriggerError, TriggerState};
