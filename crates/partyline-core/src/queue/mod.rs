//! Send queue and its background worker

mod manager;
mod worker;

pub use manager::{EnqueueRequest, ProcessOutcome, QueueError, SendQueue, MAX_LIST_LIMIT};
pub use worker::QueueWorker;
