//! Batch dispatch

mod dispatcher;

pub use dispatcher::{BatchDispatcher, BatchError, BatchSummary, MAX_RECENT_BATCHES};
