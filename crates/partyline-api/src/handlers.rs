//! API request handlers

pub mod analytics;
pub mod batches;
pub mod events;
pub mod health;
pub mod queue;
pub mod trigger;
