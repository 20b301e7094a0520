//! Partyline Storage - Database abstraction
//!
//! Repositories for the celebration state, the send queue, batches and
//! delivery events, with PostgreSQL and in-memory implementations.

pub mod db;
pub mod models;
pub mod repository;
pub mod store;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
pub use store::Store;
