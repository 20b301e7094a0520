//! Partyline API - HTTP surface for the scheduler, the admin dashboard and mail webhooks

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
