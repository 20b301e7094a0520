//! Repository layer for data access

pub mod batches;
pub mod celebration;
pub mod contributors;
pub mod events;
pub mod send_requests;

// Re-export repository traits
pub use batches::BatchRepository;
pub use celebration::CelebrationRepository;
pub use contributors::ContributorRepository;
pub use events::EventRepository;
pub use send_requests::SendRequestRepository;

// Re-export concrete implementations
pub use batches::{DbBatchRepository, MemoryBatchRepository};
pub use celebration::{DbCelebrationRepository, MemoryCelebrationRepository};
pub use contributors::{DbContributorRepository, MemoryContributorRepository};
pub use events::{DbEventRepository, MemoryEventRepository};
pub use send_requests::{DbSendRequestRepository, MemorySendRequestRepository};
