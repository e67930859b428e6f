//! Infrastructure adapters implementing the collaborator contracts.

pub mod rate_limit;
pub mod store;

pub use rate_limit::InMemoryRateLimiter;
pub use store::InMemoryStore;
