//! Rate limiter backends.

pub mod memory;

pub use memory::InMemoryRateLimiter;
