//! Lease, capacity and queue-backlog stores.

pub mod memory;

pub use memory::InMemoryStore;
