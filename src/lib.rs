//! # Prometheus Slot Scheduler
//!
//! Lease-aware, slot-based task scheduling for the Prometheus orchestration
//! platform.
//!
//! Several scheduler instances may serve the same tenant. They divide the
//! work through renewable leases on workers and queues, then match queued
//! tasks against an approximate, locally cached view of worker capacity.
//!
//! ## Components
//!
//! - **Lease Manager**: acquires, extends and releases worker and queue
//!   leases, and publishes the latest leased sets.
//! - **Slot Scheduler**: keeps per-action slot lists, replenishes them from
//!   live capacity, and assigns queue items with stickiness, affinity
//!   ranking and rate limiting.
//! - **Queuer**: polls one leased queue, assigns its backlog in sub-batches
//!   and persists the results.
//! - **Batch Buffer Manager**: groups assigned items into size- and
//!   time-bounded batches with a backpressure gate.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_slot_scheduler::builders::TenantSchedulerBuilder;
//! use prometheus_slot_scheduler::infra::InMemoryStore;
//! use prometheus_slot_scheduler::runtime::TokioSpawner;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let manager = TenantSchedulerBuilder::new("tenant-a")
//!     .with_store(Arc::clone(&store))
//!     .build(TokioSpawner::new(tokio::runtime::Handle::current()))?;
//! let mut results = manager.take_results().expect("first call");
//! manager.start()?;
//!
//! while let Some(batch) = results.recv().await {
//!     for assigned in batch.assigned {
//!         println!("task {} -> {}", assigned.queue_item.task_id, assigned.worker_id);
//!     }
//! }
//! ```
//!
//! For complete scenarios, see the integration tests under `tests/`.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Scheduling components and collaborator contracts.
pub mod core;
/// Configuration models for the scheduler loops and step batching.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// In-memory adapters for the collaborator contracts.
pub mod infra;
/// Runtime adapters for background loops.
pub mod runtime;
/// Shared utilities.
pub mod util;
