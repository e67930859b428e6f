//! Scheduling components: leases, slots, queue polling and batch buffering.

pub mod batch_buffer;
pub mod error;
pub mod lease_manager;
pub mod queuer;
pub mod repository;
pub mod scheduler;
pub mod tenant_manager;

pub use batch_buffer::{
    AddResult, BatchBufferManager, BatchFlusher, BatchItem, BufferKey, FlushReason, FlushRequest,
};
pub use error::{AppResult, FlushErrors, SchedulerError};
pub use lease_manager::LeaseManager;
pub use queuer::{AssignedQueueItem, CycleSummary, QueueResults, Queuer};
pub use repository::{
    ActiveWorker, AssignmentRecord, CapacityRepository, Lease, LeaseRepository,
    MarkProcessedResult, QueueDescriptor, QueueItem, QueueRepository, RateLimitDecision,
    RateLimiter, WorkerAction,
};
pub use scheduler::{
    AckHandle, ActionStats, AssignResults, AssignedItem, RateLimitedItem, Scheduler, Slot, SlotId,
    SlotState,
};
pub use tenant_manager::TenantManager;
