//! Collaborator contracts the scheduling core depends on, and the records
//! exchanged through them.
//!
//! The core owns no durable state. Leases, worker capacity, queue backlog and
//! rate-limit budgets all live behind these traits; `crate::infra` provides
//! in-memory implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;
use crate::util::types::{
    ActionId, DesiredLabel, DispatcherId, LeaseKind, QueueItemId, StepId, StickyStrategy, TaskId,
    TenantId, WorkerId, WorkerLabel,
};

/// A time-bounded exclusive claim on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Store-assigned lease identifier.
    pub id: i64,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Kind of resource leased.
    pub kind: LeaseKind,
    /// Worker id or queue name.
    pub resource_id: String,
    /// Expiry in milliseconds since epoch.
    pub expires_at_ms: u128,
}

/// A live worker as reported by the worker registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveWorker {
    /// Worker identifier.
    pub id: WorkerId,
    /// Dispatcher the worker is connected through.
    pub dispatcher_id: Option<DispatcherId>,
    /// Maximum concurrent runs the worker accepts.
    pub max_runs: u32,
    /// Labels used for affinity ranking.
    pub labels: Vec<WorkerLabel>,
}

/// A declared queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueDescriptor {
    /// Queue name, unique per tenant.
    pub name: String,
}

/// One (worker, action) advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAction {
    /// Advertising worker.
    pub worker_id: WorkerId,
    /// Supported action.
    pub action_id: ActionId,
}

/// A pending unit of work in one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Position in the queue; listings are ordered by it.
    pub id: QueueItemId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Queue the item belongs to.
    pub queue: String,
    /// Task being scheduled.
    pub task_id: TaskId,
    /// Step the task runs; keys affinity labels and rate limits.
    pub step_id: StepId,
    /// Action a worker must support to run the task.
    pub action_id: ActionId,
    /// Scheduling deadline in milliseconds since epoch.
    pub schedule_timeout_at_ms: u128,
    /// Stickiness preference.
    pub sticky: StickyStrategy,
    /// Worker the item wants to stick to.
    pub desired_worker_id: Option<WorkerId>,
    /// Higher values are listed first within a queue.
    pub priority: i32,
}

impl QueueItem {
    /// True once the scheduling deadline has passed.
    pub const fn is_timed_out(&self, now_ms: u128) -> bool {
        self.schedule_timeout_at_ms <= now_ms
    }
}

/// Minimal record persisted for one assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    /// Queue item being dequeued.
    pub queue_item_id: QueueItemId,
    /// Task being assigned.
    pub task_id: TaskId,
    /// Worker receiving the task.
    pub worker_id: WorkerId,
}

/// Outcome of persisting one sub-batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkProcessedResult {
    /// Queue items whose assignment or timeout was committed.
    pub succeeded: Vec<QueueItemId>,
    /// Queue items that could not be committed. Assigned ones must release
    /// their slots; all of them stay pending.
    pub failed: Vec<QueueItemId>,
}

/// Lease listing and arbitration.
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// Workers currently connected for the tenant.
    async fn list_active_workers(&self, tenant_id: &str) -> AppResult<Vec<ActiveWorker>>;

    /// Queues declared for the tenant.
    async fn list_queues(&self, tenant_id: &str) -> AppResult<Vec<QueueDescriptor>>;

    /// Acquire leases on `resource_ids`, extending any of `existing` that are still
    /// ours. Returns only the leases actually held afterwards.
    async fn acquire_or_extend_leases(
        &self,
        tenant_id: &str,
        kind: LeaseKind,
        resource_ids: &[String],
        existing: &[Lease],
    ) -> AppResult<Vec<Lease>>;

    /// Release leases held by this instance.
    async fn release_leases(&self, tenant_id: &str, leases: &[Lease]) -> AppResult<()>;
}

/// Worker capacity and affinity lookups.
#[async_trait]
pub trait CapacityRepository: Send + Sync {
    /// Which actions each listed worker advertises.
    async fn list_actions_for_workers(
        &self,
        tenant_id: &str,
        worker_ids: &[WorkerId],
    ) -> AppResult<Vec<WorkerAction>>;

    /// Free capacity per worker, as (worker id, count) pairs.
    async fn list_available_slots_for_workers(
        &self,
        tenant_id: &str,
        worker_ids: &[WorkerId],
    ) -> AppResult<Vec<(WorkerId, u32)>>;

    /// Affinity labels declared by each step. Steps without labels may be omitted.
    async fn get_desired_labels(
        &self,
        tenant_id: &str,
        step_ids: &[StepId],
    ) -> AppResult<HashMap<StepId, Vec<DesiredLabel>>>;
}

/// Queue backlog reads and assignment persistence.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Up to `limit` pending items of `queue`, ordered by priority then id,
    /// skipping ids at or below `after_id`.
    async fn list_queue_items(
        &self,
        tenant_id: &str,
        queue: &str,
        after_id: Option<QueueItemId>,
        limit: usize,
    ) -> AppResult<Vec<QueueItem>>;

    /// Persist assignments and scheduling timeouts in one transaction.
    async fn mark_queue_items_processed(
        &self,
        tenant_id: &str,
        assignments: &[AssignmentRecord],
        timed_out: &[QueueItem],
    ) -> AppResult<MarkProcessedResult>;

    /// Advance the queue's low watermark past resolved items.
    async fn update_min_unprocessed_id(&self, tenant_id: &str, queue: &str) -> AppResult<()>;
}

/// Outcome of a rate-limit reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Units were reserved; resolve with [`RateLimiter::ack`] or [`RateLimiter::nack`].
    Allowed,
    /// A key has no budget left. Nothing was reserved.
    Exceeded {
        /// Key that ran out.
        key: String,
        /// When the key is expected to refill, in milliseconds since epoch.
        next_refill_at_ms: Option<u128>,
    },
}

/// Rate-limit reservations keyed by task.
///
/// Every [`RateLimitDecision::Allowed`] reservation is resolved exactly once,
/// by `ack` when the assignment is persisted or `nack` when it is abandoned.
pub trait RateLimiter: Send + Sync {
    /// Reserve the budget the task's step consumes.
    fn use_limits(&self, tenant_id: &str, task_id: TaskId, step_id: &str) -> RateLimitDecision;

    /// Commit a reservation.
    fn ack(&self, task_id: TaskId);

    /// Return a reservation's units to the budget.
    fn nack(&self, task_id: TaskId);
}
