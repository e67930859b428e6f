//! In-memory lease, capacity and queue-backlog store.
//!
//! Suitable for tests and single-process deployments. Several scheduler
//! instances may share one store through an `Arc`; lease arbitration then
//! works across them exactly as it would against a database.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::core::repository::{
    ActiveWorker, AssignmentRecord, CapacityRepository, Lease, LeaseRepository,
    MarkProcessedResult, QueueDescriptor, QueueItem, QueueRepository, WorkerAction,
};
use crate::core::AppResult;
use crate::util::clock::{deadline_after, now_ms};
use crate::util::types::{
    ActionId, DesiredLabel, LeaseKind, QueueItemId, StepId, StickyStrategy, TaskId, TenantId,
    WorkerId,
};

/// Default lease lifetime.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

struct WorkerRecord {
    worker: ActiveWorker,
    actions: BTreeSet<ActionId>,
    running: BTreeSet<TaskId>,
}

impl WorkerRecord {
    fn available(&self) -> u32 {
        let running = u32::try_from(self.running.len()).unwrap_or(u32::MAX);
        self.worker.max_runs.saturating_sub(running)
    }
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<QueueItemId, QueueItem>,
    /// Every pending id is at or above this.
    min_unprocessed: QueueItemId,
}

#[derive(Default)]
struct Faults {
    fail_listing: bool,
    fail_leasing: bool,
    fail_mark_processed: bool,
    rejected: HashSet<QueueItemId>,
}

#[derive(Default)]
struct StoreState {
    workers: BTreeMap<(TenantId, WorkerId), WorkerRecord>,
    queues: BTreeMap<(TenantId, String), QueueState>,
    leases: HashMap<(TenantId, LeaseKind, String), Lease>,
    desired_labels: HashMap<(TenantId, StepId), Vec<DesiredLabel>>,
    assignments: Vec<(TenantId, AssignmentRecord)>,
    timed_out: Vec<(TenantId, QueueItemId)>,
    next_item_id: QueueItemId,
    next_lease_id: i64,
    faults: Faults,
}

/// Shared in-memory implementation of the lease, capacity and queue contracts.
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    lease_ttl: Duration,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store with the default lease lifetime.
    pub fn new() -> Self {
        Self::with_lease_ttl(DEFAULT_LEASE_TTL)
    }

    /// Create an empty store whose leases live for `lease_ttl`.
    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_item_id: 1,
                next_lease_id: 1,
                ..StoreState::default()
            }),
            lease_ttl,
        }
    }

    // ==================================================================
    // Registry
    // ==================================================================

    /// Connect a worker advertising `actions`. Its capacity is `max_runs`.
    pub fn register_worker(&self, tenant_id: &str, worker: ActiveWorker, actions: &[&str]) {
        let mut state = self.state.lock();
        let key = (tenant_id.to_owned(), worker.id.clone());
        let running = state
            .workers
            .remove(&key)
            .map(|r| r.running)
            .unwrap_or_default();
        state.workers.insert(
            key,
            WorkerRecord {
                worker,
                actions: actions.iter().map(|a| (*a).to_owned()).collect(),
                running,
            },
        );
    }

    /// Disconnect a worker.
    pub fn remove_worker(&self, tenant_id: &str, worker_id: &str) -> bool {
        self.state
            .lock()
            .workers
            .remove(&(tenant_id.to_owned(), worker_id.to_owned()))
            .is_some()
    }

    /// Declare a queue. Enqueueing declares queues implicitly.
    pub fn declare_queue(&self, tenant_id: &str, queue: &str) {
        self.state
            .lock()
            .queues
            .entry((tenant_id.to_owned(), queue.to_owned()))
            .or_default();
    }

    /// Set the affinity labels of a step.
    pub fn set_desired_labels(&self, tenant_id: &str, step_id: &str, labels: Vec<DesiredLabel>) {
        self.state
            .lock()
            .desired_labels
            .insert((tenant_id.to_owned(), step_id.to_owned()), labels);
    }

    /// Append `item` to its queue under a fresh id and return the stored copy.
    pub fn enqueue_item(&self, mut item: QueueItem) -> QueueItem {
        let mut state = self.state.lock();
        item.id = state.next_item_id;
        state.next_item_id += 1;
        let queue = state
            .queues
            .entry((item.tenant_id.clone(), item.queue.clone()))
            .or_default();
        if queue.pending.is_empty() && queue.min_unprocessed < item.id {
            queue.min_unprocessed = item.id;
        }
        queue.pending.insert(item.id, item.clone());
        item
    }

    /// Enqueue a plain task: no stickiness, priority 0, no deadline.
    pub fn enqueue(
        &self,
        tenant_id: &str,
        queue: &str,
        task_id: TaskId,
        step_id: &str,
        action_id: &str,
    ) -> QueueItem {
        self.enqueue_item(QueueItem {
            id: 0,
            tenant_id: tenant_id.to_owned(),
            queue: queue.to_owned(),
            task_id,
            step_id: step_id.to_owned(),
            action_id: action_id.to_owned(),
            schedule_timeout_at_ms: deadline_after(Duration::from_secs(3600)),
            sticky: StickyStrategy::None,
            desired_worker_id: None,
            priority: 0,
        })
    }

    /// A task finished on `worker_id`, freeing one unit of its capacity.
    pub fn complete_task(&self, tenant_id: &str, worker_id: &str, task_id: TaskId) -> bool {
        self.state
            .lock()
            .workers
            .get_mut(&(tenant_id.to_owned(), worker_id.to_owned()))
            .is_some_and(|r| r.running.remove(&task_id))
    }

    // ==================================================================
    // Introspection
    // ==================================================================

    /// Items still waiting in `queue`.
    pub fn pending_count(&self, tenant_id: &str, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(&(tenant_id.to_owned(), queue.to_owned()))
            .map_or(0, |q| q.pending.len())
    }

    /// Low watermark of `queue`.
    pub fn min_unprocessed_id(&self, tenant_id: &str, queue: &str) -> Option<QueueItemId> {
        self.state
            .lock()
            .queues
            .get(&(tenant_id.to_owned(), queue.to_owned()))
            .map(|q| q.min_unprocessed)
    }

    /// Every committed assignment of the tenant, in commit order.
    pub fn assignments(&self, tenant_id: &str) -> Vec<AssignmentRecord> {
        self.state
            .lock()
            .assignments
            .iter()
            .filter(|(t, _)| t == tenant_id)
            .map(|(_, a)| a.clone())
            .collect()
    }

    /// Items recorded as scheduling-timed-out.
    pub fn timed_out_items(&self, tenant_id: &str) -> Vec<QueueItemId> {
        self.state
            .lock()
            .timed_out
            .iter()
            .filter(|(t, _)| t == tenant_id)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Tasks currently running on a worker.
    pub fn running_tasks(&self, tenant_id: &str, worker_id: &str) -> usize {
        self.state
            .lock()
            .workers
            .get(&(tenant_id.to_owned(), worker_id.to_owned()))
            .map_or(0, |r| r.running.len())
    }

    /// Live lease on a resource, if any.
    pub fn lease_on(&self, tenant_id: &str, kind: LeaseKind, resource_id: &str) -> Option<Lease> {
        let now = now_ms();
        self.state
            .lock()
            .leases
            .get(&(tenant_id.to_owned(), kind, resource_id.to_owned()))
            .filter(|l| l.expires_at_ms > now)
            .cloned()
    }

    /// Expire every lease immediately, as if their holders stopped renewing.
    pub fn expire_all_leases(&self) {
        for lease in self.state.lock().leases.values_mut() {
            lease.expires_at_ms = 0;
        }
    }

    // ==================================================================
    // Fault injection
    // ==================================================================

    /// Make worker, queue and backlog listings fail.
    pub fn set_fail_listing(&self, fail: bool) {
        self.state.lock().faults.fail_listing = fail;
    }

    /// Make lease acquisition fail.
    pub fn set_fail_leasing(&self, fail: bool) {
        self.state.lock().faults.fail_leasing = fail;
    }

    /// Make assignment persistence fail as a whole.
    pub fn set_fail_mark_processed(&self, fail: bool) {
        self.state.lock().faults.fail_mark_processed = fail;
    }

    /// Reject the assignment or timeout of specific items while committing
    /// the rest.
    pub fn reject_items(&self, ids: &[QueueItemId]) {
        self.state.lock().faults.rejected.extend(ids.iter().copied());
    }
}

#[async_trait]
impl LeaseRepository for InMemoryStore {
    async fn list_active_workers(&self, tenant_id: &str) -> AppResult<Vec<ActiveWorker>> {
        let state = self.state.lock();
        if state.faults.fail_listing {
            bail!("injected failure: list active workers");
        }
        Ok(state
            .workers
            .iter()
            .filter(|((t, _), _)| t == tenant_id)
            .map(|(_, r)| r.worker.clone())
            .collect())
    }

    async fn list_queues(&self, tenant_id: &str) -> AppResult<Vec<QueueDescriptor>> {
        let state = self.state.lock();
        if state.faults.fail_listing {
            bail!("injected failure: list queues");
        }
        Ok(state
            .queues
            .keys()
            .filter(|(t, _)| t == tenant_id)
            .map(|(_, name)| QueueDescriptor { name: name.clone() })
            .collect())
    }

    async fn acquire_or_extend_leases(
        &self,
        tenant_id: &str,
        kind: LeaseKind,
        resource_ids: &[String],
        existing: &[Lease],
    ) -> AppResult<Vec<Lease>> {
        let mut guard = self.state.lock();
        if guard.faults.fail_leasing {
            bail!("injected failure: acquire {} leases", kind.as_str());
        }
        let state = &mut *guard;

        let now = now_ms();
        let expires_at_ms = deadline_after(self.lease_ttl);
        let ours: HashSet<i64> = existing.iter().map(|l| l.id).collect();
        let mut acquired = Vec::with_capacity(resource_ids.len());

        for resource_id in resource_ids {
            let key = (tenant_id.to_owned(), kind, resource_id.clone());
            let lease = match state.leases.get(&key) {
                Some(current) if current.expires_at_ms > now && !ours.contains(&current.id) => {
                    continue;
                }
                Some(current) if ours.contains(&current.id) => Lease {
                    expires_at_ms,
                    ..current.clone()
                },
                _ => {
                    let id = state.next_lease_id;
                    state.next_lease_id += 1;
                    Lease {
                        id,
                        tenant_id: tenant_id.to_owned(),
                        kind,
                        resource_id: resource_id.clone(),
                        expires_at_ms,
                    }
                }
            };
            state.leases.insert(key, lease.clone());
            acquired.push(lease);
        }
        Ok(acquired)
    }

    async fn release_leases(&self, tenant_id: &str, leases: &[Lease]) -> AppResult<()> {
        let mut state = self.state.lock();
        for lease in leases {
            let key = (tenant_id.to_owned(), lease.kind, lease.resource_id.clone());
            if state.leases.get(&key).is_some_and(|l| l.id == lease.id) {
                state.leases.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CapacityRepository for InMemoryStore {
    async fn list_actions_for_workers(
        &self,
        tenant_id: &str,
        worker_ids: &[WorkerId],
    ) -> AppResult<Vec<WorkerAction>> {
        let state = self.state.lock();
        if state.faults.fail_listing {
            bail!("injected failure: list actions for workers");
        }
        let mut out = Vec::new();
        for worker_id in worker_ids {
            let Some(record) = state.workers.get(&(tenant_id.to_owned(), worker_id.clone())) else {
                continue;
            };
            out.extend(record.actions.iter().map(|action_id| WorkerAction {
                worker_id: worker_id.clone(),
                action_id: action_id.clone(),
            }));
        }
        Ok(out)
    }

    async fn list_available_slots_for_workers(
        &self,
        tenant_id: &str,
        worker_ids: &[WorkerId],
    ) -> AppResult<Vec<(WorkerId, u32)>> {
        let state = self.state.lock();
        if state.faults.fail_listing {
            bail!("injected failure: list available slots");
        }
        Ok(worker_ids
            .iter()
            .filter_map(|w| {
                state
                    .workers
                    .get(&(tenant_id.to_owned(), w.clone()))
                    .map(|r| (w.clone(), r.available()))
            })
            .collect())
    }

    async fn get_desired_labels(
        &self,
        tenant_id: &str,
        step_ids: &[StepId],
    ) -> AppResult<HashMap<StepId, Vec<DesiredLabel>>> {
        let state = self.state.lock();
        Ok(step_ids
            .iter()
            .filter_map(|s| {
                state
                    .desired_labels
                    .get(&(tenant_id.to_owned(), s.clone()))
                    .map(|labels| (s.clone(), labels.clone()))
            })
            .collect())
    }
}

#[async_trait]
impl QueueRepository for InMemoryStore {
    async fn list_queue_items(
        &self,
        tenant_id: &str,
        queue: &str,
        after_id: Option<QueueItemId>,
        limit: usize,
    ) -> AppResult<Vec<QueueItem>> {
        let state = self.state.lock();
        if state.faults.fail_listing {
            bail!("injected failure: list queue items");
        }
        let Some(q) = state.queues.get(&(tenant_id.to_owned(), queue.to_owned())) else {
            return Ok(Vec::new());
        };
        let from = after_id.map_or(q.min_unprocessed, |id| id.saturating_add(1));
        let mut items: Vec<QueueItem> = q.pending.range(from..).map(|(_, i)| i.clone()).collect();
        items.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        items.truncate(limit);
        Ok(items)
    }

    async fn mark_queue_items_processed(
        &self,
        tenant_id: &str,
        assignments: &[AssignmentRecord],
        timed_out: &[QueueItem],
    ) -> AppResult<MarkProcessedResult> {
        let mut guard = self.state.lock();
        if guard.faults.fail_mark_processed {
            bail!("injected failure: mark queue items processed");
        }
        let state = &mut *guard;
        let mut result = MarkProcessedResult::default();

        for record in assignments {
            let queue_key = state
                .queues
                .iter()
                .find(|((t, _), q)| t == tenant_id && q.pending.contains_key(&record.queue_item_id))
                .map(|(k, _)| k.clone());
            let worker = state
                .workers
                .get_mut(&(tenant_id.to_owned(), record.worker_id.clone()));

            let committed = match (queue_key, worker) {
                (Some(queue_key), Some(worker))
                    if worker.available() > 0
                        && !state.faults.rejected.contains(&record.queue_item_id) =>
                {
                    worker.running.insert(record.task_id);
                    if let Some(q) = state.queues.get_mut(&queue_key) {
                        q.pending.remove(&record.queue_item_id);
                    }
                    true
                }
                _ => false,
            };

            if committed {
                state
                    .assignments
                    .push((tenant_id.to_owned(), record.clone()));
                result.succeeded.push(record.queue_item_id);
            } else {
                result.failed.push(record.queue_item_id);
            }
        }

        for item in timed_out {
            if state.faults.rejected.contains(&item.id) {
                result.failed.push(item.id);
                continue;
            }
            result.succeeded.push(item.id);
            if let Some(q) = state
                .queues
                .get_mut(&(tenant_id.to_owned(), item.queue.clone()))
            {
                if q.pending.remove(&item.id).is_some() {
                    state.timed_out.push((tenant_id.to_owned(), item.id));
                }
            }
        }
        Ok(result)
    }

    async fn update_min_unprocessed_id(&self, tenant_id: &str, queue: &str) -> AppResult<()> {
        let mut state = self.state.lock();
        let next_item_id = state.next_item_id;
        if let Some(q) = state.queues.get_mut(&(tenant_id.to_owned(), queue.to_owned())) {
            q.min_unprocessed = q.pending.keys().next().copied().unwrap_or(next_item_id);
        }
        Ok(())
    }
}
