//! Assignment of queue items to slots.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::rank::candidate_slots;
use super::slot::{AckHandle, RateLimitReservation, Slot};
use super::Scheduler;
use crate::core::repository::{ActiveWorker, QueueItem, RateLimitDecision};
use crate::core::SchedulerError;
use crate::util::clock::now_ms;
use crate::util::types::{ActionId, DesiredLabel, StepId, WorkerId};

/// A queue item bound to a claimed slot.
///
/// The handle must be resolved once the assignment is persisted (`ack`) or
/// abandoned (`nack`); dropping it unresolved nacks.
#[derive(Debug)]
pub struct AssignedItem {
    /// The item being assigned.
    pub queue_item: QueueItem,
    /// Worker owning the claimed slot.
    pub worker_id: WorkerId,
    /// Resolves the slot and any rate-limit reservation.
    pub ack: AckHandle,
}

/// A queue item vetoed by the rate limiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitedItem {
    /// The vetoed item.
    pub queue_item: QueueItem,
    /// Rate-limit key that ran out.
    pub key: String,
    /// When the key is expected to refill, in milliseconds since epoch.
    pub next_refill_at_ms: Option<u128>,
}

/// Output of one scheduling pass. Every input item lands in exactly one list.
#[derive(Default)]
pub struct AssignResults {
    /// Items bound to a slot.
    pub assigned: Vec<AssignedItem>,
    /// Items with no eligible free slot.
    pub unassigned: Vec<QueueItem>,
    /// Items whose scheduling deadline passed.
    pub scheduling_timed_out: Vec<QueueItem>,
    /// Items vetoed by the rate limiter.
    pub rate_limited: Vec<RateLimitedItem>,
}

impl AssignResults {
    /// Total number of items accounted for.
    pub fn len(&self) -> usize {
        self.assigned.len()
            + self.unassigned.len()
            + self.scheduling_timed_out.len()
            + self.rate_limited.len()
    }

    /// True when no item was accounted for.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append another pass's results.
    pub fn merge(&mut self, other: Self) {
        self.assigned.extend(other.assigned);
        self.unassigned.extend(other.unassigned);
        self.scheduling_timed_out.extend(other.scheduling_timed_out);
        self.rate_limited.extend(other.rate_limited);
    }
}

impl fmt::Debug for AssignResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssignResults")
            .field("assigned", &self.assigned.len())
            .field("unassigned", &self.unassigned.len())
            .field("scheduling_timed_out", &self.scheduling_timed_out.len())
            .field("rate_limited", &self.rate_limited.len())
            .finish()
    }
}

enum SingletonOutcome {
    Assigned(AckHandle, WorkerId),
    NoSlot,
    RateLimited {
        key: String,
        next_refill_at_ms: Option<u128>,
    },
}

impl Scheduler {
    /// Assign a mixed set of queue items.
    ///
    /// Items are grouped by action and each group is assigned as one batch.
    /// Affinity labels are looked up once for all steps involved; if that
    /// lookup fails nothing is assigned.
    pub async fn try_assign(&self, items: Vec<QueueItem>) -> Result<AssignResults, SchedulerError> {
        if items.is_empty() {
            return Ok(AssignResults::default());
        }

        let mut step_ids: Vec<StepId> = items.iter().map(|i| i.step_id.clone()).collect();
        step_ids.sort();
        step_ids.dedup();
        let labels = self
            .capacity
            .get_desired_labels(&self.tenant_id, &step_ids)
            .await
            .map_err(|e| SchedulerError::backend("get desired labels", &e))?;

        let mut by_action: BTreeMap<ActionId, Vec<QueueItem>> = BTreeMap::new();
        for item in items {
            by_action.entry(item.action_id.clone()).or_default().push(item);
        }

        let mut results = AssignResults::default();
        for (action_id, batch) in by_action {
            results.merge(self.try_assign_batch(&action_id, batch, &labels, 0));
        }
        Ok(results)
    }

    /// Assign items of a single action, in order.
    ///
    /// Each item sees the slot list rotated by `ring_offset` before ranking,
    /// so stickiness and affinity still decide first and the offset only
    /// spreads equally ranked slots. The offset advances after every
    /// successful claim so consecutive items fan out across workers.
    pub fn try_assign_batch(
        &self,
        action_id: &str,
        items: Vec<QueueItem>,
        labels: &HashMap<StepId, Vec<DesiredLabel>>,
        mut ring_offset: usize,
    ) -> AssignResults {
        let now = now_ms();
        let mut results = AssignResults::default();
        let (timed_out, live): (Vec<QueueItem>, Vec<QueueItem>) =
            items.into_iter().partition(|i| i.is_timed_out(now));
        results.scheduling_timed_out = timed_out;
        if live.is_empty() {
            return results;
        }

        let workers = self.workers_snapshot();
        let pool = self.pool.actions.read();
        let Some(cell) = pool.get(action_id) else {
            tracing::debug!(
                tenant = %self.tenant_id,
                action = action_id,
                count = live.len(),
                "no slots for action"
            );
            results.unassigned = live;
            return results;
        };
        let action = cell.lock();

        for item in live {
            let desired = labels.get(&item.step_id).map_or(&[][..], Vec::as_slice);
            match self.try_assign_singleton(&action.slots, &item, desired, &workers, ring_offset) {
                SingletonOutcome::Assigned(ack, worker_id) => {
                    ring_offset = ring_offset.wrapping_add(1);
                    results.assigned.push(AssignedItem {
                        queue_item: item,
                        worker_id,
                        ack,
                    });
                }
                SingletonOutcome::NoSlot => results.unassigned.push(item),
                SingletonOutcome::RateLimited {
                    key,
                    next_refill_at_ms,
                } => results.rate_limited.push(RateLimitedItem {
                    queue_item: item,
                    key,
                    next_refill_at_ms,
                }),
            }
        }

        tracing::trace!(
            tenant = %self.tenant_id,
            action = action_id,
            assigned = results.assigned.len(),
            unassigned = results.unassigned.len(),
            rate_limited = results.rate_limited.len(),
            "assigned batch"
        );
        results
    }

    fn try_assign_singleton(
        &self,
        slots: &[Arc<Slot>],
        item: &QueueItem,
        desired: &[DesiredLabel],
        workers: &HashMap<WorkerId, ActiveWorker>,
        ring_offset: usize,
    ) -> SingletonOutcome {
        let start = if slots.is_empty() { 0 } else { ring_offset % slots.len() };
        let rotated: Vec<Arc<Slot>> = slots[start..]
            .iter()
            .chain(&slots[..start])
            .cloned()
            .collect();
        let candidates = candidate_slots(&rotated, item, desired, workers);
        if !candidates.iter().any(|s| s.is_active()) {
            return SingletonOutcome::NoSlot;
        }

        let reservation = match &self.rate_limiter {
            None => None,
            Some(limiter) => {
                match limiter.use_limits(&self.tenant_id, item.task_id, &item.step_id) {
                    RateLimitDecision::Allowed => {
                        Some(RateLimitReservation::new(Arc::clone(limiter), item.task_id))
                    }
                    RateLimitDecision::Exceeded {
                        key,
                        next_refill_at_ms,
                    } => {
                        return SingletonOutcome::RateLimited {
                            key,
                            next_refill_at_ms,
                        }
                    }
                }
            }
        };

        for slot in &candidates {
            // A lost race is not an error; move on to the next candidate.
            if slot.is_active() && slot.try_claim() {
                let worker_id = slot.worker_id().to_owned();
                return SingletonOutcome::Assigned(
                    AckHandle::new(Arc::clone(slot), reservation),
                    worker_id,
                );
            }
        }

        if let Some(r) = reservation {
            r.nack();
        }
        SingletonOutcome::NoSlot
    }
}
