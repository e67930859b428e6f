//! Per-tenant slot scheduler.
//!
//! The scheduler keeps an approximate view of worker capacity as slot lists per
//! action, refreshed by [`Scheduler::replenish`], and assigns queue items to
//! those slots (see [`Scheduler::try_assign`]).

mod action;
mod assign;
mod rank;
mod slot;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::repository::{ActiveWorker, CapacityRepository, RateLimiter};
use crate::core::SchedulerError;
use crate::runtime::Spawn;
use crate::util::types::{ActionId, DispatcherId, TenantId, WorkerId};

use action::{lock_in_order, Action, ActionPool};

pub use action::ActionStats;
pub use assign::{AssignResults, AssignedItem, RateLimitedItem};
pub use slot::{AckHandle, Slot, SlotId, SlotState};

/// Slot scheduler for one tenant.
pub struct Scheduler {
    tenant_id: TenantId,
    capacity: Arc<dyn CapacityRepository>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    slot_ttl: Duration,
    /// Leased workers. Snapshotted (never held) while action locks are taken.
    workers: RwLock<Arc<HashMap<WorkerId, ActiveWorker>>>,
    pool: ActionPool,
    replenish_guard: tokio::sync::Mutex<()>,
}

impl Scheduler {
    /// Create a scheduler. Slots live for `slot_ttl` unless replenished.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        capacity: Arc<dyn CapacityRepository>,
        rate_limiter: Option<Arc<dyn RateLimiter>>,
        slot_ttl: Duration,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            capacity,
            rate_limiter,
            slot_ttl,
            workers: RwLock::new(Arc::new(HashMap::new())),
            pool: ActionPool::default(),
            replenish_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Tenant this scheduler serves.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Replace the leased worker set.
    pub fn set_workers(&self, workers: Vec<ActiveWorker>) {
        let map: HashMap<WorkerId, ActiveWorker> =
            workers.into_iter().map(|w| (w.id.clone(), w)).collect();
        *self.workers.write() = Arc::new(map);
    }

    /// Ids of the leased workers, sorted.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers_snapshot().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Dispatcher a leased worker is connected through.
    pub fn dispatcher_of(&self, worker_id: &str) -> Option<DispatcherId> {
        self.workers
            .read()
            .get(worker_id)
            .and_then(|w| w.dispatcher_id.clone())
    }

    fn workers_snapshot(&self) -> Arc<HashMap<WorkerId, ActiveWorker>> {
        Arc::clone(&self.workers.read())
    }

    /// Slot counters per action currently in the pool.
    pub fn action_stats(&self) -> BTreeMap<ActionId, ActionStats> {
        let pool = self.pool.actions.read();
        pool.iter()
            .map(|(id, cell)| (id.clone(), cell.lock().stats()))
            .collect()
    }

    /// Refresh slot lists from live capacity.
    ///
    /// Returns `Ok(false)` when skipped because another replenish is running;
    /// `force` waits for it instead.
    pub async fn replenish(&self, force: bool) -> Result<bool, SchedulerError> {
        let _guard = if force {
            self.replenish_guard.lock().await
        } else if let Ok(guard) = self.replenish_guard.try_lock() {
            guard
        } else {
            tracing::debug!(tenant = %self.tenant_id, "replenish already running, skipping");
            return Ok(false);
        };

        let workers = self.worker_ids();
        if workers.is_empty() {
            self.drop_all_actions();
            return Ok(true);
        }

        let advertised = self
            .capacity
            .list_actions_for_workers(&self.tenant_id, &workers)
            .await
            .map_err(|e| SchedulerError::backend("list actions for workers", &e))?;

        let live: HashSet<&str> = workers.iter().map(String::as_str).collect();
        let mut action_workers: BTreeMap<ActionId, BTreeSet<WorkerId>> = BTreeMap::new();
        for wa in advertised {
            if live.contains(wa.worker_id.as_str()) {
                action_workers
                    .entry(wa.action_id)
                    .or_default()
                    .insert(wa.worker_id);
            }
        }

        let to_replenish = self.actions_needing_replenish(&action_workers);
        let workers_to_query: BTreeSet<WorkerId> = to_replenish
            .iter()
            .filter_map(|a| action_workers.get(a))
            .flatten()
            .cloned()
            .collect();

        let available: HashMap<WorkerId, u32> = if workers_to_query.is_empty() {
            HashMap::new()
        } else {
            let ids: Vec<WorkerId> = workers_to_query.iter().cloned().collect();
            self.capacity
                .list_available_slots_for_workers(&self.tenant_id, &ids)
                .await
                .map_err(|e| SchedulerError::backend("list available slots", &e))?
                .into_iter()
                .collect()
        };

        self.apply_replenish(
            &live,
            &action_workers,
            &to_replenish,
            &workers_to_query,
            &available,
        );

        tracing::debug!(
            tenant = %self.tenant_id,
            replenished = to_replenish.len(),
            workers = workers_to_query.len(),
            "replenished slots"
        );
        Ok(true)
    }

    fn actions_needing_replenish(
        &self,
        action_workers: &BTreeMap<ActionId, BTreeSet<WorkerId>>,
    ) -> BTreeSet<ActionId> {
        let pool = self.pool.actions.read();
        action_workers
            .iter()
            .filter(|(id, advertisers)| {
                pool.get(*id)
                    .is_none_or(|cell| cell.lock().needs_replenish(advertisers.len()))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Rebuild slot lists under the pool lock.
    ///
    /// Every queried worker gets a fresh slot vector: its unacknowledged slots
    /// (expiry extended) plus `available - unacked` new free slots. That vector
    /// replaces the worker's previous slots in every action it advertises, so a
    /// worker's capacity is never counted twice. Slots of departed workers and
    /// expired free slots are dropped; empty actions leave the pool.
    fn apply_replenish(
        &self,
        live: &HashSet<&str>,
        action_workers: &BTreeMap<ActionId, BTreeSet<WorkerId>>,
        to_replenish: &BTreeSet<ActionId>,
        workers_to_query: &BTreeSet<WorkerId>,
        available: &HashMap<WorkerId, u32>,
    ) {
        let mut pool = self.pool.actions.write();
        for id in to_replenish {
            pool.entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Action::new(id.clone()))));
        }

        let mut empty: Vec<ActionId> = Vec::new();
        {
            let ids: Vec<ActionId> = pool.keys().cloned().collect();
            let mut guards = lock_in_order(&pool, &ids);

            let mut unacked: HashMap<&str, BTreeMap<SlotId, Arc<Slot>>> = HashMap::new();
            for guard in &guards {
                for slot in &guard.slots {
                    if slot.is_unacked() {
                        if let Some(w) = workers_to_query.get(slot.worker_id()) {
                            unacked
                                .entry(w.as_str())
                                .or_default()
                                .insert(slot.id(), Arc::clone(slot));
                        }
                    }
                }
            }

            let mut fresh: HashMap<&str, Vec<Arc<Slot>>> = HashMap::new();
            for worker_id in workers_to_query {
                let carried: Vec<Arc<Slot>> = unacked
                    .remove(worker_id.as_str())
                    .map(|m| m.into_values().collect())
                    .unwrap_or_default();
                for slot in &carried {
                    slot.extend_expiry(self.slot_ttl);
                }
                let capacity = available.get(worker_id).copied().unwrap_or(0) as usize;
                let new_free = capacity.saturating_sub(carried.len());
                let mut slots = carried;
                slots.extend(
                    (0..new_free).map(|_| Arc::new(Slot::new(worker_id.clone(), self.slot_ttl))),
                );
                fresh.insert(worker_id.as_str(), slots);
            }

            let kept: HashSet<SlotId> = fresh.values().flatten().map(|s| s.id()).collect();
            let mut rng = rand::rng();
            for guard in &mut guards {
                let advertisers = action_workers.get(&guard.id);
                let mut slots: Vec<Arc<Slot>> = Vec::with_capacity(guard.slots.len());
                for slot in guard.slots.drain(..) {
                    let worker_id = slot.worker_id();
                    let replaced = fresh.contains_key(worker_id);
                    let advertised = advertisers.is_some_and(|a| a.contains(worker_id));
                    if replaced || !advertised || !live.contains(worker_id) {
                        if !kept.contains(&slot.id()) && slot.state() == SlotState::Free {
                            slot.expire();
                        }
                        continue;
                    }
                    if slot.state() == SlotState::Free && slot.is_expired() {
                        continue;
                    }
                    slots.push(slot);
                }

                let mut added = false;
                for worker_id in advertisers.into_iter().flatten() {
                    if let Some(worker_slots) = fresh.get(worker_id.as_str()) {
                        slots.extend(worker_slots.iter().cloned());
                        added = true;
                    }
                }
                if added {
                    slots.shuffle(&mut rng);
                }
                if to_replenish.contains(&guard.id) {
                    guard.last_replenished_slot_count = slots.len();
                    guard.last_replenished_worker_count = advertisers.map_or(0, BTreeSet::len);
                }
                guard.slots = slots;
                if guard.slots.is_empty() {
                    empty.push(guard.id.clone());
                }
            }
        }

        for id in empty {
            pool.remove(&id);
        }
    }

    fn drop_all_actions(&self) {
        let mut pool = self.pool.actions.write();
        {
            let ids: Vec<ActionId> = pool.keys().cloned().collect();
            for guard in lock_in_order(&pool, &ids) {
                for slot in &guard.slots {
                    if slot.state() == SlotState::Free {
                        slot.expire();
                    }
                }
            }
        }
        pool.clear();
    }

    /// Start the periodic replenish loop.
    pub fn start_replenish_loop<S: Spawn>(
        self: &Arc<Self>,
        spawner: &S,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let scheduler = Arc::clone(self);
        spawner.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = scheduler.replenish(false).await {
                    tracing::error!(tenant = %scheduler.tenant_id, "replenish failed: {e}");
                }
            }
            tracing::debug!(tenant = %scheduler.tenant_id, "replenish loop stopped");
        });
    }
}
