//! Per-action slot lists and the pool that owns them.
//!
//! Lock order, everywhere: the pool lock (`ActionPool::actions`) first, then
//! per-action locks in ascending action-id order. The worker map is never
//! held while either is taken; callers snapshot it beforehand.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use super::slot::{Slot, SlotState};
use crate::util::types::ActionId;

/// Slot list of one action.
#[derive(Debug)]
pub(crate) struct Action {
    pub(crate) id: ActionId,
    pub(crate) slots: Vec<Arc<Slot>>,
    pub(crate) last_replenished_slot_count: usize,
    pub(crate) last_replenished_worker_count: usize,
}

impl Action {
    pub(crate) const fn new(id: ActionId) -> Self {
        Self {
            id,
            slots: Vec::new(),
            last_replenished_slot_count: 0,
            last_replenished_worker_count: 0,
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_active()).count()
    }

    pub(crate) fn used_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state() != SlotState::Free)
            .count()
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.slots
            .iter()
            .map(|s| s.worker_id())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Replenish when nothing is claimable, when half of the last replenished
    /// slots are in use, or when more workers advertise the action than at the
    /// last replenish.
    pub(crate) fn needs_replenish(&self, advertising_workers: usize) -> bool {
        if self.active_count() == 0 {
            return true;
        }
        if self.last_replenished_slot_count > 0
            && self.used_count() * 2 >= self.last_replenished_slot_count
        {
            return true;
        }
        advertising_workers > self.last_replenished_worker_count
    }

    pub(crate) fn stats(&self) -> ActionStats {
        let mut stats = ActionStats {
            slots: self.slots.len(),
            workers: self.worker_count(),
            ..ActionStats::default()
        };
        for slot in &self.slots {
            match slot.state() {
                SlotState::Free if !slot.is_expired() => stats.active += 1,
                SlotState::Free => {}
                SlotState::Used => stats.unacked += 1,
                SlotState::Acknowledged => stats.acknowledged += 1,
            }
        }
        stats
    }
}

/// Point-in-time counters for one action's slot list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionStats {
    /// Slots in the list, whatever their state.
    pub slots: usize,
    /// Free, unexpired slots.
    pub active: usize,
    /// Claimed slots awaiting persistence.
    pub unacked: usize,
    /// Claimed and persisted slots.
    pub acknowledged: usize,
    /// Distinct workers backing the list.
    pub workers: usize,
}

pub(crate) type ActionCell = Arc<Mutex<Action>>;

/// Action id → slot list. Ordered so iteration follows the canonical lock order.
#[derive(Debug, Default)]
pub(crate) struct ActionPool {
    pub(crate) actions: RwLock<BTreeMap<ActionId, ActionCell>>,
}

/// Lock the requested actions in ascending id order.
///
/// The caller must hold the pool lock that produced `map` for as long as the
/// returned guards live. Unknown ids are skipped.
pub(crate) fn lock_in_order<'a, I>(
    map: &'a BTreeMap<ActionId, ActionCell>,
    ids: I,
) -> Vec<MutexGuard<'a, Action>>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let ordered: BTreeSet<String> = ids.into_iter().map(|id| id.as_ref().to_owned()).collect();
    ordered
        .iter()
        .filter_map(|id| map.get(id))
        .map(|cell| cell.lock())
        .collect()
}
