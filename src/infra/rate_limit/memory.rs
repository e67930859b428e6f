//! In-memory rate limiter with fixed-window unit budgets.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::repository::{RateLimitDecision, RateLimiter};
use crate::util::clock::now_ms;
use crate::util::types::{StepId, TaskId, TenantId};

struct Budget {
    limit: u32,
    window: Duration,
    window_started_ms: u128,
    committed: u32,
    reserved: u32,
}

impl Budget {
    fn roll(&mut self, now: u128) {
        if now >= self.refill_at_ms() {
            self.window_started_ms = now;
            self.committed = 0;
        }
    }

    fn refill_at_ms(&self) -> u128 {
        self.window_started_ms + self.window.as_millis()
    }

    fn remaining(&self) -> u32 {
        self.limit
            .saturating_sub(self.committed)
            .saturating_sub(self.reserved)
    }
}

type BudgetKey = (TenantId, String);

struct Reservation {
    tenant_id: TenantId,
    units: Vec<(String, u32)>,
}

#[derive(Default)]
struct LimiterState {
    budgets: HashMap<BudgetKey, Budget>,
    step_units: HashMap<(TenantId, StepId), Vec<(String, u32)>>,
    reservations: HashMap<TaskId, Reservation>,
}

/// Per-key unit budgets that refill at the end of each window.
///
/// A step consumes a fixed number of units from one or more keys. Units are
/// reserved by [`RateLimiter::use_limits`], kept by `ack` and returned by
/// `nack`. Steps without configured units are never limited.
#[derive(Default)]
pub struct InMemoryRateLimiter {
    state: Mutex<LimiterState>,
}

impl InMemoryRateLimiter {
    /// Create a limiter with no budgets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `limit` units of `key` per `window`.
    pub fn set_limit(&self, tenant_id: &str, key: &str, limit: u32, window: Duration) {
        self.state.lock().budgets.insert(
            (tenant_id.to_owned(), key.to_owned()),
            Budget {
                limit,
                window,
                window_started_ms: now_ms(),
                committed: 0,
                reserved: 0,
            },
        );
    }

    /// Declare the units each run of `step_id` consumes.
    pub fn set_step_units(&self, tenant_id: &str, step_id: &str, units: &[(&str, u32)]) {
        self.state.lock().step_units.insert(
            (tenant_id.to_owned(), step_id.to_owned()),
            units.iter().map(|(k, n)| ((*k).to_owned(), *n)).collect(),
        );
    }

    /// Units still available for `key` in the current window.
    pub fn remaining(&self, tenant_id: &str, key: &str) -> Option<u32> {
        let now = now_ms();
        let mut state = self.state.lock();
        let budget = state
            .budgets
            .get_mut(&(tenant_id.to_owned(), key.to_owned()))?;
        budget.roll(now);
        Some(budget.remaining())
    }

    /// Reservations not yet acked or nacked.
    pub fn in_flight(&self) -> usize {
        self.state.lock().reservations.len()
    }

    fn resolve(&self, task_id: TaskId, commit: bool) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(reservation) = state.reservations.remove(&task_id) else {
            return;
        };
        for (key, units) in reservation.units {
            if let Some(budget) = state.budgets.get_mut(&(reservation.tenant_id.clone(), key)) {
                budget.reserved = budget.reserved.saturating_sub(units);
                if commit {
                    budget.committed = budget.committed.saturating_add(units);
                }
            }
        }
    }
}

impl RateLimiter for InMemoryRateLimiter {
    fn use_limits(&self, tenant_id: &str, task_id: TaskId, step_id: &str) -> RateLimitDecision {
        let now = now_ms();
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(units) = state
            .step_units
            .get(&(tenant_id.to_owned(), step_id.to_owned()))
        else {
            return RateLimitDecision::Allowed;
        };

        for (key, needed) in units {
            let Some(budget) = state.budgets.get_mut(&(tenant_id.to_owned(), key.clone())) else {
                continue;
            };
            budget.roll(now);
            if budget.remaining() < *needed {
                return RateLimitDecision::Exceeded {
                    key: key.clone(),
                    next_refill_at_ms: Some(budget.refill_at_ms()),
                };
            }
        }

        for (key, needed) in units {
            if let Some(budget) = state.budgets.get_mut(&(tenant_id.to_owned(), key.clone())) {
                budget.reserved = budget.reserved.saturating_add(*needed);
            }
        }
        state.reservations.insert(
            task_id,
            Reservation {
                tenant_id: tenant_id.to_owned(),
                units: units.clone(),
            },
        );
        RateLimitDecision::Allowed
    }

    fn ack(&self, task_id: TaskId) {
        self.resolve(task_id, true);
    }

    fn nack(&self, task_id: TaskId) {
        self.resolve(task_id, false);
    }
}
