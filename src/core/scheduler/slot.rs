//! Slot records and the handles that resolve a claimed slot.
//!
//! A slot is one unit of execution capacity on one worker, shared by every
//! action list the worker advertises. Its lifecycle is a single atomic byte:
//!
//! ```text
//! free --claim--> used --ack--> acknowledged
//!   ^               |
//!   +-----nack------+
//! ```
//!
//! Expiry is tracked separately: an expired slot can no longer be claimed,
//! but a used slot keeps its state until acked or nacked.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::repository::RateLimiter;
use crate::util::clock::now_ms;
use crate::util::types::{TaskId, WorkerId};

const FREE: u8 = 0;
const USED: u8 = 1;
const ACKED: u8 = 2;

/// Observable state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Claimable.
    Free,
    /// Claimed; assignment not yet persisted.
    Used,
    /// Claimed and persisted.
    Acknowledged,
}

/// Stable identity of a slot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u64);

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of capacity on one worker.
pub struct Slot {
    id: SlotId,
    worker_id: WorkerId,
    state: AtomicU8,
    expires_at_ms: AtomicU64,
}

impl Slot {
    /// A free slot for `worker_id` that expires after `ttl`.
    pub fn new(worker_id: WorkerId, ttl: Duration) -> Self {
        Self {
            id: SlotId(NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed)),
            worker_id,
            state: AtomicU8::new(FREE),
            expires_at_ms: AtomicU64::new(expiry_from_now(ttl)),
        }
    }

    /// Slot identity.
    pub const fn id(&self) -> SlotId {
        self.id
    }

    /// Worker providing the capacity.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Current state.
    pub fn state(&self) -> SlotState {
        match self.state.load(Ordering::Acquire) {
            FREE => SlotState::Free,
            USED => SlotState::Used,
            _ => SlotState::Acknowledged,
        }
    }

    /// Claimed but not yet acknowledged.
    pub fn is_unacked(&self) -> bool {
        self.state.load(Ordering::Acquire) == USED
    }

    /// Past its expiry.
    pub fn is_expired(&self) -> bool {
        let now = u64::try_from(now_ms()).unwrap_or(u64::MAX);
        self.expires_at_ms.load(Ordering::Acquire) <= now
    }

    /// Free and not expired.
    pub fn is_active(&self) -> bool {
        self.state.load(Ordering::Acquire) == FREE && !self.is_expired()
    }

    /// Push the expiry out to `ttl` from now.
    pub fn extend_expiry(&self, ttl: Duration) {
        self.expires_at_ms
            .store(expiry_from_now(ttl), Ordering::Release);
    }

    /// Expire immediately so no search can claim it.
    pub fn expire(&self) {
        self.expires_at_ms.store(0, Ordering::Release);
    }

    /// Atomic free→used transition. Fails if the slot is taken or expired.
    pub fn try_claim(&self) -> bool {
        if self.is_expired() {
            return false;
        }
        self.state
            .compare_exchange(FREE, USED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn ack(&self) -> bool {
        self.state
            .compare_exchange(USED, ACKED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn nack(&self) -> bool {
        self.state
            .compare_exchange(USED, FREE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("worker_id", &self.worker_id)
            .field("state", &self.state())
            .field("expired", &self.is_expired())
            .finish()
    }
}

fn expiry_from_now(ttl: Duration) -> u64 {
    let at = now_ms() + ttl.as_millis();
    u64::try_from(at).unwrap_or(u64::MAX)
}

/// Rate-limit units reserved for one task, resolved alongside its slot.
pub(crate) struct RateLimitReservation {
    limiter: Arc<dyn RateLimiter>,
    task_id: TaskId,
}

impl RateLimitReservation {
    pub(crate) fn new(limiter: Arc<dyn RateLimiter>, task_id: TaskId) -> Self {
        Self { limiter, task_id }
    }

    pub(crate) fn ack(self) {
        self.limiter.ack(self.task_id);
    }

    pub(crate) fn nack(self) {
        self.limiter.nack(self.task_id);
    }
}

/// Resolves one claimed slot exactly once.
///
/// `ack` and `nack` consume the handle. Dropping an unresolved handle nacks it,
/// so an abandoned assignment always returns its slot and rate-limit units.
pub struct AckHandle {
    slot: Arc<Slot>,
    rate_limit: Option<RateLimitReservation>,
    resolved: bool,
}

impl AckHandle {
    pub(crate) fn new(slot: Arc<Slot>, rate_limit: Option<RateLimitReservation>) -> Self {
        Self {
            slot,
            rate_limit,
            resolved: false,
        }
    }

    /// Slot this handle resolves.
    pub fn slot_id(&self) -> SlotId {
        self.slot.id()
    }

    /// The assignment was persisted: used→acknowledged.
    pub fn ack(mut self) {
        self.resolved = true;
        if !self.slot.ack() {
            tracing::warn!(slot = ?self.slot.id(), "ack on a slot that was not in use");
        }
        if let Some(rl) = self.rate_limit.take() {
            rl.ack();
        }
    }

    /// The assignment was abandoned: used→free.
    pub fn nack(mut self) {
        self.resolved = true;
        self.release();
    }

    fn release(&mut self) {
        if !self.slot.nack() {
            tracing::warn!(slot = ?self.slot.id(), "nack on a slot that was not in use");
        }
        if let Some(rl) = self.rate_limit.take() {
            rl.nack();
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!(slot = ?self.slot.id(), "unresolved ack handle dropped, releasing slot");
            self.release();
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle")
            .field("slot", &self.slot.id())
            .field("rate_limited", &self.rate_limit.is_some())
            .field("resolved", &self.resolved)
            .finish()
    }
}
