//! Size- and time-bounded batching of assigned items.
//!
//! Items are buffered per [`BufferKey`]. A buffer flushes when it reaches its
//! batch size, when its flush interval elapses, when the (dispatcher, worker)
//! owner of incoming items changes, or when the manager is drained. The sink
//! may decline a flush through [`BatchFlusher::can_flush`]; the buffer then
//! keeps its items and retries on a timer until the flush is permitted.
//!
//! ```text
//! empty -> accumulating -> flush pending -> empty
//!               |                ^
//!               v                |
//!         flush deferred --retry-+
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::StepBatchConfig;
use crate::core::error::FlushErrors;
use crate::core::{AppResult, SchedulerError};
use crate::util::clock::now_ms;
use crate::util::timer::DeferredAction;
use crate::util::types::{ActionId, DispatcherId, StepId, TenantId, WorkerId};

/// Why a buffer emitted its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// The buffer reached its batch size.
    BatchSizeReached,
    /// Items for a different worker arrived.
    WorkerChanged,
    /// Items for a different dispatcher arrived.
    DispatcherChanged,
    /// The flush interval or a retry delay elapsed.
    IntervalElapsed,
    /// The manager drained every buffer.
    BufferDrained,
}

impl FlushReason {
    /// Wire name of the reason.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BatchSizeReached => "batch_size_reached",
            Self::WorkerChanged => "worker_changed",
            Self::DispatcherChanged => "dispatcher_changed",
            Self::IntervalElapsed => "interval_elapsed",
            Self::BufferDrained => "buffer_drained",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferKey {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Step the items run.
    pub step_id: StepId,
    /// Action the items run.
    pub action_id: ActionId,
    /// Caller-defined grouping key.
    pub batch_key: String,
}

impl BufferKey {
    /// Build a key.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        step_id: impl Into<StepId>,
        action_id: impl Into<ActionId>,
        batch_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            step_id: step_id.into(),
            action_id: action_id.into(),
            batch_key: batch_key.into(),
        }
    }
}

impl fmt::Display for BufferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.tenant_id, self.step_id, self.action_id, self.batch_key
        )
    }
}

/// One item offered to the manager.
#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    /// Buffer the item belongs to.
    pub key: BufferKey,
    /// Dispatcher the item will be delivered through.
    pub dispatcher_id: DispatcherId,
    /// Worker the item was assigned to.
    pub worker_id: WorkerId,
    /// Batching inputs of the item's step.
    pub config: StepBatchConfig,
    /// Caller payload.
    pub payload: T,
}

/// Immutable snapshot of a buffer handed to the sink.
#[derive(Debug, Clone)]
pub struct FlushRequest<T> {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Step the items run.
    pub step_id: StepId,
    /// Action the items run.
    pub action_id: ActionId,
    /// Dispatcher owning the batch.
    pub dispatcher_id: DispatcherId,
    /// Worker owning the batch.
    pub worker_id: WorkerId,
    /// Id minted when the batch started accumulating.
    pub batch_id: Uuid,
    /// Copies of the buffered items, in arrival order.
    pub items: Vec<T>,
    /// Trigger of this attempt.
    pub reason: FlushReason,
    /// When the attempt was built, in milliseconds since epoch.
    pub triggered_at_ms: u128,
    /// Configured batch size.
    pub batch_size: usize,
    /// Configured flush interval.
    pub flush_interval: Option<Duration>,
    /// Caller-defined grouping key.
    pub batch_key: String,
    /// Configured max concurrent runs.
    pub max_runs: Option<u32>,
}

/// Sink receiving flushed batches.
#[async_trait]
pub trait BatchFlusher<T: Send + Sync + 'static>: Send + Sync {
    /// Hand a batch downstream.
    async fn flush(&self, request: FlushRequest<T>) -> AppResult<()>;

    /// Whether a flush may happen now. Declining defers the flush.
    async fn can_flush(&self, _request: &FlushRequest<T>) -> AppResult<bool> {
        Ok(true)
    }
}

/// Outcome of [`BatchBufferManager::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddResult {
    /// A flush happened during the call.
    pub flushed: bool,
    /// Items left in the buffer afterwards.
    pub pending: usize,
    /// Batch the added item was placed in.
    pub batch_id: Uuid,
}

struct Buffer<T> {
    key: BufferKey,
    dispatcher_id: DispatcherId,
    worker_id: WorkerId,
    config: StepBatchConfig,
    items: Vec<T>,
    batch_id: Option<Uuid>,
    next_batch_id: Uuid,
    timer: Option<DeferredAction>,
    timer_generation: u64,
    /// Set once the buffer left the map; holders must look the key up again.
    retired: bool,
}

impl<T: Clone> Buffer<T> {
    fn new(item: &BatchItem<T>) -> Self {
        Self {
            key: item.key.clone(),
            dispatcher_id: item.dispatcher_id.clone(),
            worker_id: item.worker_id.clone(),
            config: item.config,
            items: Vec::new(),
            batch_id: None,
            next_batch_id: Uuid::new_v4(),
            timer: None,
            timer_generation: 0,
            retired: false,
        }
    }

    /// Current batch id, minting from the pre-generated one if none is active.
    fn batch_id(&mut self) -> Uuid {
        if let Some(id) = self.batch_id {
            return id;
        }
        let id = std::mem::replace(&mut self.next_batch_id, Uuid::new_v4());
        self.batch_id = Some(id);
        id
    }

    fn timer_pending(&self) -> bool {
        self.timer.as_ref().is_some_and(DeferredAction::is_pending)
    }

    fn stop_timer(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
        }
    }

    fn request(&mut self, reason: FlushReason) -> FlushRequest<T> {
        FlushRequest {
            tenant_id: self.key.tenant_id.clone(),
            step_id: self.key.step_id.clone(),
            action_id: self.key.action_id.clone(),
            dispatcher_id: self.dispatcher_id.clone(),
            worker_id: self.worker_id.clone(),
            batch_id: self.batch_id(),
            items: self.items.clone(),
            reason,
            triggered_at_ms: now_ms(),
            batch_size: self.config.batch_size,
            flush_interval: self.config.flush_interval(),
            batch_key: self.key.batch_key.clone(),
            max_runs: self.config.max_runs,
        }
    }
}

type BufferCell<T> = Arc<tokio::sync::Mutex<Buffer<T>>>;

struct Inner<T> {
    flusher: Arc<dyn BatchFlusher<T>>,
    buffers: Mutex<HashMap<BufferKey, BufferCell<T>>>,
    retry_interval: Duration,
    closed: AtomicBool,
}

/// Buffers assigned items per key and flushes them in batches.
///
/// Calls on the same key are serialized; different keys never wait on each
/// other.
pub struct BatchBufferManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BatchBufferManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> BatchBufferManager<T> {
    /// Create a manager. `retry_interval` paces deferred flushes of buffers
    /// without a flush interval.
    pub fn new(flusher: Arc<dyn BatchFlusher<T>>, retry_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                flusher,
                buffers: Mutex::new(HashMap::new()),
                retry_interval,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Buffer one item, flushing as its buffer's triggers dictate.
    ///
    /// Items for a new (dispatcher, worker) owner first flush whatever the
    /// buffer already holds, so no buffered work is dropped. Sink errors are
    /// returned to the caller; the buffer keeps its items and retries later.
    /// If that owner-change flush fails, the new item is not buffered.
    pub async fn add(&self, item: BatchItem<T>) -> Result<AddResult, SchedulerError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown("batch buffer manager"));
        }
        item.config.validate().map_err(SchedulerError::Config)?;

        let (cell, mut buf) = loop {
            let cell = self.inner.buffer_for(&item);
            let buf = Arc::clone(&cell).lock_owned().await;
            if !buf.retired {
                break (cell, buf);
            }
        };
        let mut flushed = false;

        if !buf.items.is_empty() {
            let reason = if buf.dispatcher_id != item.dispatcher_id {
                Some(FlushReason::DispatcherChanged)
            } else if buf.worker_id != item.worker_id {
                Some(FlushReason::WorkerChanged)
            } else {
                None
            };
            if let Some(reason) = reason {
                tracing::debug!(
                    key = %buf.key,
                    from = %buf.worker_id,
                    to = %item.worker_id,
                    "owner changed, flushing buffered items"
                );
                flushed = self.inner.flush_locked(&mut buf, reason, false).await?;
            }
        }

        buf.dispatcher_id = item.dispatcher_id;
        buf.worker_id = item.worker_id;
        buf.config = item.config;
        let batch_id = buf.batch_id();
        buf.items.push(item.payload);

        if buf.items.len() >= buf.config.batch_size {
            flushed |= self
                .inner
                .flush_locked(&mut buf, FlushReason::BatchSizeReached, true)
                .await?;
        } else if let Some(interval) = buf.config.flush_interval() {
            if !buf.timer_pending() {
                self.inner.arm_timer(&mut buf, interval);
            }
        }

        let pending = buf.items.len();
        self.inner.release_if_idle(&cell, &mut buf);
        Ok(AddResult {
            flushed,
            pending,
            batch_id,
        })
    }

    /// Flush every non-empty buffer under [`FlushReason::BufferDrained`],
    /// bypassing the permission check. Returns the number of batches flushed;
    /// failures are collected and reported together.
    pub async fn flush_all(&self) -> Result<usize, SchedulerError> {
        let mut cells: Vec<(BufferKey, BufferCell<T>)> = self
            .inner
            .buffers
            .lock()
            .iter()
            .map(|(k, c)| (k.clone(), Arc::clone(c)))
            .collect();
        cells.sort_by(|a, b| a.0.cmp(&b.0));

        let mut flushed = 0;
        let mut errors = Vec::new();
        for (_, cell) in cells {
            let mut buf = cell.lock().await;
            buf.stop_timer();
            match self
                .inner
                .flush_locked(&mut buf, FlushReason::BufferDrained, false)
                .await
            {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
            self.inner.release_if_idle(&cell, &mut buf);
        }

        if errors.is_empty() {
            Ok(flushed)
        } else {
            Err(SchedulerError::FlushAggregate(FlushErrors(errors)))
        }
    }

    /// Stop accepting items, cancel every timer and drain all buffers.
    pub async fn shutdown(&self) -> Result<usize, SchedulerError> {
        self.inner.closed.store(true, Ordering::Release);
        let result = self.flush_all().await;
        self.inner.buffers.lock().clear();
        tracing::info!("batch buffer manager shut down");
        result
    }

    /// Items currently buffered under `key`.
    pub async fn pending(&self, key: &BufferKey) -> usize {
        let cell = self.inner.buffers.lock().get(key).cloned();
        match cell {
            Some(cell) => cell.lock().await.items.len(),
            None => 0,
        }
    }

    /// Number of buffers currently holding items or a pending flush.
    pub fn buffer_count(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    fn buffer_for(&self, item: &BatchItem<T>) -> BufferCell<T> {
        let mut buffers = self.buffers.lock();
        Arc::clone(
            buffers
                .entry(item.key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Buffer::new(item)))),
        )
    }

    /// Drop an empty buffer with no timer from the map so one-off batch keys
    /// do not accumulate. Only removes the entry if it is still `cell`.
    fn release_if_idle(&self, cell: &BufferCell<T>, buf: &mut Buffer<T>) {
        if !buf.items.is_empty() || buf.timer_pending() {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.get(&buf.key).is_some_and(|c| Arc::ptr_eq(c, cell)) {
            buffers.remove(&buf.key);
            buf.retired = true;
        }
    }

    /// Attempt a flush with the buffer lock held. `Ok(false)` means nothing
    /// was flushed: the buffer was empty or the sink declined.
    async fn flush_locked(
        self: &Arc<Self>,
        buf: &mut Buffer<T>,
        reason: FlushReason,
        check_permission: bool,
    ) -> Result<bool, SchedulerError> {
        if buf.items.is_empty() {
            return Ok(false);
        }
        let request = buf.request(reason);

        if check_permission {
            match self.flusher.can_flush(&request).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(key = %buf.key, reason = %reason, "flush declined, deferring");
                    self.arm_retry(buf);
                    return Ok(false);
                }
                Err(e) => {
                    self.arm_retry(buf);
                    return Err(SchedulerError::Flush {
                        key: buf.key.to_string(),
                        reason: format!("flush permission check failed: {e:#}"),
                    });
                }
            }
        }

        let batch_id = request.batch_id;
        let count = request.items.len();
        match self.flusher.flush(request).await {
            Ok(()) => {
                buf.items.clear();
                buf.stop_timer();
                buf.batch_id = None;
                tracing::debug!(
                    key = %buf.key,
                    reason = %reason,
                    batch = %batch_id,
                    count,
                    "flushed batch"
                );
                Ok(true)
            }
            Err(e) => {
                self.arm_retry(buf);
                Err(SchedulerError::Flush {
                    key: buf.key.to_string(),
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    fn arm_retry(self: &Arc<Self>, buf: &mut Buffer<T>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let delay = buf.config.flush_interval().unwrap_or(self.retry_interval);
        self.arm_timer(buf, delay);
    }

    fn arm_timer(self: &Arc<Self>, buf: &mut Buffer<T>, delay: Duration) {
        buf.stop_timer();
        buf.timer_generation += 1;
        let generation = buf.timer_generation;
        let key = buf.key.clone();
        let inner: Weak<Self> = Arc::downgrade(self);
        buf.timer = Some(DeferredAction::schedule(delay, move || async move {
            if let Some(inner) = inner.upgrade() {
                inner.on_timer(key, generation).await;
            }
        }));
    }

    async fn on_timer(self: Arc<Self>, key: BufferKey, generation: u64) {
        let cell = self.buffers.lock().get(&key).cloned();
        let Some(cell) = cell else {
            return;
        };
        let mut buf = cell.lock().await;
        if buf.timer_generation != generation {
            return;
        }
        if let Some(timer) = buf.timer.take() {
            timer.detach();
        }

        // Timer-driven flushes have no caller to report to.
        if let Err(e) = self
            .flush_locked(&mut buf, FlushReason::IntervalElapsed, true)
            .await
        {
            tracing::error!(key = %key, "timed flush failed: {e}");
        }
        self.release_if_idle(&cell, &mut buf);
    }
}
