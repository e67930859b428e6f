//! Per-queue polling loop.
//!
//! A [`Queuer`] owns the working set of one leased queue. Each cycle refills
//! the set from storage when it runs low or goes stale, assigns it in
//! sub-batches with bounded concurrency, persists the outcome, and publishes
//! committed assignments on the results channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::core::repository::{AssignmentRecord, QueueItem, QueueRepository};
use crate::core::scheduler::{AssignResults, RateLimitedItem, Scheduler};
use crate::core::SchedulerError;
use crate::runtime::Spawn;
use crate::util::types::{DispatcherId, QueueItemId, TenantId, WorkerId};

/// A committed assignment, ready for delivery to its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignedQueueItem {
    /// The dequeued item.
    pub queue_item: QueueItem,
    /// Worker the task was assigned to.
    pub worker_id: WorkerId,
    /// Dispatcher the worker was connected through at assignment time.
    pub dispatcher_id: Option<DispatcherId>,
}

/// Outcome of one persisted sub-batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueResults {
    /// Tenant the queue belongs to.
    pub tenant_id: TenantId,
    /// Queue name.
    pub queue: String,
    /// Assignments that were committed.
    pub assigned: Vec<AssignedQueueItem>,
    /// Items whose scheduling deadline passed; recorded as timed out.
    pub scheduling_timed_out: Vec<QueueItem>,
    /// Items vetoed by the rate limiter; retried on a later cycle.
    pub rate_limited: Vec<RateLimitedItem>,
    /// Items with no eligible slot; retried on a later cycle.
    pub unassigned: Vec<QueueItem>,
}

/// Counters for one [`Queuer::loop_once`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Items in the working set when the pass started.
    pub processed: usize,
    /// Assignments committed.
    pub assigned: usize,
    /// Items recorded as scheduling-timed-out.
    pub timed_out: usize,
    /// Items left in the working set for the next pass.
    pub remaining: usize,
    /// The working set was fully resolved; another pass is queued immediately.
    pub drained: bool,
}

#[derive(Default)]
struct WorkingSet {
    items: Vec<QueueItem>,
    last_refill: Option<Instant>,
}

struct SubBatchOutcome {
    remaining: Vec<QueueItem>,
    assigned: usize,
    timed_out: usize,
    failed: bool,
}

/// Polls one queue and feeds it to the tenant's scheduler.
pub struct Queuer {
    tenant_id: TenantId,
    queue: String,
    repo: Arc<dyn QueueRepository>,
    scheduler: Arc<Scheduler>,
    limit: usize,
    sub_batch_size: usize,
    max_concurrency: usize,
    refill_max_age: Duration,
    /// Held for a whole cycle, so cycles never overlap.
    state: tokio::sync::Mutex<WorkingSet>,
    notify: Notify,
    results_tx: mpsc::UnboundedSender<QueueResults>,
}

impl Queuer {
    /// Create a queuer for `queue`, sized from `config`.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        queue: impl Into<String>,
        repo: Arc<dyn QueueRepository>,
        scheduler: Arc<Scheduler>,
        results_tx: mpsc::UnboundedSender<QueueResults>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queue: queue.into(),
            repo,
            scheduler,
            limit: config.single_queue_limit,
            sub_batch_size: config.assign_batch_size.max(1),
            max_concurrency: config.max_concurrent_flushes.max(1),
            refill_max_age: config.refill_max_age(),
            state: tokio::sync::Mutex::new(WorkingSet::default()),
            notify: Notify::new(),
            results_tx,
        }
    }

    /// Queue this queuer serves.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Ask for a cycle now. Signals coalesce: several calls before the loop
    /// wakes produce a single extra cycle.
    pub fn queue(&self) {
        self.notify.notify_one();
    }

    /// Number of items currently held in the working set.
    pub async fn working_set_len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    /// Re-list the backlog when the working set is under half the limit or
    /// older than the refill age; otherwise keep it.
    async fn refill_queue(&self, ws: &mut WorkingSet) -> Result<(), SchedulerError> {
        let stale = ws
            .last_refill
            .is_none_or(|at| at.elapsed() > self.refill_max_age);
        if !stale && ws.items.len() >= self.limit / 2 {
            return Ok(());
        }

        let items = self
            .repo
            .list_queue_items(&self.tenant_id, &self.queue, None, self.limit)
            .await
            .map_err(|e| SchedulerError::backend("list queue items", &e))?;
        tracing::trace!(
            tenant = %self.tenant_id,
            queue = %self.queue,
            count = items.len(),
            "refilled working set"
        );
        ws.items = items;
        ws.last_refill = Some(Instant::now());
        Ok(())
    }

    /// Run one refill → assign → persist pass.
    pub async fn loop_once(&self) -> Result<CycleSummary, SchedulerError> {
        let mut ws = self.state.lock().await;
        self.refill_queue(&mut ws).await?;

        let items = std::mem::take(&mut ws.items);
        let mut summary = CycleSummary {
            processed: items.len(),
            ..CycleSummary::default()
        };
        if items.is_empty() {
            return Ok(summary);
        }

        let sub_batches: Vec<_> = items
            .chunks(self.sub_batch_size)
            .map(|chunk| self.process_sub_batch(chunk.to_vec()))
            .collect();
        let outcomes: Vec<SubBatchOutcome> = stream::iter(sub_batches)
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        let mut any_failed = false;
        let mut remaining: Vec<QueueItem> = Vec::new();
        for outcome in outcomes {
            summary.assigned += outcome.assigned;
            summary.timed_out += outcome.timed_out;
            any_failed |= outcome.failed;
            remaining.extend(outcome.remaining);
        }
        remaining.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        summary.remaining = remaining.len();
        ws.items = remaining;
        drop(ws);

        summary.drained = !any_failed && summary.remaining == 0;
        if summary.drained {
            self.notify.notify_one();
        }
        Ok(summary)
    }

    async fn process_sub_batch(&self, items: Vec<QueueItem>) -> SubBatchOutcome {
        match self.scheduler.try_assign(items.clone()).await {
            Ok(results) => self.flush_to_database(results).await,
            Err(e) => {
                tracing::error!(
                    tenant = %self.tenant_id,
                    queue = %self.queue,
                    "assignment failed: {e}"
                );
                SubBatchOutcome {
                    remaining: items,
                    assigned: 0,
                    timed_out: 0,
                    failed: true,
                }
            }
        }
    }

    /// Persist one sub-batch. Committed assignments are acked and published;
    /// anything that failed to commit is nacked and kept for another pass.
    async fn flush_to_database(&self, results: AssignResults) -> SubBatchOutcome {
        let AssignResults {
            assigned,
            unassigned,
            scheduling_timed_out,
            rate_limited,
        } = results;

        let mut remaining: Vec<QueueItem> = unassigned.clone();
        remaining.extend(rate_limited.iter().map(|r| r.queue_item.clone()));

        if assigned.is_empty() && scheduling_timed_out.is_empty() {
            return SubBatchOutcome {
                remaining,
                assigned: 0,
                timed_out: 0,
                failed: false,
            };
        }

        let records: Vec<AssignmentRecord> = assigned
            .iter()
            .map(|a| AssignmentRecord {
                queue_item_id: a.queue_item.id,
                task_id: a.queue_item.task_id,
                worker_id: a.worker_id.clone(),
            })
            .collect();

        let marked = match self
            .repo
            .mark_queue_items_processed(&self.tenant_id, &records, &scheduling_timed_out)
            .await
        {
            Ok(marked) => marked,
            Err(e) => {
                tracing::error!(
                    tenant = %self.tenant_id,
                    queue = %self.queue,
                    count = assigned.len(),
                    "could not persist assignments: {e:#}"
                );
                for a in assigned {
                    remaining.push(a.queue_item);
                    a.ack.nack();
                }
                remaining.extend(scheduling_timed_out);
                return SubBatchOutcome {
                    remaining,
                    assigned: 0,
                    timed_out: 0,
                    failed: true,
                };
            }
        };

        let failed: HashSet<QueueItemId> = marked.failed.into_iter().collect();
        let (uncommitted_timeouts, scheduling_timed_out): (Vec<QueueItem>, Vec<QueueItem>) =
            scheduling_timed_out
                .into_iter()
                .partition(|i| failed.contains(&i.id));
        for item in uncommitted_timeouts {
            tracing::debug!(
                tenant = %self.tenant_id,
                queue = %self.queue,
                item = item.id,
                "timeout not recorded by store, keeping item"
            );
            remaining.push(item);
        }
        let mut committed = Vec::with_capacity(assigned.len());
        for a in assigned {
            if failed.contains(&a.queue_item.id) {
                tracing::debug!(
                    tenant = %self.tenant_id,
                    queue = %self.queue,
                    item = a.queue_item.id,
                    "assignment rejected by store, releasing slot"
                );
                a.ack.nack();
                remaining.push(a.queue_item);
            } else {
                a.ack.ack();
                committed.push(AssignedQueueItem {
                    dispatcher_id: self.scheduler.dispatcher_of(&a.worker_id),
                    queue_item: a.queue_item,
                    worker_id: a.worker_id,
                });
            }
        }

        self.spawn_watermark_update();

        let outcome = SubBatchOutcome {
            remaining,
            assigned: committed.len(),
            timed_out: scheduling_timed_out.len(),
            failed: false,
        };
        let published = QueueResults {
            tenant_id: self.tenant_id.clone(),
            queue: self.queue.clone(),
            assigned: committed,
            scheduling_timed_out,
            rate_limited,
            unassigned,
        };
        if self.results_tx.send(published).is_err() {
            tracing::debug!(tenant = %self.tenant_id, queue = %self.queue, "results receiver dropped");
        }
        outcome
    }

    fn spawn_watermark_update(&self) {
        let repo = Arc::clone(&self.repo);
        let tenant_id = self.tenant_id.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            if let Err(e) = repo.update_min_unprocessed_id(&tenant_id, &queue).await {
                tracing::warn!(tenant = %tenant_id, queue = %queue, "watermark update failed: {e:#}");
            }
        });
    }

    /// Start the polling loop: one pass per tick or per [`Queuer::queue`]
    /// signal, until `cancel` fires.
    pub fn start<S: Spawn>(self: &Arc<Self>, spawner: &S, interval: Duration, cancel: CancellationToken) {
        let queuer = Arc::clone(self);
        spawner.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                    () = queuer.notify.notified() => {}
                }
                if let Err(e) = queuer.loop_once().await {
                    tracing::error!(
                        tenant = %queuer.tenant_id,
                        queue = %queuer.queue,
                        "queue cycle failed: {e}"
                    );
                }
            }
            tracing::debug!(tenant = %queuer.tenant_id, queue = %queuer.queue, "queuer stopped");
        });
    }
}
