//! Renewable, tenant-scoped leases on workers and queues.
//!
//! Each scheduler instance runs one [`LeaseManager`] per tenant. On every tick
//! it lists the live candidates of each resource kind, releases leases whose
//! resource disappeared, acquires or extends the rest in one batched call, and
//! publishes the successfully leased set to a latest-snapshot channel.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::repository::{ActiveWorker, Lease, LeaseRepository};
use crate::core::SchedulerError;
use crate::runtime::Spawn;
use crate::util::types::{LeaseKind, TenantId};

/// Holds and renews the leases one scheduler instance acts on for a tenant.
pub struct LeaseManager {
    tenant_id: TenantId,
    repo: Arc<dyn LeaseRepository>,
    /// Held worker leases. `try_lock` doubles as the cycle re-entrancy guard.
    worker_leases: tokio::sync::Mutex<Vec<Lease>>,
    /// Held queue leases, guarded the same way.
    queue_leases: tokio::sync::Mutex<Vec<Lease>>,
    workers_tx: Mutex<Option<watch::Sender<Vec<ActiveWorker>>>>,
    queues_tx: Mutex<Option<watch::Sender<Vec<String>>>>,
    cleaned_up: AtomicBool,
}

impl LeaseManager {
    /// Create a manager for `tenant_id`. No leases are taken until a cycle runs.
    pub fn new(tenant_id: impl Into<TenantId>, repo: Arc<dyn LeaseRepository>) -> Self {
        let (workers_tx, _) = watch::channel(Vec::new());
        let (queues_tx, _) = watch::channel(Vec::new());
        Self {
            tenant_id: tenant_id.into(),
            repo,
            worker_leases: tokio::sync::Mutex::new(Vec::new()),
            queue_leases: tokio::sync::Mutex::new(Vec::new()),
            workers_tx: Mutex::new(Some(workers_tx)),
            queues_tx: Mutex::new(Some(queues_tx)),
            cleaned_up: AtomicBool::new(false),
        }
    }

    /// Tenant this manager leases for.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Latest leased worker set. `None` after cleanup.
    pub fn subscribe_workers(&self) -> Option<watch::Receiver<Vec<ActiveWorker>>> {
        self.workers_tx.lock().as_ref().map(watch::Sender::subscribe)
    }

    /// Latest leased queue names. `None` after cleanup.
    pub fn subscribe_queues(&self) -> Option<watch::Receiver<Vec<String>>> {
        self.queues_tx.lock().as_ref().map(watch::Sender::subscribe)
    }

    /// True once [`LeaseManager::cleanup`] has started.
    pub fn is_cleaned_up(&self) -> bool {
        self.cleaned_up.load(Ordering::Acquire)
    }

    /// Snapshot of the leases currently held for `kind`.
    pub async fn held_leases(&self, kind: LeaseKind) -> Vec<Lease> {
        match kind {
            LeaseKind::Worker => self.worker_leases.lock().await.clone(),
            LeaseKind::Queue => self.queue_leases.lock().await.clone(),
        }
    }

    /// Run one worker leasing cycle. Skipped if a previous cycle is in flight.
    pub async fn acquire_worker_leases(&self) -> Result<(), SchedulerError> {
        let Ok(mut held) = self.worker_leases.try_lock() else {
            tracing::debug!(tenant = %self.tenant_id, "worker lease cycle in flight, skipping");
            return Ok(());
        };
        if self.is_cleaned_up() {
            return Ok(());
        }

        let workers = self
            .repo
            .list_active_workers(&self.tenant_id)
            .await
            .map_err(|e| SchedulerError::backend("list active workers", &e))?;
        let candidates: Vec<String> = workers.iter().map(|w| w.id.clone()).collect();

        let leases = self
            .reconcile(LeaseKind::Worker, &mut held, candidates)
            .await?;
        let leased: HashSet<&str> = leases.iter().map(|l| l.resource_id.as_str()).collect();
        let leased_workers: Vec<ActiveWorker> = workers
            .into_iter()
            .filter(|w| leased.contains(w.id.as_str()))
            .collect();

        tracing::trace!(
            tenant = %self.tenant_id,
            count = leased_workers.len(),
            "worker leases refreshed"
        );
        self.send_worker_ids(leased_workers);
        Ok(())
    }

    /// Run one queue leasing cycle. Skipped if a previous cycle is in flight.
    pub async fn acquire_queue_leases(&self) -> Result<(), SchedulerError> {
        let Ok(mut held) = self.queue_leases.try_lock() else {
            tracing::debug!(tenant = %self.tenant_id, "queue lease cycle in flight, skipping");
            return Ok(());
        };
        if self.is_cleaned_up() {
            return Ok(());
        }

        let queues = self
            .repo
            .list_queues(&self.tenant_id)
            .await
            .map_err(|e| SchedulerError::backend("list queues", &e))?;
        let candidates: Vec<String> = queues.into_iter().map(|q| q.name).collect();

        let leases = self.reconcile(LeaseKind::Queue, &mut held, candidates).await?;
        let leased_queues: Vec<String> = leases.into_iter().map(|l| l.resource_id).collect();

        tracing::trace!(
            tenant = %self.tenant_id,
            count = leased_queues.len(),
            "queue leases refreshed"
        );
        self.send_queues(leased_queues);
        Ok(())
    }

    /// Release leases whose resource vanished, then acquire/extend the rest.
    async fn reconcile(
        &self,
        kind: LeaseKind,
        held: &mut Vec<Lease>,
        candidates: Vec<String>,
    ) -> Result<Vec<Lease>, SchedulerError> {
        let live: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let (still_held, stale): (Vec<Lease>, Vec<Lease>) = held
            .drain(..)
            .partition(|l| live.contains(l.resource_id.as_str()));

        if !stale.is_empty() {
            tracing::debug!(
                tenant = %self.tenant_id,
                kind = kind.as_str(),
                count = stale.len(),
                "releasing leases on vanished resources"
            );
            // Unreleased leases expire on their own.
            if let Err(e) = self.repo.release_leases(&self.tenant_id, &stale).await {
                tracing::warn!(
                    tenant = %self.tenant_id,
                    kind = kind.as_str(),
                    "failed to release stale leases: {e:#}"
                );
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        match self
            .repo
            .acquire_or_extend_leases(&self.tenant_id, kind, &candidates, &still_held)
            .await
        {
            Ok(acquired) => {
                held.clone_from(&acquired);
                Ok(acquired)
            }
            Err(e) => {
                *held = still_held;
                Err(SchedulerError::backend(
                    &format!("acquire {} leases", kind.as_str()),
                    &e,
                ))
            }
        }
    }

    /// Publish the latest leased worker set. Never blocks; a slow listener
    /// only ever observes the newest snapshot.
    pub fn send_worker_ids(&self, workers: Vec<ActiveWorker>) -> bool {
        let guard = self.workers_tx.lock();
        match guard.as_ref() {
            Some(tx) if !self.is_cleaned_up() => {
                tx.send_replace(workers);
                true
            }
            _ => false,
        }
    }

    /// Publish the latest leased queue names.
    pub fn send_queues(&self, queues: Vec<String>) -> bool {
        let guard = self.queues_tx.lock();
        match guard.as_ref() {
            Some(tx) if !self.is_cleaned_up() => {
                tx.send_replace(queues);
                true
            }
            _ => false,
        }
    }

    /// Release every held lease and close the publication channels.
    ///
    /// Idempotent: only the first call does any work. Waits for in-flight
    /// cycles to finish before releasing.
    pub async fn cleanup(&self) -> Result<(), SchedulerError> {
        if self.cleaned_up.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.workers_tx.lock().take();
        self.queues_tx.lock().take();

        let mut workers = self.worker_leases.lock().await;
        let mut queues = self.queue_leases.lock().await;
        let leases: Vec<Lease> = workers.drain(..).chain(queues.drain(..)).collect();
        if leases.is_empty() {
            return Ok(());
        }

        tracing::info!(
            tenant = %self.tenant_id,
            count = leases.len(),
            "releasing all leases"
        );
        self.repo
            .release_leases(&self.tenant_id, &leases)
            .await
            .map_err(|e| SchedulerError::backend("release leases", &e))
    }

    /// Start the leasing loop. Each tick launches one worker and one queue
    /// cycle; a cycle still in flight makes the next one a no-op. Cancelling
    /// `cancel` stops the loop and runs [`LeaseManager::cleanup`].
    pub fn start<S>(self: &Arc<Self>, spawner: &S, interval: Duration, cancel: CancellationToken)
    where
        S: Spawn + Clone + Send + 'static,
    {
        let manager = Arc::clone(self);
        let cycles = spawner.clone();
        spawner.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let workers = Arc::clone(&manager);
                cycles.spawn(async move {
                    if let Err(e) = workers.acquire_worker_leases().await {
                        tracing::error!(tenant = %workers.tenant_id, "worker lease cycle failed: {e}");
                    }
                });
                let queues = Arc::clone(&manager);
                cycles.spawn(async move {
                    if let Err(e) = queues.acquire_queue_leases().await {
                        tracing::error!(tenant = %queues.tenant_id, "queue lease cycle failed: {e}");
                    }
                });
            }

            if let Err(e) = manager.cleanup().await {
                tracing::error!(tenant = %manager.tenant_id, "lease cleanup failed: {e}");
            }
        });
    }
}
