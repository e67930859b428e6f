//! Wiring of the per-tenant components.
//!
//! A [`TenantManager`] runs the lease loop, feeds every published worker set
//! to the scheduler, keeps one [`Queuer`] per leased queue, and runs the
//! periodic replenish loop. All loops stop when the manager shuts down.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::core::lease_manager::LeaseManager;
use crate::core::queuer::{QueueResults, Queuer};
use crate::core::repository::{ActiveWorker, QueueRepository};
use crate::core::scheduler::Scheduler;
use crate::core::SchedulerError;
use crate::runtime::Spawn;
use crate::util::types::TenantId;

struct QueuerHandle {
    queuer: Arc<Queuer>,
    cancel: CancellationToken,
}

/// Queuers keyed by queue name, reconciled against the leased queue set.
struct QueuerRegistry<S> {
    tenant_id: TenantId,
    config: SchedulerConfig,
    repo: Arc<dyn QueueRepository>,
    scheduler: Arc<Scheduler>,
    results_tx: mpsc::UnboundedSender<QueueResults>,
    spawner: S,
    cancel: CancellationToken,
    queuers: Mutex<BTreeMap<String, QueuerHandle>>,
}

impl<S: Spawn> QueuerRegistry<S> {
    fn reconcile(&self, leased: &[String]) {
        let wanted: BTreeSet<&str> = leased.iter().map(String::as_str).collect();
        let mut queuers = self.queuers.lock();

        queuers.retain(|name, handle| {
            if wanted.contains(name.as_str()) {
                return true;
            }
            tracing::info!(tenant = %self.tenant_id, queue = %name, "queue lease lost, stopping queuer");
            handle.cancel.cancel();
            false
        });

        for name in wanted {
            if queuers.contains_key(name) {
                continue;
            }
            let queuer = Arc::new(Queuer::new(
                self.tenant_id.clone(),
                name,
                Arc::clone(&self.repo),
                Arc::clone(&self.scheduler),
                self.results_tx.clone(),
                &self.config,
            ));
            let cancel = self.cancel.child_token();
            queuer.start(&self.spawner, self.config.queue_poll_interval(), cancel.clone());
            tracing::info!(tenant = %self.tenant_id, queue = %name, "started queuer");
            queuers.insert(name.to_owned(), QueuerHandle { queuer, cancel });
        }
    }

    fn stop_all(&self) {
        for (_, handle) in std::mem::take(&mut *self.queuers.lock()) {
            handle.cancel.cancel();
        }
    }
}

/// Runs the scheduling components of one tenant.
pub struct TenantManager<S> {
    tenant_id: TenantId,
    config: SchedulerConfig,
    leases: Arc<LeaseManager>,
    scheduler: Arc<Scheduler>,
    registry: Arc<QueuerRegistry<S>>,
    results_rx: Mutex<Option<mpsc::UnboundedReceiver<QueueResults>>>,
    spawner: S,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl<S> TenantManager<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Assemble a manager from already-built components. Nothing runs until
    /// [`TenantManager::start`].
    pub fn new(
        config: SchedulerConfig,
        leases: Arc<LeaseManager>,
        scheduler: Arc<Scheduler>,
        queue_repo: Arc<dyn QueueRepository>,
        spawner: S,
    ) -> Self {
        let tenant_id: TenantId = scheduler.tenant_id().to_owned();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let registry = Arc::new(QueuerRegistry {
            tenant_id: tenant_id.clone(),
            config: config.clone(),
            repo: queue_repo,
            scheduler: Arc::clone(&scheduler),
            results_tx,
            spawner: spawner.clone(),
            cancel: cancel.clone(),
            queuers: Mutex::new(BTreeMap::new()),
        });
        Self {
            tenant_id,
            config,
            leases,
            scheduler,
            registry,
            results_rx: Mutex::new(Some(results_rx)),
            spawner,
            cancel,
            started: AtomicBool::new(false),
        }
    }

    /// Tenant served.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// The tenant's scheduler.
    pub const fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The tenant's lease manager.
    pub const fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    /// Start every loop. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.cancel.is_cancelled() {
            return Err(SchedulerError::ShutDown("tenant manager"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let workers_rx = self
            .leases
            .subscribe_workers()
            .ok_or(SchedulerError::ShutDown("lease manager"))?;
        let queues_rx = self
            .leases
            .subscribe_queues()
            .ok_or(SchedulerError::ShutDown("lease manager"))?;

        self.spawn_worker_listener(workers_rx);
        self.spawn_queue_listener(queues_rx);
        self.scheduler.start_replenish_loop(
            &self.spawner,
            self.config.replenish_interval(),
            self.cancel.child_token(),
        );
        self.leases.start(
            &self.spawner,
            self.config.lease_interval(),
            self.cancel.child_token(),
        );

        tracing::info!(tenant = %self.tenant_id, "tenant scheduling started");
        Ok(())
    }

    fn spawn_worker_listener(&self, mut rx: watch::Receiver<Vec<ActiveWorker>>) {
        let scheduler = Arc::clone(&self.scheduler);
        let cancel = self.cancel.clone();
        self.spawner.spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let workers = rx.borrow_and_update().clone();
                scheduler.set_workers(workers);
                if let Err(e) = scheduler.replenish(true).await {
                    tracing::error!(tenant = %scheduler.tenant_id(), "replenish after worker change failed: {e}");
                }
            }
        });
    }

    fn spawn_queue_listener(&self, mut rx: watch::Receiver<Vec<String>>) {
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        self.spawner.spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let queues = rx.borrow_and_update().clone();
                registry.reconcile(&queues);
            }
            registry.stop_all();
        });
    }

    /// Take the receiver of committed results. Only the first call gets it.
    pub fn take_results(&self) -> Option<mpsc::UnboundedReceiver<QueueResults>> {
        self.results_rx.lock().take()
    }

    /// Ask the queuer of `queue` for an immediate cycle. Returns false when
    /// the queue is not leased here.
    pub fn queue(&self, queue: &str) -> bool {
        let queuers = self.registry.queuers.lock();
        let Some(handle) = queuers.get(queue) else {
            return false;
        };
        handle.queuer.queue();
        true
    }

    /// Names of the queues with a running queuer.
    pub fn queue_names(&self) -> Vec<String> {
        self.registry.queuers.lock().keys().cloned().collect()
    }

    /// Stop every loop and release all leases.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.cancel.cancel();
        self.registry.stop_all();
        let result = self.leases.cleanup().await;
        tracing::info!(tenant = %self.tenant_id, "tenant scheduling stopped");
        result
    }
}
