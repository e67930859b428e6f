//! Builder for a tenant's scheduling components.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::core::{
    CapacityRepository, LeaseManager, LeaseRepository, QueueRepository, RateLimiter, Scheduler,
    SchedulerError, TenantManager,
};
use crate::runtime::Spawn;
use crate::util::types::TenantId;

/// Assembles a [`TenantManager`] from configuration and collaborators.
///
/// ```rust,ignore
/// let store = Arc::new(InMemoryStore::new());
/// let manager = TenantSchedulerBuilder::new("tenant-a")
///     .with_config(SchedulerConfig::from_env()?)
///     .with_store(Arc::clone(&store))
///     .build(TokioSpawner::new(tokio::runtime::Handle::current()))?;
/// manager.start()?;
/// ```
#[derive(Default)]
pub struct TenantSchedulerBuilder {
    tenant_id: TenantId,
    config: SchedulerConfig,
    lease_repo: Option<Arc<dyn LeaseRepository>>,
    capacity_repo: Option<Arc<dyn CapacityRepository>>,
    queue_repo: Option<Arc<dyn QueueRepository>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl TenantSchedulerBuilder {
    /// Start building for `tenant_id` with the default configuration.
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Lease store.
    #[must_use]
    pub fn with_lease_repository(mut self, repo: Arc<dyn LeaseRepository>) -> Self {
        self.lease_repo = Some(repo);
        self
    }

    /// Capacity store.
    #[must_use]
    pub fn with_capacity_repository(mut self, repo: Arc<dyn CapacityRepository>) -> Self {
        self.capacity_repo = Some(repo);
        self
    }

    /// Queue backlog store.
    #[must_use]
    pub fn with_queue_repository(mut self, repo: Arc<dyn QueueRepository>) -> Self {
        self.queue_repo = Some(repo);
        self
    }

    /// One store serving all three repository contracts.
    #[must_use]
    pub fn with_store<R>(self, store: Arc<R>) -> Self
    where
        R: LeaseRepository + CapacityRepository + QueueRepository + 'static,
    {
        self.with_lease_repository(Arc::clone(&store) as Arc<dyn LeaseRepository>)
            .with_capacity_repository(Arc::clone(&store) as Arc<dyn CapacityRepository>)
            .with_queue_repository(store)
    }

    /// Optional rate limiter consulted on every assignment.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Validate and assemble. Missing repositories or an invalid
    /// configuration are reported as [`SchedulerError::Config`].
    pub fn build<S>(self, spawner: S) -> Result<TenantManager<S>, SchedulerError>
    where
        S: Spawn + Clone + Send + Sync + 'static,
    {
        if self.tenant_id.is_empty() {
            return Err(SchedulerError::Config("tenant id is required".into()));
        }
        self.config
            .validate()
            .map_err(|e| SchedulerError::Config(format!("config invalid: {e}")))?;
        let lease_repo = self
            .lease_repo
            .ok_or_else(|| SchedulerError::Config("lease repository is required".into()))?;
        let capacity_repo = self
            .capacity_repo
            .ok_or_else(|| SchedulerError::Config("capacity repository is required".into()))?;
        let queue_repo = self
            .queue_repo
            .ok_or_else(|| SchedulerError::Config("queue repository is required".into()))?;

        let leases = Arc::new(LeaseManager::new(self.tenant_id.clone(), lease_repo));
        let scheduler = Arc::new(Scheduler::new(
            self.tenant_id,
            capacity_repo,
            self.rate_limiter,
            self.config.slot_ttl(),
        ));
        Ok(TenantManager::new(
            self.config,
            leases,
            scheduler,
            queue_repo,
            spawner,
        ))
    }
}
