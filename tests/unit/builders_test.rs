//! Tests for builders

use std::sync::Arc;

use async_trait::async_trait;
use prometheus_slot_scheduler::builders::{build_batch_buffer, TenantSchedulerBuilder};
use prometheus_slot_scheduler::config::{SchedulerConfig, StepBatchConfig};
use prometheus_slot_scheduler::core::{
    AppResult, BatchFlusher, BatchItem, BufferKey, CapacityRepository, FlushRequest,
    LeaseRepository, SchedulerError,
};
use prometheus_slot_scheduler::infra::{InMemoryRateLimiter, InMemoryStore};
use prometheus_slot_scheduler::runtime::TokioSpawner;

struct NullFlusher;

#[async_trait]
impl BatchFlusher<String> for NullFlusher {
    async fn flush(&self, _request: FlushRequest<String>) -> AppResult<()> {
        Ok(())
    }
}

fn config_error<T>(result: Result<T, SchedulerError>) -> String {
    match result {
        Err(SchedulerError::Config(msg)) => msg,
        Err(other) => panic!("expected a config error, got {other}"),
        Ok(_) => panic!("expected a config error"),
    }
}

#[tokio::test]
async fn test_tenant_builder_with_store() {
    let store = Arc::new(InMemoryStore::new());
    let manager = TenantSchedulerBuilder::new("t1")
        .with_store(store)
        .with_rate_limiter(Arc::new(InMemoryRateLimiter::new()))
        .build(TokioSpawner::try_current().unwrap())
        .unwrap();
    assert_eq!(manager.tenant_id(), "t1");
    assert_eq!(manager.scheduler().tenant_id(), "t1");
    assert!(manager.queue_names().is_empty());
}

#[tokio::test]
async fn test_tenant_builder_requires_tenant() {
    let msg = config_error(
        TenantSchedulerBuilder::default()
            .with_store(Arc::new(InMemoryStore::new()))
            .build(TokioSpawner::try_current().unwrap()),
    );
    assert!(msg.contains("tenant id"));
}

#[tokio::test]
async fn test_tenant_builder_requires_every_repository() {
    let store = Arc::new(InMemoryStore::new());
    let msg = config_error(
        TenantSchedulerBuilder::new("t1")
            .with_lease_repository(Arc::clone(&store) as Arc<dyn LeaseRepository>)
            .with_capacity_repository(store as Arc<dyn CapacityRepository>)
            .build(TokioSpawner::try_current().unwrap()),
    );
    assert!(msg.contains("queue repository"));

    let msg = config_error(
        TenantSchedulerBuilder::new("t1").build(TokioSpawner::try_current().unwrap()),
    );
    assert!(msg.contains("lease repository"));
}

#[tokio::test]
async fn test_tenant_builder_rejects_invalid_config() {
    let msg = config_error(
        TenantSchedulerBuilder::new("t1")
            .with_config(SchedulerConfig {
                slot_ttl_ms: 0,
                ..SchedulerConfig::default()
            })
            .with_store(Arc::new(InMemoryStore::new()))
            .build(TokioSpawner::try_current().unwrap()),
    );
    assert!(msg.contains("slot_ttl_ms"));
}

#[tokio::test]
async fn test_batch_builder() {
    let buffers = build_batch_buffer::<String>(&SchedulerConfig::default(), Arc::new(NullFlusher))
        .unwrap();
    let result = buffers
        .add(BatchItem {
            key: BufferKey::new("t1", "s", "a", "k"),
            dispatcher_id: "d1".into(),
            worker_id: "w1".into(),
            config: StepBatchConfig::new(1),
            payload: "payload".to_string(),
        })
        .await
        .unwrap();
    assert!(result.flushed);
}

#[test]
fn test_batch_builder_rejects_invalid_config() {
    let cfg = SchedulerConfig {
        batch_retry_interval_ms: 0,
        ..SchedulerConfig::default()
    };
    let msg = config_error(build_batch_buffer::<String>(&cfg, Arc::new(NullFlusher)));
    assert!(msg.contains("batch_retry_interval_ms"));
}
