//! Integration tests for the batch buffer manager.
//!
//! Covers every flush trigger (size, interval, owner change, drain), deferred
//! flushes when the sink declines, batch id rotation, error reporting, buffer
//! release after flushing, and per-key isolation while a sink is blocked.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use prometheus_slot_scheduler::config::StepBatchConfig;
use prometheus_slot_scheduler::core::{
    AppResult, BatchBufferManager, BatchFlusher, BatchItem, BufferKey, FlushReason, FlushRequest,
    SchedulerError,
};
use tokio::sync::Notify;

#[derive(Default)]
struct RecordingFlusher {
    requests: Mutex<Vec<FlushRequest<u32>>>,
    /// Permission checks left to decline.
    declines: AtomicUsize,
    checks: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingFlusher {
    fn declining(times: usize) -> Self {
        Self {
            declines: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<FlushRequest<u32>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl BatchFlusher<u32> for RecordingFlusher {
    async fn flush(&self, request: FlushRequest<u32>) -> AppResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("sink unavailable");
        }
        self.requests.lock().push(request);
        Ok(())
    }

    async fn can_flush(&self, _request: &FlushRequest<u32>) -> AppResult<bool> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let declined = self
            .declines
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(!declined)
    }
}

fn key(step: &str) -> BufferKey {
    BufferKey::new("t1", step, "a", "")
}

fn item(key: &BufferKey, owner: (&str, &str), config: StepBatchConfig, payload: u32) -> BatchItem<u32> {
    BatchItem {
        key: key.clone(),
        dispatcher_id: owner.0.into(),
        worker_id: owner.1.into(),
        config,
        payload,
    }
}

fn manager(flusher: &Arc<RecordingFlusher>) -> BatchBufferManager<u32> {
    BatchBufferManager::new(flusher.clone(), Duration::from_secs(60))
}

async fn wait_for_requests(flusher: &RecordingFlusher, count: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while flusher.requests.lock().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flush happens in time");
}

const OWNER: (&str, &str) = ("d1", "w1");

// ============================================================================
// Flush triggers
// ============================================================================

#[tokio::test]
async fn test_size_trigger_flushes_full_batch() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");
    let cfg = StepBatchConfig::new(2).with_max_runs(3);

    let first = buffers.add(item(&k, OWNER, cfg, 1)).await.unwrap();
    assert!(!first.flushed);
    assert_eq!(first.pending, 1);

    let second = buffers.add(item(&k, OWNER, cfg, 2)).await.unwrap();
    assert!(second.flushed);
    assert_eq!(second.pending, 0);
    assert_eq!(second.batch_id, first.batch_id);

    let requests = flusher.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.items, vec![1, 2]);
    assert_eq!(request.reason, FlushReason::BatchSizeReached);
    assert_eq!(request.batch_id, first.batch_id);
    assert_eq!(request.worker_id, "w1");
    assert_eq!(request.dispatcher_id, "d1");
    assert_eq!(request.step_id, "s");
    assert_eq!(request.batch_size, 2);
    assert_eq!(request.max_runs, Some(3));

    let third = buffers.add(item(&k, OWNER, cfg, 3)).await.unwrap();
    assert_ne!(third.batch_id, first.batch_id);
}

#[tokio::test]
async fn test_interval_flushes_partial_batch() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");
    let cfg = StepBatchConfig::new(10).with_flush_interval_ms(50);

    buffers.add(item(&k, OWNER, cfg, 1)).await.unwrap();
    buffers.add(item(&k, OWNER, cfg, 2)).await.unwrap();
    wait_for_requests(&flusher, 1).await;

    let requests = flusher.requests();
    assert_eq!(requests[0].items, vec![1, 2]);
    assert_eq!(requests[0].reason, FlushReason::IntervalElapsed);
    assert_eq!(requests[0].flush_interval, Some(Duration::from_millis(50)));
    assert_eq!(buffers.pending(&k).await, 0);
}

#[tokio::test]
async fn test_size_flush_cancels_interval_timer() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");
    let cfg = StepBatchConfig::new(2).with_flush_interval_ms(30);

    buffers.add(item(&k, OWNER, cfg, 1)).await.unwrap();
    assert!(buffers.add(item(&k, OWNER, cfg, 2)).await.unwrap().flushed);
    tokio::time::sleep(Duration::from_millis(120)).await;

    assert_eq!(flusher.requests().len(), 1);
}

#[tokio::test]
async fn test_worker_change_flushes_previous_owner() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");
    let cfg = StepBatchConfig::new(10);

    buffers.add(item(&k, ("d1", "w1"), cfg, 1)).await.unwrap();
    let moved = buffers.add(item(&k, ("d1", "w2"), cfg, 2)).await.unwrap();
    assert!(moved.flushed);
    assert_eq!(moved.pending, 1);

    let requests = flusher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].reason, FlushReason::WorkerChanged);
    assert_eq!(requests[0].worker_id, "w1");
    assert_eq!(requests[0].items, vec![1]);
}

#[tokio::test]
async fn test_dispatcher_change_flushes_previous_owner() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");
    let cfg = StepBatchConfig::new(10);

    buffers.add(item(&k, ("d1", "w1"), cfg, 1)).await.unwrap();
    // A new dispatcher wins over a new worker when both change.
    buffers.add(item(&k, ("d2", "w2"), cfg, 2)).await.unwrap();

    let requests = flusher.requests();
    assert_eq!(requests[0].reason, FlushReason::DispatcherChanged);
    assert_eq!(requests[0].dispatcher_id, "d1");
}

#[tokio::test]
async fn test_declined_flush_is_retried() {
    let flusher = Arc::new(RecordingFlusher::declining(3));
    let buffers = manager(&flusher);
    let k = key("s");
    let cfg = StepBatchConfig::new(2).with_flush_interval_ms(20);

    buffers.add(item(&k, OWNER, cfg, 1)).await.unwrap();
    let full = buffers.add(item(&k, OWNER, cfg, 2)).await.unwrap();
    assert!(!full.flushed);
    assert_eq!(full.pending, 2);

    wait_for_requests(&flusher, 1).await;
    let requests = flusher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].items, vec![1, 2]);
    assert_eq!(requests[0].reason, FlushReason::IntervalElapsed);
    assert_eq!(requests[0].batch_id, full.batch_id);
    assert_eq!(flusher.checks.load(Ordering::SeqCst), 4);
}

// ============================================================================
// Batch identity
// ============================================================================

#[tokio::test]
async fn test_batch_ids_are_unique_across_flushes() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");

    let mut added = HashSet::new();
    for n in 0..50 {
        let result = buffers.add(item(&k, OWNER, StepBatchConfig::new(1), n)).await.unwrap();
        assert!(result.flushed);
        added.insert(result.batch_id);
    }

    let flushed: HashSet<_> = flusher.requests().iter().map(|r| r.batch_id).collect();
    assert_eq!(added.len(), 50);
    assert_eq!(flushed, added);
}

// ============================================================================
// Draining and errors
// ============================================================================

#[tokio::test]
async fn test_flush_all_bypasses_permission_check() {
    let flusher = Arc::new(RecordingFlusher::declining(usize::MAX));
    let buffers = manager(&flusher);
    let cfg = StepBatchConfig::new(10);

    buffers.add(item(&key("s1"), OWNER, cfg, 1)).await.unwrap();
    buffers.add(item(&key("s2"), OWNER, cfg, 2)).await.unwrap();

    assert_eq!(buffers.flush_all().await.unwrap(), 2);
    let requests = flusher.requests();
    assert!(requests.iter().all(|r| r.reason == FlushReason::BufferDrained));
    assert_eq!(flusher.checks.load(Ordering::SeqCst), 0);

    // Nothing left: a second drain is empty.
    assert_eq!(buffers.flush_all().await.unwrap(), 0);
}

#[tokio::test]
async fn test_flush_all_aggregates_errors() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let cfg = StepBatchConfig::new(10);
    buffers.add(item(&key("s1"), OWNER, cfg, 1)).await.unwrap();
    buffers.add(item(&key("s2"), OWNER, cfg, 2)).await.unwrap();

    flusher.fail.store(true, Ordering::SeqCst);
    match buffers.flush_all().await {
        Err(SchedulerError::FlushAggregate(errors)) => assert_eq!(errors.0.len(), 2),
        other => panic!("expected aggregated errors, got {other:?}"),
    }
    assert_eq!(buffers.pending(&key("s1")).await, 1);
    assert_eq!(buffers.pending(&key("s2")).await, 1);

    flusher.fail.store(false, Ordering::SeqCst);
    assert_eq!(buffers.flush_all().await.unwrap(), 2);
}

#[tokio::test]
async fn test_flush_error_propagates_and_keeps_items() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");
    flusher.fail.store(true, Ordering::SeqCst);

    let err = buffers
        .add(item(&k, OWNER, StepBatchConfig::new(1), 7))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Flush { ref key, .. } if key == "t1/s/a/"));
    assert_eq!(buffers.pending(&k).await, 1);

    flusher.fail.store(false, Ordering::SeqCst);
    assert_eq!(buffers.flush_all().await.unwrap(), 1);
    assert_eq!(flusher.requests()[0].items, vec![7]);
}

#[tokio::test]
async fn test_shutdown_drains_and_rejects_new_items() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");
    let cfg = StepBatchConfig::new(10).with_flush_interval_ms(10_000);

    buffers.add(item(&k, OWNER, cfg, 1)).await.unwrap();
    assert_eq!(buffers.shutdown().await.unwrap(), 1);
    assert_eq!(buffers.buffer_count(), 0);

    let err = buffers.add(item(&k, OWNER, cfg, 2)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ShutDown(_)));
    assert_eq!(flusher.requests().len(), 1);
}

#[tokio::test]
async fn test_invalid_batch_config_is_rejected() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);

    let err = buffers
        .add(item(&key("s"), OWNER, StepBatchConfig::new(0), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Config(_)));
    assert_eq!(buffers.buffer_count(), 0);
}

// ============================================================================
// Buffer lifecycle
// ============================================================================

#[tokio::test]
async fn test_flushed_buffers_are_released() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);

    for run in 0..1_000_u32 {
        let k = BufferKey::new("t1", "s", "a", format!("run-{run}"));
        let result = buffers
            .add(item(&k, OWNER, StepBatchConfig::new(1), run))
            .await
            .unwrap();
        assert!(result.flushed);
    }
    assert_eq!(flusher.requests().len(), 1_000);
    assert_eq!(buffers.buffer_count(), 0);
}

#[tokio::test]
async fn test_interval_flushed_buffer_is_released() {
    let flusher = Arc::new(RecordingFlusher::default());
    let buffers = manager(&flusher);
    let k = key("s");
    let cfg = StepBatchConfig::new(10).with_flush_interval_ms(20);

    buffers.add(item(&k, OWNER, cfg, 1)).await.unwrap();
    assert_eq!(buffers.buffer_count(), 1);
    wait_for_requests(&flusher, 1).await;

    tokio::time::timeout(Duration::from_secs(2), async {
        while buffers.buffer_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("buffer released after its timed flush");

    // The key is usable again and starts a fresh batch.
    let next = buffers.add(item(&k, OWNER, cfg, 2)).await.unwrap();
    assert_eq!(next.pending, 1);
    assert_ne!(next.batch_id, flusher.requests()[0].batch_id);
}

#[tokio::test]
async fn test_declined_buffer_is_kept() {
    let flusher = Arc::new(RecordingFlusher::declining(1));
    let buffers = manager(&flusher);
    let k = key("s");

    let result = buffers
        .add(item(&k, OWNER, StepBatchConfig::new(1), 1))
        .await
        .unwrap();
    assert!(!result.flushed);
    assert_eq!(buffers.buffer_count(), 1);
    assert_eq!(buffers.pending(&k).await, 1);
}

// ============================================================================
// Per-key isolation
// ============================================================================

/// Holds every permission check for step "blocked" until opened.
#[derive(Default)]
struct GatedFlusher {
    entered: Notify,
    gate: Notify,
    open: AtomicBool,
    flushed: Mutex<Vec<u32>>,
}

#[async_trait]
impl BatchFlusher<u32> for GatedFlusher {
    async fn flush(&self, request: FlushRequest<u32>) -> AppResult<()> {
        self.flushed.lock().extend(request.items);
        Ok(())
    }

    async fn can_flush(&self, request: &FlushRequest<u32>) -> AppResult<bool> {
        if request.step_id == "blocked" && !self.open.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        Ok(true)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocked_key_serializes_its_callers_only() {
    let flusher = Arc::new(GatedFlusher::default());
    let buffers = BatchBufferManager::new(flusher.clone(), Duration::from_secs(60));
    let blocked = key("blocked");
    let cfg = StepBatchConfig::new(1);

    let first = tokio::spawn({
        let buffers = buffers.clone();
        let blocked = blocked.clone();
        async move { buffers.add(item(&blocked, OWNER, cfg, 1)).await }
    });
    flusher.entered.notified().await;

    let mut second = tokio::spawn({
        let buffers = buffers.clone();
        let blocked = blocked.clone();
        async move { buffers.add(item(&blocked, OWNER, cfg, 2)).await }
    });
    assert!(
        tokio::time::timeout(Duration::from_millis(100), &mut second)
            .await
            .is_err(),
        "second add on the blocked key must wait"
    );

    let other = tokio::time::timeout(
        Duration::from_secs(2),
        buffers.add(item(&key("free"), OWNER, cfg, 3)),
    )
    .await
    .expect("other keys are not blocked")
    .unwrap();
    assert!(other.flushed);
    assert_eq!(*flusher.flushed.lock(), vec![3]);

    flusher.open.store(true, Ordering::SeqCst);
    flusher.gate.notify_one();
    assert!(first.await.unwrap().unwrap().flushed);
    assert!(second.await.unwrap().unwrap().flushed);
    assert_eq!(*flusher.flushed.lock(), vec![3, 1, 2]);
}
