//! Batch buffer construction from scheduler configuration.

use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::core::{BatchBufferManager, BatchFlusher, SchedulerError};

/// Build a batch buffer manager flushing into `flusher`.
pub fn build_batch_buffer<T>(
    cfg: &SchedulerConfig,
    flusher: Arc<dyn BatchFlusher<T>>,
) -> Result<BatchBufferManager<T>, SchedulerError>
where
    T: Clone + Send + Sync + 'static,
{
    cfg.validate()
        .map_err(|e| SchedulerError::Config(format!("config invalid: {e}")))?;
    Ok(BatchBufferManager::new(flusher, cfg.batch_retry_interval()))
}
