//! Per-step batching configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Batching inputs declared by a step and carried on every buffered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepBatchConfig {
    /// Items per batch; reaching it triggers a flush.
    pub batch_size: usize,
    /// Maximum time a non-empty buffer waits before flushing.
    pub flush_interval_ms: Option<u64>,
    /// Maximum concurrently running batches for the step, forwarded to the sink.
    pub max_runs: Option<u32>,
}

impl StepBatchConfig {
    /// Size-only batching.
    pub const fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            flush_interval_ms: None,
            max_runs: None,
        }
    }

    /// Set the flush interval.
    #[must_use]
    pub const fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = Some(interval_ms);
        self
    }

    /// Set the max concurrent runs.
    #[must_use]
    pub const fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    /// Flush interval as a duration. A zero interval counts as unset.
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Validate values.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than 0".into());
        }
        if self.max_runs == Some(0) {
            return Err("max_runs must be greater than 0 when set".into());
        }
        Ok(())
    }
}
