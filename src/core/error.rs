//! Error types for scheduler operations.

use std::fmt;

use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid or incomplete configuration; fatal at construction time.
    #[error("configuration error: {0}")]
    Config(String),
    /// A collaborator (store, repository) call failed.
    #[error("backend error: {0}")]
    Backend(String),
    /// Flushing one batch buffer failed.
    #[error("flush failed for {key}: {reason}")]
    Flush {
        /// Buffer key the flush was attempted for.
        key: String,
        /// Underlying failure.
        reason: String,
    },
    /// Several buffer flushes failed during a drain.
    #[error("{0}")]
    FlushAggregate(FlushErrors),
    /// The component was already shut down.
    #[error("component shut down: {0}")]
    ShutDown(&'static str),
}

impl SchedulerError {
    /// Wrap a collaborator error, keeping its full context chain.
    pub fn backend(context: &str, err: &anyhow::Error) -> Self {
        Self::Backend(format!("{context}: {err:#}"))
    }
}

/// Every failure collected while draining batch buffers.
#[derive(Debug, Default)]
pub struct FlushErrors(pub Vec<SchedulerError>);

impl FlushErrors {
    /// Number of failed flushes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FlushErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} buffer flush(es) failed", self.0.len())?;
        for (i, err) in self.0.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{err}")?;
        }
        Ok(())
    }
}

/// Application-facing result using anyhow for collaborator contracts.
pub type AppResult<T> = Result<T, anyhow::Error>;
