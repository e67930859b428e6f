//! Cancellable deferred callbacks.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A callback scheduled to run once after a delay on the current tokio runtime.
///
/// Dropping the action or calling [`DeferredAction::cancel`] prevents the
/// callback from running, or aborts it at its next await point if it already
/// started. [`DeferredAction::detach`] gives up the handle without cancelling:
/// a firing callback uses it to clear its own slot without aborting itself.
#[derive(Debug)]
pub struct DeferredAction {
    handle: Option<JoinHandle<()>>,
}

impl DeferredAction {
    /// Run `callback` once `delay` has elapsed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F, Fut>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback().await;
        });
        Self {
            handle: Some(handle),
        }
    }

    /// True while the callback has neither completed nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the callback. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Release the handle and let the callback run to completion.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for DeferredAction {
    fn drop(&mut self) {
        self.cancel();
    }
}
