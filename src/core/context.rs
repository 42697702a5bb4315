//! Step context - what a step sees while it runs

use crate::core::parameters::ParameterRegistry;
use crate::core::step::StepError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative cancellation shared by the engine and every running step
///
/// Cancelling is idempotent. Steps check it before submitting external work and may await
/// [`CancelHandle::cancelled`] to abandon long waits. A [`CancelHandle::child`] is cancelled
/// with its parent but cancelling it leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
    parents: Vec<Arc<CancelInner>>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelInner {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            // registered before the flag check so a concurrent cancel is not missed
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// New handle that follows this one without being able to cancel it
    pub fn child(&self) -> Self {
        let mut parents = self.parents.clone();
        parents.push(self.inner.clone());
        Self {
            inner: Arc::new(CancelInner::default()),
            parents,
        }
    }

    /// Request cancellation
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled() || self.parents.iter().any(|parent| parent.is_cancelled())
    }

    /// Resolves once cancellation has been requested here or on a parent
    pub async fn cancelled(&self) {
        let waits = std::iter::once(&self.inner)
            .chain(self.parents.iter())
            .map(|inner| Box::pin(inner.cancelled()));
        futures::future::select_all(waits).await;
    }
}

/// Execution context handed to [`crate::core::Step::run`]
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Simulate instead of mutating external state
    pub dry_run: bool,

    /// Parameters published by steps that already finished
    pub parameters: Arc<ParameterRegistry>,

    pub cancel: CancelHandle,
}

impl StepContext {
    pub fn new(dry_run: bool, parameters: Arc<ParameterRegistry>, cancel: CancelHandle) -> Self {
        Self {
            dry_run,
            parameters,
            cancel,
        }
    }

    /// Resolve a parameter published by an upstream step
    pub async fn parameter(&self, name: &str) -> Result<String, StepError> {
        self.parameters.get(name).await
    }

    /// Fail with [`StepError::Cancelled`] if the run was cancelled
    pub fn check_cancelled(&self) -> Result<(), StepError> {
        if self.cancel.is_cancelled() {
            Err(StepError::Cancelled)
        } else {
            Ok(())
        }
    }
}
