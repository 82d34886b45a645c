// ── Compensating actions ──
//
// Multi-step resource setup records an undo action after each step that
// succeeds. On the first failure the recorded actions run newest-first.

use futures_util::future::BoxFuture;
use tracing::warn;

use crate::error::CoreError;

type Compensation = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CoreError>> + Send>;

/// Ordered undo log for one operation.
pub struct Saga {
    operation: String,
    undo: Vec<(&'static str, Compensation)>,
}

impl Saga {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            undo: Vec::new(),
        }
    }

    /// Record how to reverse the step that just succeeded.
    pub fn compensate<F>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() -> BoxFuture<'static, Result<(), CoreError>> + Send + 'static,
    {
        self.undo.push((label, Box::new(action)));
    }

    /// Await `step`; on failure unwind everything recorded so far.
    pub async fn step<T>(
        &mut self,
        step: impl Future<Output = Result<T, CoreError>>,
    ) -> Result<T, CoreError> {
        match step.await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.unwind().await;
                Err(e)
            }
        }
    }

    /// Run recorded compensations in reverse. Failures are logged.
    pub async fn unwind(&mut self) {
        while let Some((label, action)) = self.undo.pop() {
            if let Err(e) = action().await {
                warn!(operation = %self.operation, step = label, error = %e, "rollback step failed");
            }
        }
    }

    /// Keep everything; drop the undo log.
    pub fn commit(mut self) {
        self.undo.clear();
    }

    pub fn pending(&self) -> usize {
        self.undo.len()
    }
}
