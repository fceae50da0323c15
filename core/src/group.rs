//! Joinable group of background tasks that reports the first failure

use crate::{ProcError, Result};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;
use tracing::debug;

/// Runs fallible background tasks and surfaces the first error on [`wait`].
///
/// Tasks are independent: a failing task does not cancel its siblings.
///
/// [`wait`]: TaskGroup::wait
#[derive(Default)]
pub(crate) struct TaskGroup {
    tasks: Mutex<JoinSet<Result<()>>>,
}

impl TaskGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<Result<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn a task onto the current runtime
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.lock().spawn(task);
    }

    /// Number of tasks not yet joined
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Join every task spawned so far and return the first error.
    ///
    /// Later errors are logged and dropped. Tasks spawned while waiting are
    /// left for the next call.
    pub(crate) async fn wait(&self) -> Result<()> {
        let mut tasks = std::mem::take(&mut *self.lock());
        let mut first = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| ProcError::TaskJoin(e.to_string()))
                .and_then(|result| result);
            if let Err(e) = outcome {
                if first.is_none() {
                    first = Some(e);
                } else {
                    debug!("Dropping additional task error: {}", e);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}
