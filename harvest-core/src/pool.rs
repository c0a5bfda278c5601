//! Bounded worker pool shared by every connector's batches.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{HarvestError, Result};

/// Runs submitted batches with at most `size` executing at once. Extra
/// submissions wait for a permit instead of spawning unbounded work.
#[derive(Clone)]
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("busy", &self.busy())
            .field("tasks", &self.tracker.len())
            .field("closed", &self.tracker.is_closed())
            .field("interrupted", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently holding a permit.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    /// Tasks submitted and not yet finished, queued or running.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Cancellation token for one task. Interrupting the pool cancels it.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Queues `task`. The returned handle yields `None` when `cancel` fired
    /// before a permit was granted and the task never ran.
    pub fn submit<F>(
        &self,
        cancel: CancellationToken,
        task: F,
    ) -> Result<JoinHandle<Option<F::Output>>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(HarvestError::Cancelled("worker pool is shut down".into()));
        }
        let permits = Arc::clone(&self.permits);
        Ok(self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                permit = permits.acquire_owned() => permit.ok()?,
            };
            let output = task.await;
            drop(permit);
            Some(output)
        }))
    }

    /// Stops accepting work and optionally cancels every task token handed
    /// out by [`WorkerPool::child_token`].
    pub fn close(&self, interrupt: bool) {
        self.tracker.close();
        if interrupt {
            self.shutdown.cancel();
        }
    }

    /// Waits for submitted tasks to finish. Returns `false` on timeout;
    /// tasks still running are left to finish on their own.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}
