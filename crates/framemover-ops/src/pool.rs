//! Bounded worker pool pulling operations from a shared queue.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::control::BatchControl;

/// Multi-consumer queue of operation indices, filled once by the controller.
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<usize>>,
}

impl WorkQueue {
    /// Create a queue holding `indices` in order.
    pub fn new(indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            items: Mutex::new(indices.into_iter().collect()),
        }
    }

    /// Claim the next index. Each index is handed out at most once.
    pub fn pop(&self) -> Option<usize> {
        self.lock().pop_front()
    }

    /// Remove and return everything not yet claimed.
    pub fn drain(&self) -> Vec<usize> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<usize>> {
        // A poisoned queue still holds valid indices.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed-width pool of workers for one batch.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    width: usize,
}

impl WorkerPool {
    /// Create a pool with `width` workers (at least one).
    pub fn new(width: usize) -> Self {
        Self {
            width: width.max(1),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Run `job` for every queued index until the queue is empty or the
    /// batch is cancelled.
    ///
    /// Workers pass the control checkpoint before each dequeue, so a paused
    /// worker parks without claiming an item. Returns once every worker has
    /// exited; cancelled batches leave their unclaimed indices in the queue.
    pub async fn run<F, Fut>(&self, queue: Arc<WorkQueue>, control: Arc<BatchControl>, job: F)
    where
        F: Fn(usize) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let workers = self.width.min(queue.len().max(1));
        let mut set = JoinSet::new();

        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let control = Arc::clone(&control);
            let job = job.clone();
            set.spawn(async move {
                loop {
                    if queue.is_empty() {
                        break;
                    }
                    if control.checkpoint().await.is_err() {
                        trace!(worker, "worker observed cancellation");
                        break;
                    }
                    let Some(index) = queue.pop() else {
                        break;
                    };
                    job(index).await;
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "worker task failed");
            }
        }
    }
}
