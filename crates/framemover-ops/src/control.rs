//! Pause/cancel gate shared by the workers of one batch.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use framemover_core::TransferError;

/// Cooperative pause and cancel signals for a single batch.
///
/// Workers call [`BatchControl::checkpoint`] between dequeues and between
/// chunks. While paused the call parks until resume or cancel; once
/// cancelled it returns [`TransferError::Cancelled`] immediately.
#[derive(Debug)]
pub struct BatchControl {
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl BatchControl {
    /// Create a gate in the running state.
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            cancel: CancellationToken::new(),
        }
    }

    /// Ask workers to park at their next checkpoint.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Release parked workers.
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Cancel the batch. Parked workers wake up and observe the cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when the batch is cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the batch may proceed.
    pub async fn checkpoint(&self) -> Result<(), TransferError> {
        let mut paused = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let is_paused = *paused.borrow_and_update();
            if !is_paused {
                return Ok(());
            }
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            }
        }
    }
}

impl Default for BatchControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_checkpoint_passes_when_running() {
        let control = BatchControl::new();
        assert!(control.checkpoint().await.is_ok());
    }

    #[tokio::test]
    async fn test_checkpoint_parks_until_resume() {
        let control = Arc::new(BatchControl::new());
        control.pause();

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.checkpoint().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        control.resume();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_wakes_paused_worker() {
        let control = Arc::new(BatchControl::new());
        control.pause();

        let waiter = {
            let control = Arc::clone(&control);
            tokio::spawn(async move { control.checkpoint().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        control.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(control.is_cancelled());
    }
}
