//! Admission control for background units.
//!
//! Every long-running helper task (pipe readers, script units, relay loops) is
//! spawned through [`UnitLimiter::spawn`], which waits for a semaphore permit
//! first and holds it for the lifetime of the spawned future. The permit is
//! dropped when the future completes, panics or is aborted.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
#[error("unit limiter is closed")]
pub struct LimiterClosed;

/// Cloneable handle; all clones share one semaphore.
#[derive(Clone)]
pub struct UnitLimiter {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl UnitLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Units currently running.
    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Wait for a free slot, then spawn `fut` holding it.
    pub async fn spawn<F>(&self, fut: F) -> Result<JoinHandle<F::Output>, LimiterClosed>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = self.acquire().await?;
        Ok(tokio::spawn(async move {
            let _permit = permit;
            fut.await
        }))
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, LimiterClosed> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_permit_released_when_unit_ends() {
        let limiter = UnitLimiter::new(1);
        let handle = limiter.spawn(async { 7 }).await.unwrap();
        assert_eq!(handle.await.unwrap(), 7);
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn test_spawn_waits_for_free_slot() {
        let limiter = UnitLimiter::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = limiter
            .spawn(async move {
                let _ = release_rx.await;
            })
            .await
            .unwrap();
        assert_eq!(limiter.in_use(), 1);

        let second = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.spawn(async { "second" }).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        release_tx.send(()).unwrap();
        first.await.unwrap();
        let handle = second.await.unwrap().unwrap();
        assert_eq!(handle.await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_permit_released_on_abort() {
        let limiter = UnitLimiter::new(1);
        let handle = limiter
            .spawn(futures::future::pending::<()>())
            .await
            .unwrap();
        handle.abort();
        let _ = handle.await;
        assert_eq!(limiter.in_use(), 0);
    }
}
