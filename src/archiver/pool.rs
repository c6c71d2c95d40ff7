use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::error::{ArchiverError, Result};

/// Bounded pool shared by discovery and query requests. Each network
/// operation holds one permit for its duration.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Runs `operation` once a permit is free. Fails with `ShutDown` after
    /// `close`.
    pub async fn run<F, T>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ArchiverError::ShutDown)?;
        operation.await
    }

    /// Stops handing out permits. Operations already running finish.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    pool.run(async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_work() {
        let pool = WorkerPool::new(1);
        pool.close();
        let result = pool.run(async { Ok(()) }).await;
        assert!(matches!(result, Err(ArchiverError::ShutDown)));
    }
}
