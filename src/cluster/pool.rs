//! Bounded worker pools
//!
//! A pool caps how many submitted tasks run at once. Each running task
//! holds one semaphore permit; submission either waits for a permit or
//! fails straight away, depending on the pool's policy.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// What `submit` does when every worker is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPolicy {
    /// Wait for a worker to free up
    Blocking,
    /// Fail with [`PoolError::Saturated`]
    NonBlocking,
}

impl SubmitPolicy {
    pub fn from_nonblocking(nonblocking: bool) -> Self {
        if nonblocking {
            Self::NonBlocking
        } else {
            Self::Blocking
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Capacity must be between 1 and the semaphore limit
    InvalidCapacity(usize),
    /// Every worker is busy and the pool does not wait
    Saturated { pool: &'static str },
    /// The pool no longer accepts work
    Closed { pool: &'static str },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCapacity(n) => write!(f, "invalid pool capacity: {}", n),
            Self::Saturated { pool } => write!(f, "{} pool saturated", pool),
            Self::Closed { pool } => write!(f, "{} pool closed", pool),
        }
    }
}

impl std::error::Error for PoolError {}

pub struct WorkerPool {
    name: &'static str,
    capacity: u32,
    policy: SubmitPolicy,
    permits: Arc<Semaphore>,
    closing: AtomicBool,
}

impl WorkerPool {
    pub fn new(name: &'static str, capacity: usize, policy: SubmitPolicy) -> Result<Self, PoolError> {
        if capacity == 0 || capacity > Semaphore::MAX_PERMITS || capacity > u32::MAX as usize {
            return Err(PoolError::InvalidCapacity(capacity));
        }

        Ok(Self {
            name,
            capacity: capacity as u32,
            policy,
            permits: Arc::new(Semaphore::new(capacity)),
            closing: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn policy(&self) -> SubmitPolicy {
        self.policy
    }

    /// Tasks currently holding a worker
    pub fn running(&self) -> usize {
        if self.permits.is_closed() {
            return 0;
        }
        self.capacity().saturating_sub(self.permits.available_permits())
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Run `task` on a free worker
    ///
    /// Returns once the task has been handed to a worker, not when it
    /// finishes.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::Closed { pool: self.name });
        }

        let permit = match self.policy {
            SubmitPolicy::NonBlocking => {
                self.permits.clone().try_acquire_owned().map_err(|e| match e {
                    tokio::sync::TryAcquireError::NoPermits => {
                        PoolError::Saturated { pool: self.name }
                    }
                    tokio::sync::TryAcquireError::Closed => PoolError::Closed { pool: self.name },
                })?
            }
            SubmitPolicy::Blocking => self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed { pool: self.name })?,
        };

        // Shutdown may have begun while we waited
        if self.is_closed() {
            return Err(PoolError::Closed { pool: self.name });
        }

        tokio::spawn(async move {
            let _permit = permit;
            task.await;
        });
        Ok(())
    }

    /// Stop accepting work and wait up to `timeout` for running tasks
    ///
    /// Returns `false` if tasks were still running when the timeout hit;
    /// those tasks keep running detached. Calling this again is a no-op
    /// that returns `true`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if self.closing.swap(true, Ordering::AcqRel) {
            return true;
        }

        let drained = match tokio::time::timeout(timeout, self.permits.acquire_many(self.capacity)).await {
            Ok(Ok(_all)) => true,
            Ok(Err(_)) => true,
            Err(_) => {
                warn!(
                    "{} pool: {} tasks still running after {:?}",
                    self.name,
                    self.running(),
                    timeout
                );
                false
            }
        };

        self.permits.close();
        debug!("{} pool closed", self.name);
        drained
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("running", &self.running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            WorkerPool::new("out", 0, SubmitPolicy::Blocking).unwrap_err(),
            PoolError::InvalidCapacity(0)
        );
    }

    #[tokio::test]
    async fn test_nonblocking_saturates() {
        let pool = WorkerPool::new("out", 1, SubmitPolicy::NonBlocking).unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        pool.submit(async move {
            let _ = release_rx.await;
        })
        .await
        .unwrap();
        assert_eq!(pool.running(), 1);

        let err = pool.submit(async {}).await.unwrap_err();
        assert_eq!(err, PoolError::Saturated { pool: "out" });

        release_tx.send(()).unwrap();
        assert!(pool.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_blocking_waits_for_worker() {
        let pool = Arc::new(WorkerPool::new("out", 1, SubmitPolicy::Blocking).unwrap());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let done = Arc::new(AtomicUsize::new(0));

        pool.submit(async move {
            let _ = release_rx.await;
        })
        .await
        .unwrap();

        let second = {
            let pool = pool.clone();
            let done = done.clone();
            tokio::spawn(async move {
                pool.submit(async move {
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        release_tx.send(()).unwrap();
        second.await.unwrap().unwrap();
        assert!(pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capacity_bounds_concurrency() {
        let pool = WorkerPool::new("in", 3, SubmitPolicy::Blocking).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let active = active.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }

        assert!(pool.shutdown(Duration::from_secs(2)).await);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let pool = WorkerPool::new("out", 2, SubmitPolicy::NonBlocking).unwrap();
        assert!(pool.shutdown(Duration::from_millis(100)).await);
        assert!(pool.is_closed());
        assert_eq!(
            pool.submit(async {}).await.unwrap_err(),
            PoolError::Closed { pool: "out" }
        );
        // second shutdown is a no-op
        assert!(pool.shutdown(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_shutdown_times_out_on_stuck_task() {
        let pool = WorkerPool::new("out", 1, SubmitPolicy::NonBlocking).unwrap();
        pool.submit(std::future::pending()).await.unwrap();
        assert!(!pool.shutdown(Duration::from_millis(20)).await);
    }
}
