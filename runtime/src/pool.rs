//! Worker pool for chain runs that must not block the async executor.
//!
//! Processors are synchronous and may block (a request-response connector
//! waiting on its transport). The asynchronous processing strategy runs whole
//! chains on tokio's blocking threads, with a semaphore bounding how many run
//! at once. One pool can be shared by many flows: clones share the same
//! permits.

use crate::error::FlowError;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;

/// Default number of concurrent chain runs
pub const DEFAULT_WORKER_THREADS: usize = 16;

/// Bounded pool of blocking workers
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool running at most `size` tasks at once (minimum 1)
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Maximum concurrent tasks
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently running or waiting for a worker
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `task` on a blocking worker once one is free.
    ///
    /// # Errors
    ///
    /// - [`FlowError::TaskJoin`] if the task panicked or was cancelled
    /// - [`FlowError::ShutdownInProgress`] if the pool was closed
    pub async fn run<F, T>(&self, task: F) -> Result<T, FlowError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlightGuard(Arc::clone(&self.in_flight));

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| FlowError::ShutdownInProgress)?;

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        });
        Ok(handle.await?)
    }

    /// Stop handing out workers; queued and future [`run`](Self::run) calls
    /// fail with [`FlowError::ShutdownInProgress`]
    pub fn close(&self) {
        self.permits.close();
        tracing::info!(size = self.size, "Worker pool closed");
    }

    /// Check if the pool was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_THREADS)
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
