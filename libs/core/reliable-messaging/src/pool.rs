//! Bounded handler concurrency shared by every loop of one client

use crate::metrics::MessagingMetrics;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Default)]
struct PoolState {
    closed: bool,
    in_flight: usize,
}

#[derive(Debug)]
struct PoolInner {
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    idle: Notify,
    capacity: usize,
    metrics: MessagingMetrics,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counting gate for handler executions.
///
/// Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

/// Permission to run one handler. Dropping it frees the slot.
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
    inner: Arc<PoolInner>,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let remaining = {
            let mut state = self.inner.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.in_flight
        };
        self.inner.metrics.in_flight(remaining);
        if remaining == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl WorkerPool {
    pub fn new(capacity: usize, metrics: MessagingMetrics) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                state: Mutex::new(PoolState::default()),
                idle: Notify::new(),
                capacity,
                metrics,
            }),
        }
    }

    /// Wait for a free slot. Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<WorkerSlot> {
        if self.is_closed() {
            return None;
        }

        let permit = self.inner.semaphore.clone().acquire_owned().await.ok()?;

        let in_flight = {
            let mut state = self.inner.state();
            if state.closed {
                return None;
            }
            state.in_flight += 1;
            state.in_flight
        };
        self.inner.metrics.in_flight(in_flight);

        Some(WorkerSlot {
            _permit: permit,
            inner: self.inner.clone(),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state().in_flight
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Stop granting slots and wait for every running handler to finish.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state();
            state.closed = true;
        }
        self.inner.semaphore.close();

        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            let in_flight = self.in_flight();
            if in_flight == 0 {
                break;
            }
            debug!(in_flight, "Waiting for in-flight handlers");
            idle.await;
        }
    }
}
