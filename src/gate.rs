//! Process-wide cap on simultaneous executions.
//!
//! Waiters are admitted in arrival order. A permit is released when it is
//! dropped, so every exit path of a request gives its slot back.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Counting gate in front of the sandbox executor.
#[derive(Debug, Clone)]
pub struct ExecutionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// An admitted execution. Dropping it frees the slot.
#[derive(Debug)]
pub struct ExecutionPermit {
    _permit: OwnedSemaphorePermit,
}

impl ExecutionGate {
    /// A gate admitting `capacity` executions at once (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> anyhow::Result<ExecutionPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .context("execution gate closed")?;
        debug!(available = self.semaphore.available_permits(), "Execution admitted");
        Ok(ExecutionPermit { _permit: permit })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
