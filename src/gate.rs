use crate::error::JobError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Non-blocking admission control: a fixed number of slots, refused rather
/// than queued once exhausted.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// One held slot. Dropping it gives the slot back.
#[derive(Debug)]
pub struct Permit {
    _slot: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Result<Permit, JobError> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(slot) => Ok(Permit { _slot: slot }),
            Err(TryAcquireError::NoPermits) => Err(JobError::CapacityExceeded {
                capacity: self.capacity,
            }),
            Err(TryAcquireError::Closed) => Err(JobError::internal("admission gate is closed")),
        }
    }

    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }
}
