//! Connection slots.
//!
//! A slot is taken before the upgrade handshake is authenticated and held
//! for the life of the session, so concurrent upgrades cannot overshoot
//! `max_connections`.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Fixed pool of connection slots.
#[derive(Clone)]
pub struct ConnectionSlots {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConnectionSlots {
    /// Pool of `capacity` slots, clamped to what a semaphore can hold.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.min(Semaphore::MAX_PERMITS);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot without waiting. The slot is returned when the permit drops.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
