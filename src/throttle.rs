//! Bounded-concurrency gate shared by every fan-out in one operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// A counting semaphore with fixed capacity.
///
/// Clones share the same slots, so one `Throttle` handed to every stage of
/// an operation bounds the total number of in-flight requests.  It also
/// records the highest number of concurrent holders it has seen.
#[derive(Clone)]
pub struct Throttle {
    inner: Arc<Inner>,
}

struct Inner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

/// A held slot. Dropping it (or calling [`ThrottleSlot::done`]) frees the slot.
pub struct ThrottleSlot {
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl Throttle {
    /// A throttle with `capacity` slots; zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free slot.
    pub async fn take(&self) -> Result<ThrottleSlot> {
        let permit = self
            .inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::Task(format!("throttle closed: {}", e)))?;
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak.fetch_max(now, Ordering::SeqCst);
        Ok(ThrottleSlot {
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots held at the same time.
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::SeqCst)
    }
}

impl ThrottleSlot {
    pub fn done(self) {}
}

impl Drop for ThrottleSlot {
    fn drop(&mut self) {
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("capacity", &self.capacity())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
