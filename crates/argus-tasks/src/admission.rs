//! Hard admission gate for calls to the companion streaming service.
//!
//! Callers never wait for a permit: when none is free the attempt fails at
//! once and the caller answers with a capacity error. Long-lived streaming
//! pulls queued behind each other would add latency to every viewer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{PoolError, PoolResult};

/// Default number of concurrent proxied calls.
pub const DEFAULT_MAX_CONCURRENT: usize = 12;

/// A counting gate bounding concurrent proxied calls.
///
/// Cloning is cheap; clones share the same permits.
///
/// # Example
///
/// ```rust
/// use argus_tasks::AdmissionLimiter;
///
/// let limiter = AdmissionLimiter::new(1).unwrap();
///
/// let permit = limiter.try_acquire().expect("one permit is free");
/// assert!(limiter.try_acquire().is_none());
///
/// drop(permit);
/// assert!(limiter.try_acquire().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct AdmissionLimiter {
    semaphore: Arc<Semaphore>,
    max: usize,
    /// Permits taken through [`AdmissionLimiter::acquire_nonblocking`] and not
    /// yet returned through [`AdmissionLimiter::release`].
    raw_held: Arc<AtomicUsize>,
}

/// A scoped permit. The slot is returned when the permit is dropped, on
/// every exit path.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl Default for AdmissionLimiter {
    fn default() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENT)),
            max: DEFAULT_MAX_CONCURRENT,
            raw_held: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AdmissionLimiter {
    /// Creates a limiter with `max` permits.
    pub fn new(max: usize) -> PoolResult<Self> {
        if max == 0 {
            return Err(PoolError::invalid_config(
                "admission limit must be greater than 0",
            ));
        }
        Ok(Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            raw_held: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Takes a permit without waiting. Pair every `true` with one
    /// [`release`](Self::release).
    pub fn acquire_nonblocking(&self) -> bool {
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.raw_held.fetch_add(1, Ordering::AcqRel);
                true
            }
            Err(_) => {
                tracing::debug!(max = self.max, "admission refused");
                false
            }
        }
    }

    /// Returns a permit taken with
    /// [`acquire_nonblocking`](Self::acquire_nonblocking).
    ///
    /// An unmatched call is ignored, so the count never exceeds `max`.
    pub fn release(&self) {
        let returned = self
            .raw_held
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| held.checked_sub(1))
            .is_ok();
        if returned {
            self.semaphore.add_permits(1);
        } else {
            tracing::warn!("admission release without a matching acquire ignored");
        }
    }

    /// Takes a scoped permit without waiting.
    pub fn try_acquire(&self) -> Option<AdmissionPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(AdmissionPermit { _permit: permit }),
            Err(_) => {
                tracing::debug!(max = self.max, "admission refused");
                None
            }
        }
    }

    /// Returns the number of free permits.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Returns the number of permits in use.
    pub fn in_use(&self) -> usize {
        self.max.saturating_sub(self.available())
    }

    /// Returns the configured maximum.
    pub fn max(&self) -> usize {
        self.max
    }
}
