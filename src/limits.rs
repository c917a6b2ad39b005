//! Shared accounting of bytes retained in pools
//!
//! A [`SharedLimits`] instance bounds how many bytes of coarse-grain memory
//! may sit idle in pools at any moment. Several pools can share one instance
//! (wrap it in an [`Arc`](std::sync::Arc) and hand it to each pool's
//! configuration); a pool without an explicit instance gets a private,
//! effectively unbounded one.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::utils::Backoff;

/// Atomic counter of bytes currently retained in pools, bounded by a cap
///
/// ## Invariants
///
/// - `total() <= max_size()` is never violated by a successful
///   [`try_reserve`](SharedLimits::try_reserve); the bound is re-checked on
///   every CAS iteration, so contention can never push the counter past the
///   cap, not even transiently.
/// - [`release`](SharedLimits::release) must only undo a previous successful
///   reservation of the same size.
#[derive(Debug)]
pub struct SharedLimits {
    max_size: usize,
    total_size: AtomicUsize,
}

impl SharedLimits {
    /// Creates a limits instance with the given cap in bytes
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            total_size: AtomicUsize::new(0),
        }
    }

    /// Creates an effectively unbounded instance
    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    /// Returns the configured cap
    #[inline]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns the bytes currently accounted as retained
    #[inline]
    pub fn total(&self) -> usize {
        self.total_size.load(Ordering::Acquire)
    }

    /// Attempts to account `bytes` more retained memory
    ///
    /// Returns `false` when the reservation would exceed the cap. A failed
    /// CAS re-reads the counter and re-checks the bound, so the loop exits
    /// as soon as concurrent reservations have consumed the remaining
    /// headroom.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        let mut current = self.total_size.load(Ordering::Acquire);
        let mut backoff = Backoff::new();
        loop {
            let Some(new_total) = current.checked_add(bytes) else {
                return false;
            };
            if new_total > self.max_size {
                return false;
            }
            match self.total_size.compare_exchange_weak(
                current,
                new_total,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => {
                    current = observed;
                    backoff.spin();
                }
            }
        }
    }

    /// Releases a previously reserved amount
    #[inline]
    pub fn release(&self, bytes: usize) {
        let prev = self.total_size.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "released more than was reserved");
    }
}
