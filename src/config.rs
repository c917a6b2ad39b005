//! Disjoint pool configuration

use std::borrow::Cow;
use std::sync::Arc;

use crate::error::{PoolError, PoolResult};
use crate::limits::SharedLimits;
use crate::utils::is_power_of_two;

/// Smallest bucket size the pool will ever create
pub const MIN_BUCKET_DEFAULT: usize = 8;

/// Configuration for a [`DisjointPool`](crate::DisjointPool)
#[derive(Debug, Clone)]
pub struct DisjointPoolConfig {
    /// Minimum size of a coarse-grain provider allocation; also the
    /// alignment every slab is placed at. Must be a power of two.
    pub slab_min_size: usize,

    /// Requests with an effective size above this bypass the pool and go
    /// straight to the provider
    pub max_poolable_size: usize,

    /// Maximum retained empty slabs per whole-slab-mode bucket
    /// (chunked-mode buckets always retain at most one)
    pub capacity: usize,

    /// Smallest bucket size; must be a nonzero power of two. Clamped into
    /// `[MIN_BUCKET_DEFAULT, CUT_OFF]` at pool creation.
    pub min_bucket_size: usize,

    /// Cap on retained bytes, shared with other pools when supplied.
    /// `None` gives this pool a private, unbounded instance.
    pub shared_limits: Option<Arc<SharedLimits>>,

    /// Trace verbosity: 0 disables statistics, 1 tracks slab counters,
    /// 2 additionally counts allocations and logs a summary at teardown,
    /// 3 additionally logs every allocation and free
    pub pool_trace: u8,

    /// Identifier used in trace output
    pub name: Cow<'static, str>,

    /// Fill pattern byte for memory handed out to the caller (debugging)
    pub alloc_pattern: Option<u8>,
    /// Fill pattern byte for memory returning to the pool (debugging)
    pub dealloc_pattern: Option<u8>,
}

impl Default for DisjointPoolConfig {
    fn default() -> Self {
        Self {
            slab_min_size: 64 * 1024,
            max_poolable_size: 2 * 1024 * 1024,
            capacity: 4,
            min_bucket_size: MIN_BUCKET_DEFAULT,
            shared_limits: None,
            pool_trace: 0,
            name: Cow::Borrowed("disjoint_pool"),
            alloc_pattern: if cfg!(debug_assertions) {
                Some(0xCC)
            } else {
                None
            },
            dealloc_pattern: if cfg!(debug_assertions) {
                Some(0xDD)
            } else {
                None
            },
        }
    }
}

impl DisjointPoolConfig {
    /// Production configuration - optimized for performance
    #[must_use]
    pub fn performance() -> Self {
        Self {
            alloc_pattern: None,
            dealloc_pattern: None,
            ..Self::default()
        }
    }

    /// Debug configuration - pattern fills and full tracing
    #[must_use]
    pub fn debug() -> Self {
        Self {
            pool_trace: 3,
            alloc_pattern: Some(0xCC),
            dealloc_pattern: Some(0xDD),
            ..Self::default()
        }
    }

    /// Sets the pool name used in traces
    #[must_use]
    pub fn with_name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets an external shared-limits handle
    #[must_use]
    pub fn with_shared_limits(mut self, limits: Arc<SharedLimits>) -> Self {
        self.shared_limits = Some(limits);
        self
    }

    /// Checks the parameters the bucket table depends on
    ///
    /// # Errors
    /// Returns [`PoolError::InvalidArgument`] when `min_bucket_size` or
    /// `slab_min_size` is zero or not a power of two.
    pub fn validate(&self) -> PoolResult<()> {
        if !is_power_of_two(self.min_bucket_size) {
            return Err(PoolError::InvalidArgument);
        }
        if !is_power_of_two(self.slab_min_size) {
            return Err(PoolError::InvalidArgument);
        }
        Ok(())
    }
}
