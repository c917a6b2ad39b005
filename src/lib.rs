//! # Disjoint Pool
//!
//! Segregated-fit memory pool between byte-sized allocation requests and a
//! coarse-grain [`MemoryProvider`].
//!
//! Allocations are a minimum of one slab (64 KiB by default) even when a
//! much smaller size is requested. Requests up to half a slab are served as
//! chunks carved out of a shared slab, so for 8-byte allocations only a
//! tiny fraction of requests ever reaches the provider; freeing such a
//! request only clears a bit. Larger poolable requests take a whole slab
//! each and are subject to pooling: a freed slab is retained for reuse,
//! bounded per bucket and by a [`SharedLimits`] cap that several pools may
//! share. Requests above the poolable limit bypass the pool entirely.

pub mod config;
pub mod error;
pub mod limits;
pub mod pool;
pub mod provider;
pub mod utils;

mod poison;

// Re-export main types
pub use config::{DisjointPoolConfig, MIN_BUCKET_DEFAULT};
pub use error::{PoolError, PoolResult};
pub use limits::SharedLimits;
pub use pool::{BucketStatsSnapshot, DisjointPool, PoolStats};
#[cfg(all(feature = "system-provider", unix))]
pub use provider::SystemProvider;
pub use provider::{MemoryProvider, TrackingProvider};
