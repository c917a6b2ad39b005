//! Statistics tracking types
//!
//! Counters live inside each bucket and piggyback on the bucket mutex;
//! snapshots copy them out for callers and for the teardown trace.

/// Per-bucket counters, updated under the bucket lock
///
/// All fields stay zero while `pool_trace == 0`; allocation/free counts are
/// only maintained at `pool_trace > 1`.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BucketStats {
    pub alloc_count: usize,
    pub alloc_pool_count: usize,
    pub free_count: usize,
    pub curr_slabs_in_use: usize,
    pub curr_slabs_in_pool: usize,
    pub max_slabs_in_use: usize,
    pub max_slabs_in_pool: usize,
}

/// Point-in-time view of one bucket
#[derive(Debug, Clone, Copy)]
pub struct BucketStatsSnapshot {
    /// Size class served by this bucket
    pub bucket_size: usize,
    /// Provider allocation size of this bucket's slabs
    pub slab_alloc_size: usize,
    /// Retained empty slabs currently parked in the available list
    /// (chunked-mode buckets only)
    pub chunked_slabs_in_pool: usize,
    pub alloc_count: usize,
    pub alloc_pool_count: usize,
    pub free_count: usize,
    pub curr_slabs_in_use: usize,
    pub curr_slabs_in_pool: usize,
    pub max_slabs_in_use: usize,
    pub max_slabs_in_pool: usize,
}

/// Point-in-time view of a whole pool
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// One entry per bucket, ordered by size class
    pub buckets: Vec<BucketStatsSnapshot>,
    /// Net bytes this pool has parked in its buckets (`CurPoolSize`)
    pub pooled_bytes: isize,
    /// Bytes retained across every pool sharing this pool's limits
    pub retained_bytes: usize,
}

impl PoolStats {
    /// Largest slab allocation size among buckets that served a request
    pub fn high_bucket_size(&self) -> usize {
        self.buckets
            .iter()
            .filter(|b| b.alloc_count > 0)
            .map(|b| b.slab_alloc_size)
            .max()
            .unwrap_or(0)
    }

    /// Highest peak of concurrently used slabs over all buckets
    pub fn peak_slabs_in_use(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.max_slabs_in_use)
            .max()
            .unwrap_or(0)
    }
}
