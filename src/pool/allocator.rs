//! Main disjoint pool implementation
//!
//! The pool owns an ordered table of buckets sized `2^k` and `1.5 * 2^k`
//! between the minimum bucket size and the 2 GiB cut-off. Allocations are
//! routed to the first bucket at least as large as the (alignment-adjusted)
//! request; anything above the poolable limit bypasses the table and goes
//! straight to the provider. Frees look the pointer up in the slab index
//! and fall back to the provider on a miss.
//!
//! Allocations of size up to half a slab use chunks carved from a shared
//! slab, so only a small fraction of requests reach the provider at all.
//! Larger poolable requests take a whole slab each; freed slabs are parked
//! in their bucket, bounded by the shared limits, instead of going back to
//! the provider.

use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicIsize, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::bucket::Bucket;
use super::index::SlabIndex;
use super::stats::PoolStats;
use crate::config::{DisjointPoolConfig, MIN_BUCKET_DEFAULT};
use crate::error::{PoolError, PoolResult};
use crate::limits::SharedLimits;
use crate::poison::{annotate_memory_inaccessible, annotate_memory_undefined};
use crate::provider::MemoryProvider;
use crate::utils::{align_down, align_up, leftmost_set_bit_pos, next_power_of_two};

/// Largest size served through buckets; anything above goes to the provider
pub const CUT_OFF: usize = 1 << 31;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Most recent failure per thread, tagged with the id of the pool that
    /// produced it so two pools on one thread do not cross-talk
    static LAST_ALLOC_ERROR: Cell<(u64, Option<PoolError>)> = const { Cell::new((0, None)) };
}

/// State shared between the pool front end and its buckets
pub(crate) struct PoolShared<P: MemoryProvider> {
    pub(crate) provider: P,
    pub(crate) config: DisjointPoolConfig,
    pub(crate) limits: Arc<SharedLimits>,
    pub(crate) index: SlabIndex,
    pub(crate) provider_min_page_size: usize,
    /// Net bytes this pool currently parks in its buckets
    pub(crate) pooled_bytes: AtomicIsize,
}

/// Segregated-fit pool over a coarse-grain [`MemoryProvider`]
pub struct DisjointPool<P: MemoryProvider> {
    shared: Arc<PoolShared<P>>,
    buckets: Box<[Bucket<P>]>,
    min_bucket_size_exp: u32,
    pool_id: u64,
}

/// Bucket size classes generated from the clamped minimum bucket size:
/// powers of two and the value halfway to the next one, closed by `CUT_OFF`
fn bucket_sizes(min_bucket_size: usize) -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut size1 = min_bucket_size;
    let mut size2 = size1 + size1 / 2;
    while size2 < CUT_OFF {
        sizes.push(size1);
        sizes.push(size2);
        size1 *= 2;
        size2 *= 2;
    }
    sizes.push(CUT_OFF);
    sizes
}

/// Index of the smallest bucket with `bucket_size >= size`
///
/// Post-condition: `sizes[idx] >= size` and, for `idx > 0`,
/// `sizes[idx - 1] < size`.
fn size_to_bucket_idx(min_bucket_size_exp: u32, size: usize) -> usize {
    debug_assert!(size > 0 && size <= CUT_OFF);
    if size < (1usize << min_bucket_size_exp) {
        return 0;
    }

    let position = leftmost_set_bit_pos(size);
    let is_power_of_2 = size & (size - 1) == 0;
    let above_halfway = !is_power_of_2 && (size - 1) & (1usize << (position - 1)) != 0;

    ((position - min_bucket_size_exp) as usize) * 2
        + usize::from(!is_power_of_2)
        + usize::from(above_halfway)
}

impl<P: MemoryProvider> DisjointPool<P> {
    /// Builds a pool over `provider` with the given configuration
    ///
    /// # Errors
    /// [`PoolError::InvalidArgument`] when the configuration does not
    /// validate (see [`DisjointPoolConfig::validate`]).
    pub fn new(provider: P, config: DisjointPoolConfig) -> PoolResult<Self> {
        config.validate()?;

        let min_bucket_size = config.min_bucket_size.min(CUT_OFF).max(MIN_BUCKET_DEFAULT);
        let min_bucket_size_exp = leftmost_set_bit_pos(min_bucket_size);
        let provider_min_page_size = provider.min_page_size();
        let limits = config
            .shared_limits
            .clone()
            .unwrap_or_else(|| Arc::new(SharedLimits::unbounded()));

        let shared = Arc::new(PoolShared {
            provider,
            config,
            limits,
            index: SlabIndex::new(),
            provider_min_page_size,
            pooled_bytes: AtomicIsize::new(0),
        });

        let buckets = bucket_sizes(min_bucket_size)
            .into_iter()
            .enumerate()
            .map(|(idx, size)| Bucket::new(size, idx, Arc::clone(&shared)))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            shared,
            buckets,
            min_bucket_size_exp,
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    /// The provider this pool allocates from
    pub fn provider(&self) -> &P {
        &self.shared.provider
    }

    /// The shared-limits instance bounding this pool's retention
    pub fn limits(&self) -> &Arc<SharedLimits> {
        &self.shared.limits
    }

    /// Pool name used in traces
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    fn find_bucket(&self, size: usize) -> &Bucket<P> {
        let idx = size_to_bucket_idx(self.min_bucket_size_exp, size);
        let bucket = &self.buckets[idx];
        debug_assert!(bucket.size() >= size);
        if idx > 0 {
            debug_assert!(self.buckets[idx - 1].size() < size);
        }
        bucket
    }

    fn record_error(&self, err: PoolError) {
        LAST_ALLOC_ERROR.with(|slot| slot.set((self.pool_id, Some(err))));
    }

    /// Most recent failure this pool produced on the calling thread
    ///
    /// A null return from the allocation entry points distinguishes "failed"
    /// from "zero-size request" through this slot; the zero-size fast path
    /// leaves it untouched.
    pub fn last_allocation_error(&self) -> Option<PoolError> {
        LAST_ALLOC_ERROR.with(|slot| {
            let (id, err) = slot.get();
            if id == self.pool_id { err } else { None }
        })
    }

    fn try_allocate(&self, size: usize, alignment: usize) -> PoolResult<Option<NonNull<u8>>> {
        if size == 0 {
            return Ok(None);
        }
        let alignment = if alignment <= 1 {
            1
        } else {
            next_power_of_two(alignment)
        };

        let aligned_size = if alignment == 1 {
            size
        } else if alignment <= self.shared.provider_min_page_size {
            // Buckets of a multiple of the alignment start every chunk on
            // an aligned boundary, and slabs themselves are page-aligned;
            // rounding the size up is all it takes. Saturating math keeps
            // absurd sizes on the bypass path instead of overflowing.
            if size > 1 {
                align_down(size.saturating_add(alignment - 1), alignment)
            } else {
                alignment
            }
        } else {
            // Slabs are only aligned to the page size; reserve enough slack
            // to align inside the chunk.
            size.saturating_add(alignment - 1)
        };

        if aligned_size > self.shared.config.max_poolable_size {
            let ptr = self.shared.provider.alloc(size, alignment)?;
            annotate_memory_undefined(ptr.as_ptr(), size, self.shared.config.alloc_pattern);
            if self.shared.config.pool_trace > 2 {
                trace!(
                    pool = %self.shared.config.name,
                    size,
                    alignment,
                    ptr = ?ptr.as_ptr(),
                    "allocated from provider"
                );
            }
            return Ok(Some(ptr));
        }

        let bucket = self.find_bucket(aligned_size);
        let (ptr, from_pool) = if aligned_size > bucket.chunk_cut_off() {
            bucket.get_slab()?
        } else {
            bucket.get_chunk()?
        };

        if self.shared.config.pool_trace > 1 {
            bucket.count_alloc(from_pool);
        }

        let raw = if alignment > 1 {
            align_up(ptr.as_ptr() as usize, alignment) as *mut u8
        } else {
            ptr.as_ptr()
        };
        let annotate_len = if alignment > 1 { size } else { bucket.size() };
        annotate_memory_undefined(raw, annotate_len, self.shared.config.alloc_pattern);

        if self.shared.config.pool_trace > 2 {
            trace!(
                pool = %self.shared.config.name,
                size,
                alignment,
                from_pool,
                ptr = ?raw,
                "allocated"
            );
        }

        // SAFETY: raw is ptr aligned forward within its chunk, never null.
        Ok(Some(unsafe { NonNull::new_unchecked(raw) }))
    }

    fn alloc_entry(&self, size: usize, alignment: usize) -> *mut u8 {
        match self.try_allocate(size, alignment) {
            Ok(Some(ptr)) => ptr.as_ptr(),
            Ok(None) => core::ptr::null_mut(),
            Err(err) => {
                self.record_error(err);
                core::ptr::null_mut()
            }
        }
    }

    /// Allocates `size` bytes; null on failure or zero size
    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.alloc_entry(size, 1)
    }

    /// Allocates `size` bytes aligned to `alignment`
    ///
    /// An alignment of 0 or 1 is equivalent to [`malloc`](Self::malloc);
    /// other values are rounded up to a power of two.
    pub fn aligned_malloc(&self, size: usize, alignment: usize) -> *mut u8 {
        self.alloc_entry(size, alignment)
    }

    /// Unsupported; returns null and records [`PoolError::NotSupported`]
    pub fn calloc(&self, _num: usize, _size: usize) -> *mut u8 {
        self.record_error(PoolError::NotSupported);
        core::ptr::null_mut()
    }

    /// Unsupported; returns null and records [`PoolError::NotSupported`]
    pub fn realloc(&self, _ptr: *mut u8, _size: usize) -> *mut u8 {
        self.record_error(PoolError::NotSupported);
        core::ptr::null_mut()
    }

    /// Not reported by this pool; always 0
    pub fn malloc_usable_size(&self, _ptr: *mut u8) -> usize {
        0
    }

    /// Releases an allocation; a null pointer is a successful no-op
    pub fn free(&self, ptr: *mut u8) -> PoolResult<()> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        let addr = ptr.as_ptr() as usize;
        let key = align_down(addr, self.shared.config.slab_min_size);

        let Some(lookup) = self.shared.index.locate(key) else {
            return self.provider_free(ptr);
        };
        if !lookup.owns(addr) {
            // A non-pool allocation can sit right next to a slab and floor
            // to the same key; the range check catches it.
            return self.provider_free(ptr);
        }

        let bucket = &self.buckets[lookup.bucket_idx];
        if self.shared.config.pool_trace > 1 {
            bucket.count_free();
        }

        // Clamp the fill so a pointer that was aligned up inside its chunk
        // cannot poison past the chunk (or slab) end.
        let offset = addr - lookup.mem;
        let fill_len = if bucket.is_chunked() {
            lookup.chunk_size - offset % lookup.chunk_size
        } else {
            (lookup.slab_size - offset).min(lookup.chunk_size)
        };
        annotate_memory_inaccessible(ptr.as_ptr(), fill_len, self.shared.config.dealloc_pattern);

        let to_pool = if bucket.is_chunked() {
            bucket.free_chunk(ptr, lookup.handle)
        } else {
            bucket.free_slab(lookup.handle)
        };

        if self.shared.config.pool_trace > 2 {
            trace!(
                pool = %self.shared.config.name,
                ptr = ?ptr.as_ptr(),
                to_pool,
                "freed"
            );
        }
        Ok(())
    }

    /// Provider-direct release for pointers no slab owns
    fn provider_free(&self, ptr: NonNull<u8>) -> PoolResult<()> {
        let size = self.shared.provider.base_size(ptr).unwrap_or(0);
        self.shared
            .provider
            .free(ptr, size)
            .inspect_err(|&err| self.record_error(err))
    }

    /// Snapshot of all bucket counters plus the retention totals
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            buckets: self.buckets.iter().map(Bucket::snapshot).collect(),
            pooled_bytes: self.shared.pooled_bytes.load(Ordering::Relaxed),
            retained_bytes: self.shared.limits.total(),
        }
    }

    /// Net bytes this pool has parked in its buckets
    pub fn pooled_bytes(&self) -> isize {
        self.shared.pooled_bytes.load(Ordering::Relaxed)
    }
}

impl<P: MemoryProvider> fmt::Debug for DisjointPool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisjointPool")
            .field("name", &self.shared.config.name)
            .field("buckets", &self.buckets.len())
            .field("slab_min_size", &self.shared.config.slab_min_size)
            .field("pooled_bytes", &self.pooled_bytes())
            .finish_non_exhaustive()
    }
}

impl<P: MemoryProvider> Drop for DisjointPool<P> {
    fn drop(&mut self) {
        if self.shared.config.pool_trace > 1 {
            let stats = self.stats();
            for bucket in stats.buckets.iter().filter(|b| b.alloc_count > 0) {
                debug!(
                    pool = %self.shared.config.name,
                    bucket = bucket.bucket_size,
                    allocs = bucket.alloc_count,
                    frees = bucket.free_count,
                    pool_hits = bucket.alloc_pool_count,
                    peak_in_use = bucket.max_slabs_in_use,
                    peak_in_pool = bucket.max_slabs_in_pool,
                    "bucket statistics"
                );
            }
            info!(
                pool = %self.shared.config.name,
                retained = stats.retained_bytes,
                high_bucket = stats.high_bucket_size(),
                peak_slabs = stats.peak_slabs_in_use(),
                "pool statistics"
            );
        }

        // Buckets go first; the index full of now-dangling handles dies
        // with the shared state right after and is never consulted again.
        for bucket in self.buckets.iter() {
            bucket.destroy_all_slabs();
        }
    }
}
