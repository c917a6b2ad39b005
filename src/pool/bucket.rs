//! Bucket: the freelists and retention policy for one size class
//!
//! A bucket owns every slab serving its size. Two lists partition them:
//! `available` (at least one free chunk) and `unavailable` (full). The head
//! of `available` is the slab the next allocation comes from. Both lists
//! are plain vectors of stable slab handles; each slab remembers its list
//! and position, so moving between lists is O(1) via `swap_remove`.
//!
//! Buckets up to half the slab size operate in chunked mode and carve slabs
//! into chunks; larger buckets hand out whole slabs. An empty slab is
//! either parked in the pool (counted against the shared limits) or
//! returned to the provider, decided by [`Bucket::can_pool`].

use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::allocator::PoolShared;
use super::slab::{ListSlot, Slab, SlabHandle};
use super::stats::{BucketStats, BucketStatsSnapshot};
use crate::error::PoolResult;
use crate::poison::annotate_memory_inaccessible;
use crate::provider::MemoryProvider;

/// Freelist state, protected by the bucket mutex
#[derive(Default)]
pub(crate) struct BucketState {
    /// Slabs with at least one free chunk; the head is the last element
    available: Vec<SlabHandle>,
    /// Full slabs
    unavailable: Vec<SlabHandle>,
    /// Empty slabs currently parked inside `available` (chunked mode).
    /// Kept as a counter so the retention check never walks the list.
    chunked_slabs_in_pool: usize,
    stats: BucketStats,
}

impl BucketState {
    fn head_available(&self) -> Option<SlabHandle> {
        self.available.last().copied()
    }

    fn push_available(&mut self, handle: SlabHandle) {
        // SAFETY: bucket lock held by the caller.
        unsafe { handle.get() }.set_link(ListSlot {
            in_available: true,
            pos: self.available.len(),
        });
        self.available.push(handle);
    }

    fn push_unavailable(&mut self, handle: SlabHandle) {
        // SAFETY: bucket lock held by the caller.
        unsafe { handle.get() }.set_link(ListSlot {
            in_available: false,
            pos: self.unavailable.len(),
        });
        self.unavailable.push(handle);
    }

    fn unlink(&mut self, handle: SlabHandle) {
        // SAFETY: bucket lock held by the caller.
        let slot = unsafe { handle.get() }.link();
        let list = if slot.in_available {
            &mut self.available
        } else {
            &mut self.unavailable
        };
        debug_assert_eq!(list[slot.pos], handle);
        list.swap_remove(slot.pos);
        if let Some(&moved) = list.get(slot.pos) {
            // SAFETY: bucket lock held; `moved` is another slab of this bucket.
            unsafe { moved.get() }.set_link(ListSlot {
                in_available: slot.in_available,
                pos: slot.pos,
            });
        }
        // SAFETY: bucket lock held.
        unsafe { handle.get() }.set_link(ListSlot::UNLINKED);
    }
}

/// One size class of the pool
pub(crate) struct Bucket<P: MemoryProvider> {
    /// Chunk size served by this bucket
    size: usize,
    /// Position in the pool's bucket table; slabs carry it so the free
    /// path can find its way back without a pointer cycle
    table_idx: usize,
    shared: Arc<PoolShared<P>>,
    state: Mutex<BucketState>,
}

impl<P: MemoryProvider> Bucket<P> {
    pub(crate) fn new(size: usize, table_idx: usize, shared: Arc<PoolShared<P>>) -> Self {
        Self {
            size,
            table_idx,
            shared,
            state: Mutex::new(BucketState::default()),
        }
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    fn slab_min_size(&self) -> usize {
        self.shared.config.slab_min_size
    }

    /// Requests at most this size use chunks; anything larger in this
    /// bucket takes a whole slab
    #[inline]
    pub(crate) fn chunk_cut_off(&self) -> usize {
        self.slab_min_size() / 2
    }

    /// Size of the provider allocation backing one slab
    #[inline]
    pub(crate) fn slab_alloc_size(&self) -> usize {
        self.size.max(self.slab_min_size())
    }

    #[inline]
    pub(crate) fn is_chunked(&self) -> bool {
        self.size <= self.chunk_cut_off()
    }

    /// Retention cap: one parked slab is enough for chunked buckets, the
    /// configured capacity applies to whole-slab buckets
    fn capacity(&self) -> usize {
        if self.is_chunked() {
            1
        } else {
            self.shared.config.capacity
        }
    }

    #[inline]
    fn pool_trace(&self) -> u8 {
        self.shared.config.pool_trace
    }

    /// Obtains a coarse-grain allocation and registers the new slab
    ///
    /// The only fallible step on the allocation hot path. Failure leaves no
    /// partial state: the slab header is built only after the provider
    /// delivered the memory.
    fn create_slab(&self) -> PoolResult<SlabHandle> {
        let slab_min_size = self.slab_min_size();
        let slab_size = self.slab_alloc_size();
        let mem = self.shared.provider.alloc(slab_size, slab_min_size)?;
        annotate_memory_inaccessible(
            mem.as_ptr(),
            slab_size,
            self.shared.config.dealloc_pattern,
        );

        let handle = SlabHandle::alloc(Slab::new(
            mem,
            slab_size,
            self.size,
            slab_min_size,
            self.table_idx,
        ));
        // Bucket lock is held here; taking the index lock nested in this
        // direction is the one permitted nesting.
        self.shared.index.register(handle);
        trace!(bucket = self.size, slab_size, "created slab");
        Ok(handle)
    }

    /// Returns the slab's memory to the provider and frees the header
    ///
    /// The slab must already be unlinked, and unregistered unless the whole
    /// pool is being torn down. A provider refusing the memory cannot fail
    /// the caller; it is logged and swallowed.
    fn destroy_slab(&self, handle: SlabHandle) {
        // SAFETY: handle is live until release() below.
        let slab = unsafe { handle.get() };
        let mem = slab.mem();
        let slab_size = slab.slab_size();
        trace!(bucket = self.size, slab_size, "destroying slab");

        if let Err(err) = self.shared.provider.free(mem, slab_size) {
            warn!(bucket = self.size, %err, "provider rejected slab memory");
        }
        // SAFETY: unlinked and unregistered per the contract above; this is
        // the final use of the handle.
        unsafe { handle.release() };
    }

    /// Adjusts slab counters; `pool_trace == 0` disables all of them
    fn update_stats(&self, state: &mut BucketState, in_use: isize, in_pool: isize) {
        if self.pool_trace() == 0 {
            return;
        }
        let stats = &mut state.stats;
        stats.curr_slabs_in_use = stats.curr_slabs_in_use.saturating_add_signed(in_use);
        stats.max_slabs_in_use = stats.max_slabs_in_use.max(stats.curr_slabs_in_use);
        stats.curr_slabs_in_pool = stats.curr_slabs_in_pool.saturating_add_signed(in_pool);
        stats.max_slabs_in_pool = stats.max_slabs_in_pool.max(stats.curr_slabs_in_pool);
        self.shared
            .pooled_bytes
            .fetch_add(in_pool * self.slab_alloc_size() as isize, Ordering::Relaxed);
    }

    /// A parked slab is leaving the pool for active use
    fn decrement_pool(&self, state: &mut BucketState) {
        self.update_stats(state, 1, -1);
        self.shared.limits.release(self.slab_alloc_size());
    }

    /// Decides whether an empty slab is retained
    ///
    /// Rejects when the bucket would exceed its own capacity, then tries to
    /// reserve the slab's bytes against the shared limits; the reservation
    /// re-checks the cap on every CAS round.
    fn can_pool(&self, state: &mut BucketState) -> bool {
        let would_be_free = if self.is_chunked() {
            state.chunked_slabs_in_pool + 1
        } else {
            state.available.len() + 1
        };

        if would_be_free <= self.capacity()
            && self.shared.limits.try_reserve(self.slab_alloc_size())
        {
            if self.is_chunked() {
                state.chunked_slabs_in_pool += 1;
            }
            self.update_stats(state, -1, 1);
            return true;
        }

        self.update_stats(state, -1, 0);
        false
    }

    /// Head of `available`, creating a slab when the list is empty
    /// (chunked mode). The returned flag reports whether the allocation was
    /// served from pooled memory.
    fn get_avail_slab(&self, state: &mut BucketState) -> PoolResult<(SlabHandle, bool)> {
        match state.head_available() {
            None => {
                let handle = self.create_slab()?;
                state.push_available(handle);
                self.update_stats(state, 1, 0);
                Ok((handle, false))
            }
            Some(handle) => {
                // SAFETY: bucket lock held.
                if unsafe { handle.get() }.num_allocated() == 0 {
                    // The head was an empty slab parked in the pool; it is
                    // leaving the pool now.
                    state.chunked_slabs_in_pool -= 1;
                    self.decrement_pool(state);
                }
                // Serving from an existing slab counts as a pool hit.
                Ok((handle, true))
            }
        }
    }

    /// Head of `available` for whole-slab use
    fn get_avail_full_slab(&self, state: &mut BucketState) -> PoolResult<(SlabHandle, bool)> {
        match state.head_available() {
            None => {
                let handle = self.create_slab()?;
                state.push_available(handle);
                self.update_stats(state, 1, 0);
                Ok((handle, false))
            }
            Some(handle) => {
                self.decrement_pool(state);
                Ok((handle, true))
            }
        }
    }

    /// Allocates one chunk (chunked mode)
    pub(crate) fn get_chunk(&self) -> PoolResult<(NonNull<u8>, bool)> {
        let mut state = self.state.lock();
        let (handle, from_pool) = self.get_avail_slab(&mut state)?;
        // SAFETY: bucket lock held.
        let slab = unsafe { handle.get() };
        let chunk = slab.get_chunk();

        if !slab.has_available() {
            state.unlink(handle);
            state.push_unavailable(handle);
        }
        Ok((chunk, from_pool))
    }

    /// Allocates a whole slab (whole-slab mode)
    pub(crate) fn get_slab(&self) -> PoolResult<(NonNull<u8>, bool)> {
        let mut state = self.state.lock();
        let (handle, from_pool) = self.get_avail_full_slab(&mut state)?;
        // SAFETY: bucket lock held.
        let mem = unsafe { handle.get() }.mem();

        state.unlink(handle);
        state.push_unavailable(handle);
        Ok((mem, from_pool))
    }

    /// Releases a chunk; returns whether the memory stayed in the pool
    pub(crate) fn free_chunk(&self, ptr: NonNull<u8>, handle: SlabHandle) -> bool {
        let mut state = self.state.lock();
        // SAFETY: bucket lock held; the caller's pointer pins this slab.
        let slab = unsafe { handle.get() };
        slab.free_chunk(ptr);

        // A previously full slab has a free chunk again.
        if slab.num_allocated() + 1 == slab.num_chunks() {
            state.unlink(handle);
            state.push_available(handle);
        }

        if slab.num_allocated() == 0 && !self.can_pool(&mut state) {
            self.shared.index.unregister(handle);
            state.unlink(handle);
            self.destroy_slab(handle);
            return false;
        }
        true
    }

    /// Releases a whole slab; returns whether it stayed in the pool
    pub(crate) fn free_slab(&self, handle: SlabHandle) -> bool {
        let mut state = self.state.lock();
        if self.can_pool(&mut state) {
            state.unlink(handle);
            state.push_available(handle);
            true
        } else {
            self.shared.index.unregister(handle);
            state.unlink(handle);
            self.destroy_slab(handle);
            false
        }
    }

    pub(crate) fn count_alloc(&self, from_pool: bool) {
        let mut state = self.state.lock();
        state.stats.alloc_count += 1;
        if from_pool {
            state.stats.alloc_pool_count += 1;
        }
    }

    pub(crate) fn count_free(&self) {
        self.state.lock().stats.free_count += 1;
    }

    pub(crate) fn snapshot(&self) -> BucketStatsSnapshot {
        let state = self.state.lock();
        BucketStatsSnapshot {
            bucket_size: self.size,
            slab_alloc_size: self.slab_alloc_size(),
            chunked_slabs_in_pool: state.chunked_slabs_in_pool,
            alloc_count: state.stats.alloc_count,
            alloc_pool_count: state.stats.alloc_pool_count,
            free_count: state.stats.free_count,
            curr_slabs_in_use: state.stats.curr_slabs_in_use,
            curr_slabs_in_pool: state.stats.curr_slabs_in_pool,
            max_slabs_in_use: state.stats.max_slabs_in_use,
            max_slabs_in_pool: state.stats.max_slabs_in_pool,
        }
    }

    /// Tears down every slab; pool destruction only. Handles are not
    /// unregistered one by one because the index dies right after.
    pub(crate) fn destroy_all_slabs(&self) {
        let mut state = self.state.lock();
        for handle in state.available.split_off(0) {
            self.destroy_slab(handle);
        }
        for handle in state.unavailable.split_off(0) {
            self.destroy_slab(handle);
        }
        state.chunked_slabs_in_pool = 0;
    }
}
