//! Address-to-slab index used by the free path
//!
//! Every live slab registers two keys: the start of its aligned span and
//! the span's inclusive last byte. Because slabs are aligned to the span
//! size and never overlap, keys of different slabs are disjoint by
//! construction. `free` floors the incoming pointer to the span size and
//! probes the map with the result.
//!
//! The map lock is never held together with a bucket mutex in the
//! map-then-bucket direction: lookups copy out what the free path needs and
//! drop the lock before any bucket work. The reverse nesting (bucket mutex
//! held, map lock taken to register or unregister) is the only one that
//! occurs.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::slab::SlabHandle;
use crate::utils::align_down;

/// Everything the free path needs to know about a slab, copied out while
/// the index lock is held
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlabLookup {
    pub handle: SlabHandle,
    pub mem: usize,
    pub span: usize,
    pub slab_size: usize,
    pub bucket_idx: usize,
    pub chunk_size: usize,
}

impl SlabLookup {
    /// Whether `addr` belongs to the slab itself rather than merely
    /// colliding with one of its keys
    #[inline]
    pub(crate) fn owns(&self, addr: usize) -> bool {
        addr >= self.mem && addr < self.mem + self.span
    }
}

/// Concurrent ordered map from aligned addresses to slabs
#[derive(Debug, Default)]
pub(crate) struct SlabIndex {
    map: RwLock<BTreeMap<usize, SlabHandle>>,
}

impl SlabIndex {
    pub(crate) fn new() -> Self {
        Self {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    fn keys_of(handle: SlabHandle) -> (usize, usize) {
        // SAFETY: only geometry fields are read; the slab is live because
        // registration brackets its lifetime.
        let slab = unsafe { handle.get() };
        let span = slab.registered_span();
        let start = align_down(slab.mem_addr(), span);
        debug_assert_eq!(start, slab.mem_addr(), "slab base not span-aligned");
        (start, start + span - 1)
    }

    /// Registers a freshly created slab under both of its keys
    ///
    /// Duplicate registration is a programming error.
    pub(crate) fn register(&self, handle: SlabHandle) {
        let (start, last) = Self::keys_of(handle);
        let mut map = self.map.write();
        let prev = map.insert(start, handle);
        debug_assert!(prev.is_none(), "slab start key already registered");
        if last != start {
            let prev = map.insert(last, handle);
            debug_assert!(prev.is_none(), "slab end key already registered");
        }
    }

    /// Removes both keys of a slab about to be destroyed
    pub(crate) fn unregister(&self, handle: SlabHandle) {
        let (start, last) = Self::keys_of(handle);
        let mut map = self.map.write();
        let removed = map.remove(&start);
        debug_assert!(removed.is_some(), "slab start key not registered");
        if last != start {
            let removed = map.remove(&last);
            debug_assert!(removed.is_some(), "slab end key not registered");
        }
    }

    /// Looks up the slab registered under `key`
    ///
    /// The dispatch fields are copied while the read lock is held; the
    /// returned handle stays valid afterwards because the caller is freeing
    /// a still-allocated chunk of that slab, which pins it.
    pub(crate) fn locate(&self, key: usize) -> Option<SlabLookup> {
        let map = self.map.read();
        let handle = *map.get(&key)?;
        // SAFETY: the slab is registered, hence not destroyed; geometry
        // fields are immutable.
        let slab = unsafe { handle.get() };
        Some(SlabLookup {
            handle,
            mem: slab.mem_addr(),
            span: slab.registered_span(),
            slab_size: slab.slab_size(),
            bucket_idx: slab.bucket_idx(),
            chunk_size: slab.chunk_size(),
        })
    }

    /// Number of registered keys (not slabs)
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.read().len()
    }
}
