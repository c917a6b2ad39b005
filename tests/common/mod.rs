//! Shared test support: an instrumented in-process memory provider
//!
//! Not every suite uses every knob.
#![allow(dead_code)]

use core::ptr::NonNull;
use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::alloc::{Layout, alloc, dealloc};
use std::collections::HashMap;

use parking_lot::Mutex;

use disjoint_pool::{MemoryProvider, PoolError, PoolResult};

/// Heap-backed provider counting every call, with fault injection
pub struct MockProvider {
    layouts: Mutex<HashMap<usize, Layout>>,
    alloc_calls: AtomicUsize,
    free_calls: AtomicUsize,
    /// Remaining allocations before synthetic OOM; `isize::MAX` = unlimited
    budget: AtomicIsize,
    page_size: usize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self::with_page_size(4096)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            layouts: Mutex::new(HashMap::new()),
            alloc_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
            budget: AtomicIsize::new(isize::MAX),
            page_size,
        }
    }

    /// Makes the next `n` allocations succeed and everything after fail
    pub fn set_alloc_budget(&self, n: isize) {
        self.budget.store(n, Ordering::SeqCst);
    }

    pub fn alloc_calls(&self) -> usize {
        self.alloc_calls.load(Ordering::SeqCst)
    }

    pub fn free_calls(&self) -> usize {
        self.free_calls.load(Ordering::SeqCst)
    }

    /// Coarse-grain allocations currently live
    pub fn live(&self) -> usize {
        self.layouts.lock().len()
    }
}

impl MemoryProvider for MockProvider {
    fn alloc(&self, size: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        if self.budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return Err(PoolError::OutOfHostMemory);
        }
        let align = alignment.max(1).next_power_of_two();
        let layout =
            Layout::from_size_align(size, align).map_err(|_| PoolError::InvalidArgument)?;

        // SAFETY: layout has nonzero size for every pool request.
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw).ok_or(PoolError::OutOfHostMemory)?;

        self.layouts.lock().insert(raw as usize, layout);
        self.alloc_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>, _size: usize) -> PoolResult<()> {
        let layout = self
            .layouts
            .lock()
            .remove(&(ptr.as_ptr() as usize))
            .ok_or(PoolError::MemoryProviderSpecific(-1))?;
        // SAFETY: ptr came from alloc() with exactly this layout.
        unsafe { dealloc(ptr.as_ptr(), layout) };
        self.free_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn min_page_size(&self) -> usize {
        self.page_size
    }
}
