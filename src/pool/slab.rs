//! Slab: one coarse-grain allocation sliced into fixed-size chunks
//!
//! # Safety
//!
//! A slab has no lock of its own. Every mutation goes through the owning
//! bucket, which serializes access with its mutex; the interior-mutable
//! counters below are therefore plain `Cell`s rather than atomics. The
//! immutable geometry (base pointer, sizes) may additionally be read under
//! the slab-index lock on the free path.
//!
//! ## Invariants
//!
//! - `num_allocated` equals the number of set entries in `chunks`
//! - `first_free_idx <= num_chunks` and never exceeds the true first free
//!   index: it moves forward to the chunk chosen by an allocation and is
//!   pulled back to the index of any freed chunk below it
//! - a slab is linked into exactly one bucket list at a time

use core::cell::Cell;
use core::ptr::NonNull;

/// Position of a slab inside one of its bucket's two lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListSlot {
    pub in_available: bool,
    pub pos: usize,
}

impl ListSlot {
    pub(crate) const UNLINKED: Self = Self {
        in_available: false,
        pos: usize::MAX,
    };
}

/// One provider allocation of `slab_size` bytes, chunked by its bucket
pub(crate) struct Slab {
    /// Base of the provider allocation
    mem: NonNull<u8>,
    /// Size actually requested from the provider
    slab_size: usize,
    /// Size of one chunk (the owning bucket's size class)
    chunk_size: usize,
    /// `registered_span / chunk_size`; zero for oversized whole-slab buckets
    num_chunks: usize,
    /// The address range registered in the slab index
    registered_span: usize,
    /// Position of the owning bucket in the pool's bucket table
    bucket_idx: usize,

    /// Chunk states: set = allocated, clear = free
    chunks: Box<[Cell<bool>]>,
    num_allocated: Cell<usize>,
    /// Search hint, a lower bound on the first free index
    first_free_idx: Cell<usize>,
    link: Cell<ListSlot>,
}

impl Slab {
    pub(crate) fn new(
        mem: NonNull<u8>,
        slab_size: usize,
        chunk_size: usize,
        registered_span: usize,
        bucket_idx: usize,
    ) -> Self {
        let num_chunks = registered_span / chunk_size;
        Self {
            mem,
            slab_size,
            chunk_size,
            num_chunks,
            registered_span,
            bucket_idx,
            chunks: (0..num_chunks).map(|_| Cell::new(false)).collect(),
            num_allocated: Cell::new(0),
            first_free_idx: Cell::new(0),
            link: Cell::new(ListSlot::UNLINKED),
        }
    }

    #[inline]
    pub(crate) fn mem(&self) -> NonNull<u8> {
        self.mem
    }

    #[inline]
    pub(crate) fn mem_addr(&self) -> usize {
        self.mem.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn slab_size(&self) -> usize {
        self.slab_size
    }

    #[inline]
    pub(crate) fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[inline]
    pub(crate) fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    #[inline]
    pub(crate) fn registered_span(&self) -> usize {
        self.registered_span
    }

    #[inline]
    pub(crate) fn bucket_idx(&self) -> usize {
        self.bucket_idx
    }

    #[inline]
    pub(crate) fn num_allocated(&self) -> usize {
        self.num_allocated.get()
    }

    #[inline]
    pub(crate) fn link(&self) -> ListSlot {
        self.link.get()
    }

    #[inline]
    pub(crate) fn set_link(&self, slot: ListSlot) {
        self.link.set(slot);
    }

    /// True while at least one chunk is free
    #[inline]
    pub(crate) fn has_available(&self) -> bool {
        self.num_allocated.get() != self.num_chunks
    }

    /// Whether `addr` falls inside the registered range
    ///
    /// The range spans `registered_span` bytes, not `slab_size`: for
    /// oversized slabs only the first span is indexed, and its base is the
    /// only pointer ever handed out.
    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.mem_addr();
        addr >= base && addr < base + self.registered_span
    }

    /// First free index at or after the hint
    fn find_first_available_chunk_idx(&self) -> usize {
        let hint = self.first_free_idx.get();
        match self.chunks[hint..].iter().position(|chunk| !chunk.get()) {
            Some(offset) => hint + offset,
            None => self.num_chunks,
        }
    }

    /// Claims the first free chunk
    ///
    /// Precondition: `has_available()`; the owning bucket guarantees it by
    /// creating a fresh slab when every existing one is full.
    pub(crate) fn get_chunk(&self) -> NonNull<u8> {
        let idx = self.find_first_available_chunk_idx();
        debug_assert!(idx < self.num_chunks, "get_chunk on a full slab");

        self.chunks[idx].set(true);
        self.num_allocated.set(self.num_allocated.get() + 1);
        // The chosen index becomes the next search hint; everything below
        // it is still allocated, so the bound stays correct.
        self.first_free_idx.set(idx);

        // SAFETY: idx < num_chunks, and num_chunks * chunk_size fits in the
        // registered span of the provider allocation.
        unsafe { NonNull::new_unchecked(self.mem.as_ptr().add(idx * self.chunk_size)) }
    }

    /// Releases the chunk containing `ptr`
    ///
    /// Freeing a chunk that is not allocated is a caller bug, caught by a
    /// debug assertion.
    pub(crate) fn free_chunk(&self, ptr: NonNull<u8>) {
        debug_assert!(self.contains(ptr.as_ptr() as usize));

        // A pointer that was aligned up on allocation still lands inside
        // its chunk, so integer division recovers the right index.
        let idx = (ptr.as_ptr() as usize - self.mem_addr()) / self.chunk_size;
        debug_assert!(idx < self.num_chunks);
        debug_assert!(self.chunks[idx].get(), "double free detected");

        self.chunks[idx].set(false);
        self.num_allocated.set(self.num_allocated.get() - 1);
        if idx < self.first_free_idx.get() {
            self.first_free_idx.set(idx);
        }
    }

    /// Number of set bitmap entries; slower than `num_allocated`, used to
    /// cross-check the counter in tests and debug builds
    #[cfg(test)]
    pub(crate) fn count_allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|chunk| chunk.get()).count()
    }
}

/// Stable, copyable handle to a heap-allocated [`Slab`]
///
/// Buckets keep slabs behind raw pointers so a slab can sit in a bucket
/// list and in the slab index at the same time without reference counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabHandle(NonNull<Slab>);

// SAFETY: SlabHandle is a pointer to a Slab whose Cells are only touched
// while holding the owning bucket's mutex; the immutable geometry fields
// are safe to read from any thread. The handle itself is plain data.
unsafe impl Send for SlabHandle {}
// SAFETY: see above; shared access never mutates without the bucket lock.
unsafe impl Sync for SlabHandle {}

impl SlabHandle {
    /// Moves the slab to the heap and leaks it behind a handle
    pub(crate) fn alloc(slab: Slab) -> Self {
        Self(NonNull::from(Box::leak(Box::new(slab))))
    }

    /// Borrows the slab
    ///
    /// # Safety
    /// The handle must not have been [`release`](Self::release)d, and the
    /// caller must hold the lock appropriate for the fields it touches
    /// (bucket mutex for counters and bitmap, bucket mutex or index lock
    /// for geometry).
    #[inline]
    pub(crate) unsafe fn get<'a>(self) -> &'a Slab {
        // SAFETY: pointer originates from Box::leak in alloc() and stays
        // valid until release().
        unsafe { &*self.0.as_ptr() }
    }

    /// Frees the slab header
    ///
    /// # Safety
    /// No other use of this handle (or copies of it) may happen afterwards;
    /// the slab must already be unlinked and unregistered.
    pub(crate) unsafe fn release(self) {
        // SAFETY: created by Box::leak in alloc(); ownership returns here
        // exactly once per the contract above.
        drop(unsafe { Box::from_raw(self.0.as_ptr()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slab_over(buf: &mut [u8], chunk_size: usize) -> Slab {
        let mem = NonNull::new(buf.as_mut_ptr()).unwrap();
        Slab::new(mem, buf.len(), chunk_size, buf.len(), 0)
    }

    #[test]
    fn test_chunk_walk_and_counter() {
        let mut buf = vec![0u8; 256];
        let slab = slab_over(&mut buf, 64);
        assert_eq!(slab.num_chunks(), 4);

        let base = buf.as_ptr() as usize;
        for i in 0..4 {
            assert!(slab.has_available());
            let chunk = slab.get_chunk();
            assert_eq!(chunk.as_ptr() as usize, base + i * 64);
            assert_eq!(slab.num_allocated(), i + 1);
            assert_eq!(slab.count_allocated_chunks(), i + 1);
        }
        assert!(!slab.has_available());
    }

    #[test]
    fn test_hint_resets_backward_on_free() {
        let mut buf = vec![0u8; 256];
        let slab = slab_over(&mut buf, 64);
        let base = buf.as_ptr() as usize;

        let c0 = slab.get_chunk();
        let _c1 = slab.get_chunk();
        let _c2 = slab.get_chunk();

        slab.free_chunk(c0);
        assert_eq!(slab.num_allocated(), 2);

        // The freed low chunk must be found again before the untouched tail.
        let again = slab.get_chunk();
        assert_eq!(again.as_ptr() as usize, base);
    }

    #[test]
    fn test_interior_pointer_frees_right_chunk() {
        let mut buf = vec![0u8; 256];
        let slab = slab_over(&mut buf, 64);

        let _c0 = slab.get_chunk();
        let c1 = slab.get_chunk();

        // An aligned-up pointer inside chunk 1 still frees chunk 1.
        let interior = NonNull::new(unsafe { c1.as_ptr().add(16) }).unwrap();
        slab.free_chunk(interior);
        assert_eq!(slab.num_allocated(), 1);
        assert_eq!(slab.count_allocated_chunks(), 1);

        let again = slab.get_chunk();
        assert_eq!(again.as_ptr(), c1.as_ptr());
    }

    #[test]
    fn test_oversized_slab_has_no_chunks() {
        let mut buf = vec![0u8; 128];
        // chunk size above the registered span: whole-slab usage
        let slab = Slab::new(
            NonNull::new(buf.as_mut_ptr()).unwrap(),
            buf.len(),
            256,
            128,
            0,
        );
        assert_eq!(slab.num_chunks(), 0);
        assert!(!slab.has_available());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "double free detected")]
    fn test_double_free_asserts() {
        let mut buf = vec![0u8; 256];
        let slab = slab_over(&mut buf, 64);
        let chunk = slab.get_chunk();
        slab.free_chunk(chunk);
        slab.free_chunk(chunk);
    }

    #[test]
    fn test_handle_roundtrip() {
        let mut buf = vec![0u8; 256];
        let handle = SlabHandle::alloc(slab_over(&mut buf, 64));
        // SAFETY: single-threaded test, handle is live.
        let slab = unsafe { handle.get() };
        assert_eq!(slab.chunk_size(), 64);
        // SAFETY: last use of the handle.
        unsafe { handle.release() };
    }
}
