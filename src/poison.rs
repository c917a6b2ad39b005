//! Memory annotation hooks
//!
//! Mirrors sanitizer-style poisoning without a sanitizer: regions entering
//! the caller's hands are marked "undefined", regions returning to the pool
//! or freshly obtained from the provider are marked "inaccessible". With no
//! fill pattern configured both hooks are no-ops, so the pool never touches
//! memory it is not about to hand out. Pointer arithmetic on annotated
//! regions stays valid either way.

/// Marks memory the caller is about to receive
///
/// # Safety contract (internal)
/// `ptr..ptr + size` must lie inside a live provider allocation owned by
/// the pool; callers clamp `size` so aligned-up pointers cannot run past
/// their chunk or slab.
#[inline]
pub(crate) fn annotate_memory_undefined(ptr: *mut u8, size: usize, fill: Option<u8>) {
    if let Some(byte) = fill {
        // SAFETY: per the contract above the whole range is mapped and not
        // referenced by any other live allocation.
        unsafe {
            core::ptr::write_bytes(ptr, byte, size);
        }
    }
}

/// Marks memory nothing should read until it is allocated again
///
/// Same contract as [`annotate_memory_undefined`].
#[inline]
pub(crate) fn annotate_memory_inaccessible(ptr: *mut u8, size: usize, fill: Option<u8>) {
    if let Some(byte) = fill {
        // SAFETY: see annotate_memory_undefined.
        unsafe {
            core::ptr::write_bytes(ptr, byte, size);
        }
    }
}
