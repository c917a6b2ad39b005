//! Coarse-grain memory providers
//!
//! The pool never talks to the operating system directly; it requests large
//! slab-sized regions from a [`MemoryProvider`] and hands them back when a
//! slab is destroyed. Providers are expected to be cheap to share across
//! threads (the pool calls them under per-bucket locks).

use core::ptr::NonNull;

use dashmap::DashMap;

use crate::error::PoolResult;

/// Backend supplying coarse-grain allocations to a pool
///
/// `alloc(size, alignment)` must return memory aligned to `alignment`
/// whenever `alignment > 1`; an `alignment` of 0 or 1 means "no requirement
/// beyond the provider's natural alignment". `free` receives the size the
/// region was allocated with, or 0 when the caller does not know it.
pub trait MemoryProvider: Send + Sync {
    /// Allocates `size` bytes aligned to `alignment`
    fn alloc(&self, size: usize, alignment: usize) -> PoolResult<NonNull<u8>>;

    /// Releases a region previously returned by [`alloc`](Self::alloc)
    fn free(&self, ptr: NonNull<u8>, size: usize) -> PoolResult<()>;

    /// Smallest alignment every allocation naturally satisfies
    fn min_page_size(&self) -> usize;

    /// Tracker hook: the size `ptr` was originally allocated with, if known
    fn base_size(&self, _ptr: NonNull<u8>) -> Option<usize> {
        None
    }
}

impl<P: MemoryProvider> MemoryProvider for std::sync::Arc<P> {
    fn alloc(&self, size: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        (**self).alloc(size, alignment)
    }

    fn free(&self, ptr: NonNull<u8>, size: usize) -> PoolResult<()> {
        (**self).free(ptr, size)
    }

    fn min_page_size(&self) -> usize {
        (**self).min_page_size()
    }

    fn base_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        (**self).base_size(ptr)
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(feature = "system-provider", unix))] {
        use once_cell::sync::Lazy;

        use crate::error::PoolError;
        use crate::utils::align_up;

        static PAGE_SIZE: Lazy<usize> =
            // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
            Lazy::new(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize });

        /// Provider backed by anonymous memory mappings
        ///
        /// Regions come from `mmap(MAP_PRIVATE | MAP_ANONYMOUS)` and are
        /// therefore page-aligned. Alignments above the page size are
        /// honored by over-mapping and trimming the excess head and tail.
        #[derive(Debug, Default, Clone, Copy)]
        pub struct SystemProvider;

        impl SystemProvider {
            pub fn new() -> Self {
                Self
            }

            fn map(length: usize) -> PoolResult<NonNull<u8>> {
                // SAFETY: a fresh anonymous private mapping; no fd, no
                // existing memory is touched.
                let raw = unsafe {
                    libc::mmap(
                        core::ptr::null_mut(),
                        length,
                        libc::PROT_READ | libc::PROT_WRITE,
                        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                        -1,
                        0,
                    )
                };
                if raw == libc::MAP_FAILED {
                    return Err(os_error());
                }
                NonNull::new(raw.cast::<u8>()).ok_or(PoolError::OutOfHostMemory)
            }

            fn unmap(addr: usize, length: usize) -> PoolResult<()> {
                // SAFETY: callers only pass subranges of mappings created by
                // `map`, page-aligned by construction.
                let rc = unsafe { libc::munmap(addr as *mut libc::c_void, length) };
                if rc != 0 {
                    return Err(os_error());
                }
                Ok(())
            }
        }

        impl MemoryProvider for SystemProvider {
            fn alloc(&self, size: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
                if size == 0 {
                    return Err(PoolError::InvalidArgument);
                }
                let page = *PAGE_SIZE;
                let alignment = if alignment <= 1 { page } else { alignment };
                if !alignment.is_power_of_two() {
                    return Err(PoolError::InvalidArgument);
                }

                let length = align_up(size, page);
                if alignment <= page {
                    return Self::map(length);
                }

                // Over-map by the alignment, then trim head and tail so the
                // surviving range starts on an alignment boundary.
                let padded = length
                    .checked_add(alignment)
                    .ok_or(PoolError::OutOfHostMemory)?;
                let raw = Self::map(padded)?;
                let base = raw.as_ptr() as usize;
                let aligned = align_up(base, alignment);
                if aligned > base {
                    Self::unmap(base, aligned - base)?;
                }
                let tail = aligned + length;
                let end = base + padded;
                if end > tail {
                    Self::unmap(tail, end - tail)?;
                }
                NonNull::new(aligned as *mut u8).ok_or(PoolError::OutOfHostMemory)
            }

            fn free(&self, ptr: NonNull<u8>, size: usize) -> PoolResult<()> {
                // munmap rejects a zero length; an unknown size (0) surfaces
                // as the provider-specific EINVAL the kernel reports.
                Self::unmap(ptr.as_ptr() as usize, align_up(size, *PAGE_SIZE))
            }

            fn min_page_size(&self) -> usize {
                *PAGE_SIZE
            }
        }

        fn os_error() -> PoolError {
            match std::io::Error::last_os_error().raw_os_error() {
                Some(code) if code == libc::ENOMEM => PoolError::OutOfHostMemory,
                Some(code) => PoolError::MemoryProviderSpecific(code),
                None => PoolError::OutOfHostMemory,
            }
        }
    }
}

/// Wrapper remembering the size of every live allocation
///
/// The pool's `free` path asks the provider for the original size of
/// pointers it does not own (bypass allocations above the poolable limit).
/// Wrapping a provider in `TrackingProvider` supplies that answer through
/// [`MemoryProvider::base_size`].
#[derive(Debug)]
pub struct TrackingProvider<P> {
    inner: P,
    sizes: DashMap<usize, usize>,
}

impl<P: MemoryProvider> TrackingProvider<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            sizes: DashMap::new(),
        }
    }

    /// Number of live allocations currently tracked
    pub fn tracked(&self) -> usize {
        self.sizes.len()
    }

    /// Returns the wrapped provider
    pub fn into_inner(self) -> P {
        self.inner
    }
}

impl<P: MemoryProvider> MemoryProvider for TrackingProvider<P> {
    fn alloc(&self, size: usize, alignment: usize) -> PoolResult<NonNull<u8>> {
        let ptr = self.inner.alloc(size, alignment)?;
        self.sizes.insert(ptr.as_ptr() as usize, size);
        Ok(ptr)
    }

    fn free(&self, ptr: NonNull<u8>, size: usize) -> PoolResult<()> {
        let recorded = self.sizes.remove(&(ptr.as_ptr() as usize)).map(|(_, s)| s);
        let size = if size != 0 {
            size
        } else {
            recorded.unwrap_or(0)
        };
        self.inner.free(ptr, size)
    }

    fn min_page_size(&self) -> usize {
        self.inner.min_page_size()
    }

    fn base_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.sizes.get(&(ptr.as_ptr() as usize)).map(|r| *r)
    }
}

#[cfg(all(test, feature = "system-provider", unix))]
mod tests {
    use super::*;

    #[test]
    fn test_system_provider_roundtrip() {
        let provider = SystemProvider::new();
        let page = provider.min_page_size();
        let ptr = provider.alloc(page * 2, page).unwrap();
        assert_eq!(ptr.as_ptr() as usize % page, 0);
        provider.free(ptr, page * 2).unwrap();
    }

    #[test]
    fn test_system_provider_large_alignment() {
        let provider = SystemProvider::new();
        let page = provider.min_page_size();
        let alignment = page * 4;
        let ptr = provider.alloc(100, alignment).unwrap();
        assert_eq!(ptr.as_ptr() as usize % alignment, 0);
        provider.free(ptr, 100).unwrap();
    }

    #[test]
    fn test_system_provider_zero_size() {
        let provider = SystemProvider::new();
        assert_eq!(
            provider.alloc(0, 0).unwrap_err(),
            PoolError::InvalidArgument
        );
    }

    #[test]
    fn test_tracking_provider_remembers_sizes() {
        let provider = TrackingProvider::new(SystemProvider::new());
        let ptr = provider.alloc(8192, 0).unwrap();
        assert_eq!(provider.base_size(ptr), Some(8192));
        assert_eq!(provider.tracked(), 1);

        // Size unknown at the call site; the tracker fills it in.
        provider.free(ptr, 0).unwrap();
        assert_eq!(provider.tracked(), 0);
        assert_eq!(provider.base_size(ptr), None);
    }
}
