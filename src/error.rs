//! Error types for disjoint-pool
//!
//! A single flat error enum covers every fallible pool operation. Entry
//! points that communicate failure through a null pointer additionally
//! record the error in a thread-local slot, retrieved through
//! [`DisjointPool::last_allocation_error`](crate::DisjointPool::last_allocation_error).

use thiserror::Error;

/// Result type for pool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Error kinds reported by the pool and by memory providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum PoolError {
    /// Bad configuration, e.g. a `min_bucket_size` that is not a power of two
    #[error("invalid argument")]
    InvalidArgument,

    /// The provider (or an internal scratch allocation) ran out of memory
    #[error("out of host memory")]
    OutOfHostMemory,

    /// The operation is not implemented by this pool (`calloc`, `realloc`)
    #[error("operation not supported")]
    NotSupported,

    /// The provider returned an unexpected code; propagated verbatim
    #[error("memory provider error (code {0})")]
    MemoryProviderSpecific(i32),
}

impl PoolError {
    /// Returns a static string describing the error
    pub const fn as_str(&self) -> &'static str {
        match self {
            PoolError::InvalidArgument => "invalid argument",
            PoolError::OutOfHostMemory => "out of host memory",
            PoolError::NotSupported => "operation not supported",
            PoolError::MemoryProviderSpecific(_) => "memory provider error",
        }
    }

    /// Checks if this is an out-of-memory error
    #[inline]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, PoolError::OutOfHostMemory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(PoolError::OutOfHostMemory.to_string(), "out of host memory");
        assert_eq!(
            PoolError::MemoryProviderSpecific(22).to_string(),
            "memory provider error (code 22)"
        );
    }

    #[test]
    fn test_predicates() {
        assert!(PoolError::OutOfHostMemory.is_out_of_memory());
        assert!(!PoolError::NotSupported.is_out_of_memory());
    }
}
