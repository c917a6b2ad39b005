//! Cross-pool retention cap scenarios

mod common;

use std::sync::Arc;

use common::MockProvider;
use disjoint_pool::{DisjointPool, DisjointPoolConfig, SharedLimits};

fn config_with(limits: Arc<SharedLimits>) -> DisjointPoolConfig {
    DisjointPoolConfig {
        slab_min_size: 4096,
        min_bucket_size: 64,
        max_poolable_size: 8192,
        capacity: 4,
        pool_trace: 1,
        shared_limits: Some(limits),
        ..Default::default()
    }
}

#[test]
fn test_cap_shared_across_pools() {
    let limits = Arc::new(SharedLimits::new(8192));
    let pool_a =
        DisjointPool::new(MockProvider::new(), config_with(Arc::clone(&limits))).unwrap();
    let pool_b =
        DisjointPool::new(MockProvider::new(), config_with(Arc::clone(&limits))).unwrap();

    // Each pool retains one 4096-byte slab under the shared cap.
    let a = pool_a.malloc(64);
    pool_a.free(a).unwrap();
    let b = pool_b.malloc(64);
    pool_b.free(b).unwrap();
    assert_eq!(limits.total(), 8192);
    assert_eq!(pool_a.provider().free_calls(), 0);
    assert_eq!(pool_b.provider().free_calls(), 0);

    // A third retention attempt anywhere must fail the cap and release the
    // slab to its provider instead.
    let c = pool_a.malloc(3000);
    pool_a.free(c).unwrap();
    assert_eq!(limits.total(), 8192);
    assert_eq!(pool_a.provider().free_calls(), 1);
}

#[test]
fn test_default_limits_are_unbounded() {
    let config = DisjointPoolConfig {
        slab_min_size: 4096,
        min_bucket_size: 64,
        max_poolable_size: 8192,
        pool_trace: 1,
        ..Default::default()
    };
    let pool = DisjointPool::new(MockProvider::new(), config).unwrap();
    assert_eq!(pool.limits().max_size(), usize::MAX);

    let p = pool.malloc(64);
    pool.free(p).unwrap();
    assert_eq!(pool.limits().total(), 4096);
}

#[test]
fn test_reuse_is_stable_once_retained() {
    let limits = Arc::new(SharedLimits::new(8192));
    let pool = DisjointPool::new(MockProvider::new(), config_with(Arc::clone(&limits))).unwrap();

    // First cycle pays the retention; afterwards the same slab bounces
    // between pool and caller with no provider traffic.
    for _ in 0..10 {
        let p = pool.malloc(64);
        assert!(!p.is_null());
        pool.free(p).unwrap();
        assert_eq!(limits.total(), 4096);
    }
    assert_eq!(pool.provider().alloc_calls(), 1);
    assert_eq!(pool.provider().free_calls(), 0);
}

#[test]
fn test_pooled_bytes_tracks_retention() {
    let limits = Arc::new(SharedLimits::new(8192));
    let pool = DisjointPool::new(MockProvider::new(), config_with(limits)).unwrap();

    let p = pool.malloc(64);
    assert_eq!(pool.pooled_bytes(), 0);
    pool.free(p).unwrap();
    assert_eq!(pool.pooled_bytes(), 4096);

    // Taking the slab back out of the pool drains the counter again.
    let q = pool.malloc(64);
    assert_eq!(pool.pooled_bytes(), 0);
    pool.free(q).unwrap();
}
