//! Real-world scenario benchmarks
//!
//! Allocation patterns that exercise the chunked, whole-slab and bypass
//! paths of the pool.

#[cfg(all(feature = "system-provider", unix))]
mod scenarios {
    use criterion::{Criterion, Throughput, black_box};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use disjoint_pool::{DisjointPool, DisjointPoolConfig, SystemProvider};

    fn pool() -> DisjointPool<SystemProvider> {
        DisjointPool::new(SystemProvider::new(), DisjointPoolConfig::performance()).unwrap()
    }

    /// Simulate request/response cycle (allocate, use, deallocate)
    pub fn bench_request_response(c: &mut Criterion) {
        let mut group = c.benchmark_group("request_response");
        group.throughput(Throughput::Elements(2));

        group.bench_function("chunk_pair_256", |b| {
            let pool = pool();
            b.iter(|| {
                let req = pool.malloc(256);
                let resp = pool.malloc(256);
                black_box((req, resp));
                pool.free(req).unwrap();
                pool.free(resp).unwrap();
            });
        });

        group.finish();
    }

    /// Whole-slab churn: every request takes and returns one slab
    pub fn bench_whole_slab_reuse(c: &mut Criterion) {
        let mut group = c.benchmark_group("whole_slab");
        group.throughput(Throughput::Elements(1));

        group.bench_function("malloc_free_40k", |b| {
            let pool = pool();
            b.iter(|| {
                let p = pool.malloc(40 * 1024);
                black_box(p);
                pool.free(p).unwrap();
            });
        });

        group.finish();
    }

    /// Aligned allocations served from chunk-aligned buckets
    pub fn bench_aligned(c: &mut Criterion) {
        let mut group = c.benchmark_group("aligned");
        group.throughput(Throughput::Elements(1));

        group.bench_function("aligned_256_by_64", |b| {
            let pool = pool();
            b.iter(|| {
                let p = pool.aligned_malloc(256, 64);
                black_box(p);
                pool.free(p).unwrap();
            });
        });

        group.finish();
    }

    /// Requests above the poolable limit go straight to the provider
    pub fn bench_bypass(c: &mut Criterion) {
        let mut group = c.benchmark_group("bypass");
        group.throughput(Throughput::Elements(1));

        group.bench_function("malloc_free_3m", |b| {
            let pool = pool();
            b.iter(|| {
                let p = pool.malloc(3 * 1024 * 1024);
                black_box(p);
                pool.free(p).unwrap();
            });
        });

        group.finish();
    }

    /// Mixed sizes with a working set, closest to application behavior
    pub fn bench_mixed_working_set(c: &mut Criterion) {
        let mut group = c.benchmark_group("mixed");
        group.throughput(Throughput::Elements(1));

        group.bench_function("mixed_up_to_8k", |b| {
            let pool = pool();
            let mut rng = StdRng::seed_from_u64(7);
            let sizes: Vec<usize> = (0..1024).map(|_| rng.gen_range(1..=8192)).collect();
            let mut live: Vec<*mut u8> = Vec::with_capacity(64);
            let mut next = 0usize;

            b.iter(|| {
                if live.len() == 64 {
                    for p in live.drain(..) {
                        pool.free(p).unwrap();
                    }
                }
                let p = pool.malloc(sizes[next % sizes.len()]);
                next += 1;
                live.push(black_box(p));
            });

            for p in live.drain(..) {
                pool.free(p).unwrap();
            }
        });

        group.finish();
    }
}

#[cfg(all(feature = "system-provider", unix))]
criterion::criterion_group!(
    benches,
    scenarios::bench_request_response,
    scenarios::bench_whole_slab_reuse,
    scenarios::bench_aligned,
    scenarios::bench_bypass,
    scenarios::bench_mixed_working_set
);

#[cfg(all(feature = "system-provider", unix))]
criterion::criterion_main!(benches);

#[cfg(not(all(feature = "system-provider", unix)))]
fn main() {}
