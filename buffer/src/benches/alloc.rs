use criterion::{criterion_group, Criterion};
use medialane_buffer::{Block, BlockPool, PoolConfig};
use prometheus_client::registry::Registry;

const SIZES: [usize; 3] = [4096, 65536, 1 << 20];

fn bench_alloc_pooled(c: &mut Criterion) {
    let mut registry = Registry::default();
    let pool = BlockPool::new(PoolConfig::for_compressed(), &mut registry);
    for size in SIZES {
        c.bench_function(&format!("alloc_pooled/size={size}"), |b| {
            // Dropping the block returns its storage to the freelist
            b.iter(|| pool.alloc(size));
        });
    }
}

fn bench_alloc_untracked(c: &mut Criterion) {
    for size in SIZES {
        c.bench_function(&format!("alloc_untracked/size={size}"), |b| {
            b.iter(|| Block::with_capacity(size));
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_alloc_pooled, bench_alloc_untracked
}
