use criterion::{criterion_group, Criterion};
use medialane_buffer::{Block, BlockBuffer, BlockPool, Format, PoolConfig, SampleBuffer, Span};
use prometheus_client::registry::Registry;

/// One compressed frame, one raw-ish frame, one large keyframe.
const SIZES: [usize; 3] = [4096, 65536, 1 << 20];

fn fill_share_cycle(producer: &mut BlockBuffer, size: usize) {
    producer.window_mut().unwrap()[..size].fill(0xAB);
    producer.set_span(Span::new(0, size)).unwrap();
    // The snapshot drops immediately, returning storage for the next cycle
    producer.share();
}

fn bench_share_pooled(c: &mut Criterion) {
    let mut registry = Registry::default();
    let pool = BlockPool::new(PoolConfig::for_compressed(), &mut registry);
    for size in SIZES {
        let mut producer =
            BlockBuffer::allocate(Format::new("video/avc"), pool.alloc(size)).unwrap();
        c.bench_function(&format!("share_pooled/size={size}"), |b| {
            b.iter(|| fill_share_cycle(&mut producer, size));
        });
    }
}

fn bench_share_untracked(c: &mut Criterion) {
    for size in SIZES {
        let mut producer =
            BlockBuffer::allocate(Format::new("video/avc"), Block::with_capacity(size)).unwrap();
        c.bench_function(&format!("share_untracked/size={size}"), |b| {
            b.iter(|| fill_share_cycle(&mut producer, size));
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_share_pooled, bench_share_untracked
}
