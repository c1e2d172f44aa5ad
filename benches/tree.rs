//! Insert/search throughput over a tempfile-backed pool.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use pmbtree::{BTree, PmPool, PoolConfig, TreeConfig};

const POOL_SIZE: u64 = 256 * 1024 * 1024;
const N: i64 = 100_000;

fn fresh_tree() -> (tempfile::TempDir, BTree) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = PoolConfig::new(dir.path().join("bench.pool")).with_size(POOL_SIZE);
    let pool = Arc::new(PmPool::open(&cfg).expect("pool"));
    let tree = BTree::open(pool, TreeConfig::default()).expect("tree");
    (dir, tree)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(N as u64));
    group.sample_size(10);

    group.bench_function("sequential_100k", |b| {
        b.iter_batched(
            fresh_tree,
            |(_dir, tree)| {
                for key in 0..N {
                    tree.insert(key, (key + 1) as u64);
                }
            },
            BatchSize::PerIteration,
        );
    });

    group.bench_function("random_100k", |b| {
        b.iter_batched(
            fresh_tree,
            |(_dir, tree)| {
                let mut state: u64 = 0x1234_5678;
                for _ in 0..N {
                    state = state
                        .wrapping_mul(6_364_136_223_846_793_005)
                        .wrapping_add(1);
                    let key = (state >> 16) as i64;
                    tree.insert(key, state | 1);
                }
            },
            BatchSize::PerIteration,
        );
    });

    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let (_dir, tree) = fresh_tree();
    for key in 0..N {
        tree.insert(key, (key + 1) as u64);
    }

    let mut group = c.benchmark_group("search");
    group.throughput(Throughput::Elements(N as u64));

    group.bench_function("hit_100k", |b| {
        b.iter(|| {
            for key in 0..N {
                std::hint::black_box(tree.search(key));
            }
        });
    });

    group.finish();
}

fn bench_range(c: &mut Criterion) {
    let (_dir, tree) = fresh_tree();
    for key in 0..N {
        tree.insert(key, (key + 1) as u64);
    }

    let mut buf = vec![0u64; 1024];
    c.bench_function("range_1k_window", |b| {
        b.iter(|| {
            let n = tree.range(40_000, 41_001, &mut buf);
            std::hint::black_box(n);
        });
    });
}

criterion_group!(benches, bench_insert, bench_search, bench_range);
criterion_main!(benches);
