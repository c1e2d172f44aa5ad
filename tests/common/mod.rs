//! Common test utilities: tracing setup and tempfile-backed pools.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Once;

use pmbtree::{BTree, PmPool, PoolConfig, TreeConfig};

static INIT: Once = Once::new();

/// Initialize tracing once across all tests. No-op unless the crate is
/// built with the `tracing` feature.
pub fn init_tracing() {
    INIT.call_once(pmbtree::init_tracing);
}

/// A pool in a fresh temp directory.
pub fn temp_pool(size: u64) -> (tempfile::TempDir, Arc<PmPool>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = PoolConfig::new(dir.path().join("test.pool")).with_size(size);
    let pool = Arc::new(PmPool::open(&cfg).expect("open pool"));
    (dir, pool)
}

/// A default-cardinality tree over a fresh pool.
pub fn default_tree(size: u64) -> (tempfile::TempDir, BTree) {
    let (dir, pool) = temp_pool(size);
    let tree = BTree::open(pool, TreeConfig::default()).expect("open tree");
    (dir, tree)
}

/// A cardinality-8 tree (deep trees from small key sets) over a fresh pool.
pub fn small_tree(size: u64, rebalance: bool) -> (tempfile::TempDir, BTree<8>) {
    let (dir, pool) = temp_pool(size);
    let tree = BTree::<8>::open(
        pool,
        TreeConfig {
            rebalance_on_delete: rebalance,
        },
    )
    .expect("open tree");
    (dir, tree)
}

/// Verify every key in `keys` resolves to `value_of(key)`, panicking with a
/// sample of the missing keys.
pub fn verify_all_keys<const CARD: usize>(
    tree: &BTree<CARD>,
    keys: impl Iterator<Item = i64>,
    value_of: impl Fn(i64) -> u64,
    test_name: &str,
) {
    let mut missing = Vec::new();
    let mut wrong = Vec::new();

    for key in keys {
        match tree.search(key) {
            None => missing.push(key),
            Some(v) if v != value_of(key) => wrong.push((key, v)),
            Some(_) => {}
        }
    }

    assert!(
        missing.is_empty() && wrong.is_empty(),
        "{test_name}: {} missing (first 20: {:?}), {} wrong (first 20: {:?})",
        missing.len(),
        &missing[..missing.len().min(20)],
        wrong.len(),
        &wrong[..wrong.len().min(20)],
    );
}
