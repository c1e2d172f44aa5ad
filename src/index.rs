//! Filepath: src/index.rs
//!
//! Abstract ordered-index contract.
//!
//! Benchmark drivers and harnesses depend on this trait only, so the
//! B+-tree can be swapped for another index under the same workload.

use crate::node::DEFAULT_CARDINALITY;
use crate::tree::BTree;

/// The three operations a benchmarkable ordered index must provide.
pub trait OrderedIndex {
    /// Insert a key/handle pair; `true` on success.
    fn insert(&self, key: i64, value: u64) -> bool;

    /// Point lookup.
    fn search(&self, key: i64) -> Option<u64>;

    /// Load a batch of pairs.
    fn bulk_load(&self, pairs: &[(i64, u64)]);
}

impl<const CARD: usize> OrderedIndex for BTree<CARD> {
    fn insert(&self, key: i64, value: u64) -> bool {
        BTree::insert(self, key, value)
    }

    fn search(&self, key: i64) -> Option<u64> {
        BTree::search(self, key)
    }

    fn bulk_load(&self, pairs: &[(i64, u64)]) {
        BTree::bulk_load(self, pairs);
    }
}

/// The default-cardinality tree, as harnesses instantiate it.
pub type DefaultIndex = BTree<DEFAULT_CARDINALITY>;
