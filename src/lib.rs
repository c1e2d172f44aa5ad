//! # pmbtree
//!
//! A persistent, concurrent B+-tree index engine for byte-addressable
//! persistent memory.
//!
//! The tree keeps its entire structure — pages, root descriptor, allocator
//! cursor — inside one memory-mapped pool file, and sequences stores and
//! cache-line flushes so that a crash at any point leaves the on-media
//! structure consistent, without a write-ahead log:
//!
//! - **Failure-atomic shift insertion**: entries move one 8-byte store at a
//!   time behind a trailing null sentinel that commits the page's length,
//!   with flushes only at cache-line boundaries.
//! - **Failure-atomic rebalance**: splits build and persist the new sibling
//!   before linking it, link it before truncating, and publish the parent
//!   separator last; every intermediate state is reachable and well-formed.
//! - **Latch-free readers**: lookups and scans take no locks and reconcile
//!   with concurrent shifts through a per-page switch counter; writers
//!   serialize on per-page spin latches.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use pmbtree::{BTree, PmPool, PoolConfig, TreeConfig};
//!
//! let pool = Arc::new(PmPool::open(&PoolConfig::new("/mnt/pmem/index.pool"))?);
//! let tree: BTree = BTree::open(pool, TreeConfig::default())?;
//!
//! tree.insert(1, 100);
//! assert_eq!(tree.search(1), Some(100));
//!
//! let mut buf = [0u64; 16];
//! let n = tree.range(0, 10, &mut buf);
//! # let _ = n;
//! # Ok::<(), pmbtree::PmError>(())
//! ```
//!
//! Keys are signed 64-bit integers; values are opaque nonzero 64-bit
//! handles (zero is the reserved null). Reopening the same pool resumes
//! from the stored root without a recovery pass.

pub mod config;
pub mod error;
pub mod index;
pub mod latch;
pub mod node;
pub mod pool;
pub mod tree;

mod ordering;
mod pmem;
mod trace;

pub use config::{PoolConfig, TreeConfig};
pub use error::{PmError, Result};
pub use index::OrderedIndex;
pub use node::{Page, DEFAULT_CARDINALITY, PAGE_SIZE};
pub use pool::{PmPool, PoolStats};
pub use tree::{BTree, TreeStats};

pub use trace::init_tracing;
