//! Filepath: src/tree.rs
//!
//! The B+-tree: root bookkeeping, descent, and node maintenance.
//!
//! A [`BTree`] is a thin DRAM handle over state that lives entirely in the
//! pool: the pool's root object holds the root page handle and the height,
//! and every page is a pool allocation. Reopening the pool and calling
//! [`BTree::open`] resumes from the stored root with no recovery scan; any
//! split that was in flight at a crash is resolved by the reader protocol
//! plus the sentinel slot semantics.
//!
//! Descent takes no latches. Writers latch only the page they mutate;
//! splits publish upward through a fresh top-down descent to the parent
//! level, so no latch is ever held across levels on the insert path.

use std::sync::Arc;

use crate::config::TreeConfig;
use crate::error::Result;
use crate::node::{LeafSearch, Page, StoreError, DEFAULT_CARDINALITY, NULL_OFF};
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::pmem;
use crate::pool::PmPool;
use crate::trace::{debug_log, warn_log};

use std::sync::atomic::{AtomicU32, AtomicU64};

/// Bound on retries after a tombstoned-page race before an operation gives
/// up. Forwarding makes genuine exhaustion unreachable in practice; the cap
/// turns a would-be livelock into a visible failure.
const MAX_ROOT_RETRIES: usize = 64;

// ============================================================================
//  TreeMeta (the pool's root object)
// ============================================================================

/// On-media tree descriptor: the pool's root object.
#[repr(C)]
pub(crate) struct TreeMeta {
    /// Handle of the current root page.
    pub(crate) root: AtomicU64,

    /// Number of levels; 1 for a lone leaf root.
    pub(crate) height: AtomicU32,

    _pad: u32,
}

const _: () = assert!(size_of::<TreeMeta>() <= 64);

/// What [`BTree::delete_internal`] found at the parent level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParentRemoval {
    /// The requested level does not exist, or the child was not found in
    /// the parent (a racing writer already restructured it).
    NoParent,

    /// The child is its parent's leftmost child: there is no in-parent
    /// separator to remove, and no left sibling to rebalance with.
    LeftmostChild,

    /// The separator was removed; rebalance with the returned left sibling.
    Removed {
        /// The separator key that was removed from the parent.
        separator: i64,
        /// Handle of the child immediately left of the caller.
        left_sibling: u64,
    },
}

// ============================================================================
//  BTree
// ============================================================================

/// A persistent, concurrent B+-tree over fixed 8-byte keys and handles.
///
/// `CARD` is the per-page slot count; the default corresponds to 512-byte
/// pages. Smaller cardinalities are for tests that want deep trees cheaply.
///
/// Shared freely across threads: lookups and scans are latch-free, writers
/// serialize per page.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use pmbtree::{BTree, PmPool, PoolConfig, TreeConfig};
///
/// let pool = Arc::new(PmPool::open(&PoolConfig::new("/mnt/pmem/index.pool"))?);
/// let tree: BTree = BTree::open(pool, TreeConfig::default())?;
///
/// assert!(tree.insert(42, 0xdead));
/// assert_eq!(tree.search(42), Some(0xdead));
/// # Ok::<(), pmbtree::PmError>(())
/// ```
pub struct BTree<const CARD: usize = DEFAULT_CARDINALITY> {
    pool: Arc<PmPool>,
    meta_off: u64,
    config: TreeConfig,
}

/// Aggregate counts from a full structure walk. Quiescent-state only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeStats {
    /// Tree height as recorded in the root object.
    pub height: u32,
    /// Total reachable pages.
    pub nodes: usize,
    /// Total live entries across all pages.
    pub keys: usize,
    /// Pages at level 0.
    pub leaf_nodes: usize,
    /// Live entries at level 0.
    pub leaf_keys: usize,
}

impl<const CARD: usize> BTree<CARD> {
    /// Open the tree stored in `pool`, creating an empty one on first open.
    ///
    /// # Errors
    /// Pool allocation errors creating the root object or the initial leaf.
    pub fn open(pool: Arc<PmPool>, config: TreeConfig) -> Result<Self> {
        let meta_off = pool.root_object(64)?;
        let tree = Self {
            pool,
            meta_off,
            config,
        };

        if tree.meta().root.load(READ_ORD) == NULL_OFF {
            let root_off = tree.pool.allocate_zeroed(size_of::<Page<CARD>>())?;
            let root = Page::<CARD>::at(&tree.pool, root_off);
            root.init(0);
            pmem::persist(std::ptr::from_ref(root).cast::<u8>(), size_of::<Page<CARD>>());

            let meta = tree.meta();
            meta.root.store(root_off, WRITE_ORD);
            meta.height.store(1, WRITE_ORD);
            pmem::persist_obj(meta);

            debug_log!(root = root_off, "initialized empty tree");
        }

        Ok(tree)
    }

    fn meta(&self) -> &TreeMeta {
        // SAFETY: meta_off addresses the pool root object, allocated at
        // least TreeMeta-sized and zero-initialized; fields are atomics.
        unsafe { &*self.pool.direct(self.meta_off).cast::<TreeMeta>() }
    }

    /// The pool this tree allocates from.
    #[inline]
    pub(crate) fn pool(&self) -> &PmPool {
        &self.pool
    }

    /// Handle of the current root page.
    #[inline]
    pub(crate) fn root(&self) -> u64 {
        self.meta().root.load(READ_ORD)
    }

    /// Current height: 1 for a lone leaf root.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.meta().height.load(READ_ORD)
    }

    /// Allocate a zeroed page, mapping pool exhaustion to a store error.
    pub(crate) fn alloc_page(&self) -> std::result::Result<u64, StoreError> {
        self.pool
            .allocate_zeroed(size_of::<Page<CARD>>())
            .map_err(|_err| {
                warn_log!(error = %_err, "page allocation failed");
                StoreError::Alloc
            })
    }

    /// Publish `new_root` as the root and bump the height.
    ///
    /// Only the splitter of the current root calls this, under that root's
    /// latch, so the store is single-writer. Readers that sampled the old
    /// root find migrated keys through its sibling chain, published first.
    pub(crate) fn set_new_root(&self, new_root: u64) {
        let meta = self.meta();
        meta.root.store(new_root, WRITE_ORD);
        pmem::persist_obj(&meta.root);

        let h = meta.height.load(RELAXED);
        meta.height.store(h + 1, WRITE_ORD);
        pmem::persist_obj(&meta.height);

        debug_log!(new_root, height = h + 1, "root replaced");
    }

    /// Replace the root with its only child and drop the height.
    pub(crate) fn collapse_root(&self, child: u64) {
        let meta = self.meta();
        meta.root.store(child, WRITE_ORD);
        pmem::persist_obj(&meta.root);

        let h = meta.height.load(RELAXED);
        meta.height.store(h - 1, WRITE_ORD);
        pmem::persist_obj(&meta.height);

        debug_log!(new_root = child, height = h - 1, "root collapsed");
    }

    /// Latch-free descent to the leaf whose range covers `key`.
    fn descend_to_leaf(&self, key: i64) -> (u64, &Page<CARD>) {
        let pool = self.pool();
        let mut off = self.root();
        let mut page = Page::<CARD>::at(pool, off);

        while !page.is_leaf() {
            let next = page.route(pool, key);
            if next == NULL_OFF {
                // A racing restructure emptied this page under us; start
                // over from the current root.
                off = self.root();
                page = Page::<CARD>::at(pool, off);
                continue;
            }
            off = next;
            page = Page::<CARD>::at(pool, off);
        }

        (off, page)
    }

    // ========================================================================
    //  Public operations
    // ========================================================================

    /// Point lookup. Latch-free; linearizes at the slot read whose
    /// switch-counter recheck succeeds.
    #[must_use]
    pub fn search(&self, key: i64) -> Option<u64> {
        let pool = self.pool();
        let (_, mut page) = self.descend_to_leaf(key);

        loop {
            match page.search_leaf(pool, key) {
                LeafSearch::Hit(value) => return Some(value),
                LeafSearch::Sibling(sib) => page = Page::<CARD>::at(pool, sib),
                LeafSearch::Miss => return None,
            }
        }
    }

    /// Durable insert. Returns `true` once the entry is persisted and
    /// reachable.
    ///
    /// `value` must be a nonzero handle (0 is the reserved null). Returns
    /// `false` for a null handle, on pool exhaustion, or if the bounded
    /// retry budget for tombstoned-page races is spent.
    pub fn insert(&self, key: i64, value: u64) -> bool {
        if value == NULL_OFF {
            return false;
        }

        for attempt in 0..MAX_ROOT_RETRIES {
            let (off, leaf) = self.descend_to_leaf(key);
            match leaf.store(self, off, key, value) {
                Ok(_) => return true,
                Err(StoreError::Deleted) => backoff(attempt),
                Err(StoreError::Alloc) => return false,
            }
        }

        warn_log!(key, "insert retry budget exhausted");
        false
    }

    /// Best-effort removal of one occurrence of `key`.
    ///
    /// With [`TreeConfig::rebalance_on_delete`] set, underflowing pages are
    /// merged or redistributed with their left sibling; otherwise the key
    /// is removed locally and the page tolerates underflow.
    pub fn remove(&self, key: i64) {
        let pool = self.pool();

        for attempt in 0..MAX_ROOT_RETRIES {
            let (mut off, mut page) = self.descend_to_leaf(key);

            // The key may live to the right of the descent target if a
            // split landed between routing and arrival.
            let found = loop {
                match page.search_leaf(pool, key) {
                    LeafSearch::Hit(_) => break true,
                    LeafSearch::Sibling(sib) => {
                        off = sib;
                        page = Page::<CARD>::at(pool, sib);
                    }
                    LeafSearch::Miss => break false,
                }
            };

            if !found {
                return;
            }

            let done = if self.config.rebalance_on_delete {
                page.remove_rebalancing(self, off, key, false)
            } else {
                page.remove(key)
            };

            if done {
                return;
            }
            backoff(attempt);
        }
    }

    /// Fill `out` with values whose keys lie in `(min, max)`, ascending,
    /// bounded by the buffer. Returns the number of values written.
    pub fn range(&self, min: i64, max: i64, out: &mut [u64]) -> usize {
        let pool = self.pool();
        let (_, leaf) = self.descend_to_leaf(min);
        leaf.search_range(pool, min, max, out)
    }

    /// Insert every pair in order. No bottom-up construction; each pair
    /// goes through the normal insert path.
    pub fn bulk_load(&self, pairs: &[(i64, u64)]) {
        for &(key, value) in pairs {
            self.insert(key, value);
        }
    }

    // ========================================================================
    //  Internal maintenance
    // ========================================================================

    /// Publish a split's separator into the parent level.
    ///
    /// Re-descends top-down to `level` and stores there, splitting parents
    /// recursively as needed. A tombstoned parent restarts the descent; the
    /// separator is never dropped on that path because until it lands, the
    /// migrated keys stay reachable through the child's sibling link.
    pub(crate) fn insert_internal(&self, key: i64, right: u64, level: u32) {
        let pool = self.pool();
        let mut attempts: usize = 0;

        loop {
            let root_off = self.root();
            let root = Page::<CARD>::at(pool, root_off);
            if level > root.level() {
                return;
            }

            let mut off = root_off;
            let mut page = root;
            while page.level() > level {
                let next = page.route(pool, key);
                off = next;
                page = Page::<CARD>::at(pool, off);
            }

            match page.store(self, off, key, right) {
                Ok(_) => return,
                Err(StoreError::Deleted) => {
                    attempts += 1;
                    debug_assert!(
                        attempts < 4096,
                        "separator publication livelocked at level {level}"
                    );
                    backoff(attempts);
                }
                Err(StoreError::Alloc) => {
                    // The separator stays unpublished; the split child is
                    // still reachable through its left sibling's link, at
                    // the cost of longer sideways walks.
                    warn_log!(key, level, "separator dropped: allocation failed");
                    return;
                }
            }
        }
    }

    /// Remove the separator for `child` from its parent at `level`.
    ///
    /// Latches the parent, removes the separator with the backward shift,
    /// and reports the left sibling the caller must rebalance with.
    pub(crate) fn delete_internal(&self, key: i64, child: u64, level: u32) -> ParentRemoval {
        let pool = self.pool();

        let root_off = self.root();
        let root = Page::<CARD>::at(pool, root_off);
        if level > root.level() {
            return ParentRemoval::NoParent;
        }

        let mut off = root_off;
        let mut page = root;
        while page.level() > level {
            off = page.route(pool, key);
            page = Page::<CARD>::at(pool, off);
        }

        let _guard = page.hdr.latch.lock();

        if page.hdr.leftmost.load(RELAXED) == child {
            return ParentRemoval::LeftmostChild;
        }

        let mut i = 0;
        while i < CARD && page.records[i].ptr.load(RELAXED) != NULL_OFF {
            if page.records[i].ptr.load(RELAXED) == child {
                if i == 0 {
                    if page.hdr.leftmost.load(RELAXED) != page.records[0].ptr.load(RELAXED) {
                        let separator = page.records[0].key.load(RELAXED);
                        let left_sibling = page.hdr.leftmost.load(RELAXED);
                        page.remove_key(separator);
                        self.maybe_collapse(page, off);
                        return ParentRemoval::Removed {
                            separator,
                            left_sibling,
                        };
                    }
                } else if page.records[i - 1].ptr.load(RELAXED) != page.records[i].ptr.load(RELAXED)
                {
                    let separator = page.records[i].key.load(RELAXED);
                    let left_sibling = page.records[i - 1].ptr.load(RELAXED);
                    page.remove_key(separator);
                    self.maybe_collapse(page, off);
                    return ParentRemoval::Removed {
                        separator,
                        left_sibling,
                    };
                }
            }
            i += 1;
        }

        ParentRemoval::NoParent
    }

    /// Collapse the root into its only child when separator removal left it
    /// empty. Caller holds the page's latch, which also excludes a racing
    /// root split.
    fn maybe_collapse(&self, page: &Page<CARD>, off: u64) {
        if self.root() == off
            && !page.is_leaf()
            && page.count() == 0
            && page.sibling() == NULL_OFF
        {
            self.collapse_root(page.hdr.leftmost.load(RELAXED));
            page.mark_deleted();
        }
    }

    // ========================================================================
    //  Diagnostics
    // ========================================================================

    /// Walk the whole structure and count pages and entries per level.
    ///
    /// Quiescent-state only: concurrent writers make the counts approximate.
    #[must_use]
    pub fn stats(&self) -> TreeStats {
        let pool = self.pool();
        let mut stats = TreeStats {
            height: self.height(),
            ..TreeStats::default()
        };

        let mut level_start = self.root();
        loop {
            let start = Page::<CARD>::at(pool, level_start);
            let is_leaf_level = start.is_leaf();

            let mut page = start;
            loop {
                let n = page.count();
                stats.nodes += 1;
                stats.keys += n;
                if is_leaf_level {
                    stats.leaf_nodes += 1;
                    stats.leaf_keys += n;
                }

                let sib = page.sibling();
                if sib == NULL_OFF {
                    break;
                }
                page = Page::<CARD>::at(pool, sib);
            }

            if is_leaf_level {
                break;
            }
            level_start = start.hdr.leftmost.load(READ_ORD);
        }

        stats
    }

    /// Verify structural invariants; panics with details on violation.
    ///
    /// Checks, per reachable page: sorted entries and sentinel termination;
    /// per sibling pair: the fence (`last_key(A) <= B.first_key`) and equal
    /// levels; per internal page: children exactly one level down, each
    /// child's first key at or above its separator. Uniform leaf depth
    /// follows from the per-child level check.
    ///
    /// Quiescent-state only.
    pub fn verify_invariants(&self) {
        let pool = self.pool();

        let mut level_start = self.root();
        loop {
            let start = Page::<CARD>::at(pool, level_start);
            let level = start.level();

            let mut page = start;
            loop {
                page.assert_local_invariants();
                assert!(!page.is_deleted(), "tombstoned page still linked");

                if !page.is_leaf() {
                    self.verify_children(page);
                }

                let sib = page.sibling();
                if sib == NULL_OFF {
                    break;
                }

                let sibling = Page::<CARD>::at(pool, sib);
                assert_eq!(sibling.level(), level, "sibling chain crosses levels");

                let n = page.count();
                if n > 0 && sibling.count() > 0 {
                    let last = page.records[n - 1].key.load(RELAXED);
                    assert!(
                        last <= sibling.first_key(),
                        "sibling fence violated at level {level}: {last} > {}",
                        sibling.first_key()
                    );
                }
                page = sibling;
            }

            if start.is_leaf() {
                break;
            }
            level_start = start.hdr.leftmost.load(READ_ORD);
        }
    }

    fn verify_children(&self, page: &Page<CARD>) {
        let pool = self.pool();
        let level = page.level();
        let n = page.count();

        let leftmost = page.hdr.leftmost.load(RELAXED);
        assert_ne!(leftmost, NULL_OFF, "internal page without leftmost child");
        let lm = Page::<CARD>::at(pool, leftmost);
        assert_eq!(lm.level(), level - 1, "leftmost child level mismatch");

        if n > 0 && lm.count() > 0 {
            let lm_last = lm.records[lm.count() - 1].key.load(RELAXED);
            assert!(
                lm_last <= page.records[0].key.load(RELAXED),
                "leftmost subtree exceeds first separator"
            );
        }

        for i in 0..n {
            let child_off = page.records[i].ptr.load(RELAXED);
            let child = Page::<CARD>::at(pool, child_off);
            assert_eq!(child.level(), level - 1, "child level mismatch at slot {i}");

            if child.count() > 0 {
                let separator = page.records[i].key.load(RELAXED);
                assert!(
                    child.first_key() >= separator,
                    "child first key {} below separator {separator}",
                    child.first_key()
                );
            }
        }
    }
}

impl<const CARD: usize> std::fmt::Debug for BTree<CARD> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BTree")
            .field("cardinality", &CARD)
            .field("height", &self.height())
            .field("root", &self.root())
            .finish_non_exhaustive()
    }
}

/// Brief spin between root-level retries.
fn backoff(attempt: usize) {
    for _ in 0..(attempt.min(10) * 8 + 4) {
        std::hint::spin_loop();
    }
    if attempt > 10 {
        std::thread::yield_now();
    }
}

// ============================================================================
//  Tests
// ============================================================================
