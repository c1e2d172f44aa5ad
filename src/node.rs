//! Filepath: src/node.rs
//!
//! Page (node) layout and the failure-atomic shift / rebalance protocol.
//!
//! A page is a fixed 512-byte container of sorted `(key, handle)` entries
//! behind a one-cache-line header. Everything mutable is an atomic, so a
//! page is only ever operated through `&Page`: writers serialize on the
//! header latch, readers run latch-free and reconcile with in-flight shifts
//! through the header's switch counter.
//!
//! # Reader protocol
//!
//! Writers flip the switch counter's parity before mutating: even means a
//! forward scan is safe (insertion shifts move entries right-to-left, so the
//! scan front never observes a torn prefix), odd means a backward scan is
//! safe (deletion shifts move left-to-right). A reader samples the counter,
//! scans in the indicated direction, and retries whenever the counter moved
//! under it. Structural events bump the counter by two, keeping parity while
//! invalidating every in-flight snapshot.
//!
//! # Persistence discipline
//!
//! Every slot update is a single 8-byte store, failure-atomic on the
//! platform. The trailing null sentinel carries the committed length: it
//! advances only after the slot behind it is fully written, so a crash
//! mid-shift exposes either the pre- or post-state, never a torn entry.
//! Shift flushes happen only at cache-line boundaries ([`pmem::entry_needs_flush`]).

use std::sync::atomic::{AtomicI16, AtomicI64, AtomicU32, AtomicU64, AtomicU8};

use crate::latch::Latch;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::pmem;
use crate::pool::PmPool;
use crate::trace::trace_log;
use crate::tree::BTree;

/// On-media page size in bytes.
pub const PAGE_SIZE: usize = 512;

/// Header size in bytes; one cache line.
pub const HEADER_SIZE: usize = 64;

/// Entry size in bytes: 8-byte key + 8-byte handle.
pub const ENTRY_SIZE: usize = 16;

/// Entries per page at the default page size, including the sentinel slot.
pub const DEFAULT_CARDINALITY: usize = (PAGE_SIZE - HEADER_SIZE) / ENTRY_SIZE;

/// The null persistent handle. Doubles as the sentinel terminator and the
/// "no entry" value inside a slot.
pub const NULL_OFF: u64 = 0;

// ============================================================================
//  Header
// ============================================================================

/// Page header. Fits in one cache line.
#[repr(C, align(64))]
pub(crate) struct Header {
    /// For internal pages: child preceding `records[0]`. Null at leaves.
    pub(crate) leftmost: AtomicU64,

    /// Right sibling at the same level; forms a per-level linked list.
    pub(crate) sibling: AtomicU64,

    /// 0 at leaves, increasing toward the root.
    pub(crate) level: AtomicU32,

    /// Readers' reconciliation token. Even parity = forward scan safe,
    /// odd = backward scan safe.
    pub(crate) switch_counter: AtomicU32,

    /// Index of the last occupied slot, -1 when empty.
    pub(crate) last_index: AtomicI16,

    /// Tombstone: the page has been unlinked and racing readers must retry
    /// through a neighbour.
    pub(crate) is_deleted: AtomicU8,

    _pad: u8,

    /// Writer mutual exclusion. Volatile state, never flushed.
    pub(crate) latch: Latch,
}

const _: () = assert!(size_of::<Header>() == HEADER_SIZE);

// ============================================================================
//  Entry
// ============================================================================

/// One slot: a key and a handle.
///
/// The handle is a value handle at leaves and a child page offset in
/// internal pages; 0 means "no entry" either way.
#[repr(C)]
pub(crate) struct Entry {
    pub(crate) key: AtomicI64,
    pub(crate) ptr: AtomicU64,
}

const _: () = assert!(size_of::<Entry>() == ENTRY_SIZE);

// ============================================================================
//  Page
// ============================================================================

/// Result of a leaf-level linear search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LeafSearch {
    /// Exact match; the value handle.
    Hit(u64),

    /// The key falls at or beyond the right sibling's first key; the caller
    /// must continue there (store forwarding).
    Sibling(u64),

    /// Not in this page and not forwarded.
    Miss,
}

/// Why a `store` attempt did not complete on this page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreError {
    /// The page was tombstoned before the latch was acquired; retry from
    /// the root.
    Deleted,

    /// The pool could not supply a sibling page for a split.
    Alloc,
}

/// A fixed-size B+-tree page: header plus a sorted slot array.
///
/// `CARD` is the slot count; the live entry count never exceeds `CARD - 1`
/// because the trailing null sentinel needs a slot. Pages are never
/// constructed by value: they are cast in place from zeroed pool memory and
/// initialized through [`Page::init`].
#[repr(C)]
pub struct Page<const CARD: usize = DEFAULT_CARDINALITY> {
    pub(crate) hdr: Header,
    pub(crate) records: [Entry; CARD],
}

impl<const CARD: usize> Page<CARD> {
    const CARD_CHECK: () = {
        assert!(CARD >= 4, "page cardinality must be at least 4");
        assert!(CARD <= i16::MAX as usize, "cardinality must fit last_index");
    };

    /// Resolve a persistent handle to a page reference.
    ///
    /// # Safety contract (internal)
    /// `off` must have been produced by a `Page<CARD>`-sized pool allocation.
    #[inline]
    pub(crate) fn at(pool: &PmPool, off: u64) -> &Self {
        let () = Self::CARD_CHECK;
        debug_assert!(off != NULL_OFF);
        // SAFETY: offsets flowing through the tree only ever come from
        // page allocations of this cardinality; all fields are atomics, so
        // shared access is defined even while a writer mutates.
        unsafe { &*pool.direct(off).cast::<Self>() }
    }

    /// Initialize a fresh, zeroed page at `level`.
    ///
    /// Zeroed media already encodes an empty slot array (sentinel at slot 0)
    /// and cleared links; only `last_index` and the level need stores.
    pub(crate) fn init(&self, level: u32) {
        self.hdr.level.store(level, RELAXED);
        self.hdr.last_index.store(-1, WRITE_ORD);
    }

    /// Initialize a fresh page as a new root with one separator.
    ///
    /// Used when the tree grows: `left` holds keys below `key`, `right` the
    /// rest. The whole page is persisted before the caller publishes it.
    pub(crate) fn init_root(&self, left: u64, key: i64, right: u64, level: u32) {
        self.hdr.leftmost.store(left, WRITE_ORD);
        self.hdr.level.store(level, RELAXED);
        self.records[0].key.store(key, WRITE_ORD);
        self.records[0].ptr.store(right, WRITE_ORD);
        self.records[1].ptr.store(NULL_OFF, WRITE_ORD);
        self.hdr.last_index.store(0, WRITE_ORD);

        pmem::persist(std::ptr::from_ref(self).cast::<u8>(), size_of::<Self>());
    }

    // ========================================================================
    //  Header accessors
    // ========================================================================

    /// Tree level; 0 at leaves.
    #[inline]
    pub(crate) fn level(&self) -> u32 {
        self.hdr.level.load(RELAXED)
    }

    /// Whether this page is a leaf.
    #[inline]
    pub(crate) fn is_leaf(&self) -> bool {
        self.hdr.leftmost.load(READ_ORD) == NULL_OFF
    }

    /// Right-sibling handle, or null.
    #[inline]
    pub(crate) fn sibling(&self) -> u64 {
        self.hdr.sibling.load(READ_ORD)
    }

    /// First key of the page. Meaningful only when the page is non-empty,
    /// which the sibling-fence protocol guarantees at every call site.
    #[inline]
    pub(crate) fn first_key(&self) -> i64 {
        self.records[0].key.load(READ_ORD)
    }

    /// Whether this page has been tombstoned.
    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        self.hdr.is_deleted.load(READ_ORD) != 0
    }

    /// Tombstone this page and persist the mark.
    pub(crate) fn mark_deleted(&self) {
        self.hdr.is_deleted.store(1, WRITE_ORD);
        pmem::persist_obj(&self.hdr.is_deleted);
    }

    #[inline]
    fn is_forward(counter: u32) -> bool {
        counter % 2 == 0
    }

    /// Make the switch counter even: a concurrent forward scan stays safe
    /// while insertion shifts entries toward higher slots.
    fn set_forward(&self) {
        let c = self.hdr.switch_counter.load(RELAXED);
        if !Self::is_forward(c) {
            self.hdr.switch_counter.store(c.wrapping_add(1), WRITE_ORD);
        }
    }

    /// Make the switch counter odd: a concurrent backward scan stays safe
    /// while deletion shifts entries toward lower slots.
    fn set_backward(&self) {
        let c = self.hdr.switch_counter.load(RELAXED);
        if Self::is_forward(c) {
            self.hdr.switch_counter.store(c.wrapping_add(1), WRITE_ORD);
        }
    }

    /// Entry address, for boundary-flush decisions.
    #[inline]
    fn entry_addr(&self, i: usize) -> usize {
        std::ptr::from_ref(&self.records[i]) as usize
    }

    fn persist_entry(&self, i: usize) {
        pmem::persist(self.entry_addr(i) as *const u8, ENTRY_SIZE);
    }

    // ========================================================================
    //  Count (parity-retry read of the live entry count)
    // ========================================================================

    /// Number of live entries, read consistently against concurrent shifts.
    ///
    /// Starts from `last_index + 1` and walks toward the sentinel in the
    /// direction the switch counter indicates; retries if the counter moved.
    pub(crate) fn count(&self) -> usize {
        loop {
            let previous = self.hdr.switch_counter.load(READ_ORD);
            let mut count: isize = isize::from(self.hdr.last_index.load(READ_ORD)) + 1;

            while count >= 0
                && (count as usize) < CARD
                && self.records[count as usize].ptr.load(READ_ORD) != NULL_OFF
            {
                if Self::is_forward(previous) {
                    count += 1;
                } else {
                    count -= 1;
                }
            }

            if count < 0 {
                count = 0;
                while (count as usize) < CARD
                    && self.records[count as usize].ptr.load(READ_ORD) != NULL_OFF
                {
                    count += 1;
                }
            }

            if self.hdr.switch_counter.load(READ_ORD) == previous {
                return count as usize;
            }
        }
    }

    // ========================================================================
    //  FAST insertion
    // ========================================================================

    /// Shift-insert `(key, ptr)` into a page with `num_entries` live slots.
    ///
    /// Returns the new live count. Caller holds the latch and has verified
    /// `num_entries < CARD - 1`.
    ///
    /// The shift runs from the high end: first the null sentinel is extended
    /// one slot outward, then entries greater than `key` move up one slot
    /// each, flushed only when a move completes a cache line. The new entry
    /// is published by writing its slot's pointer twice: first the
    /// neighbour's handle (so a racing reader sees a duplicate, which the
    /// scan's dedup check skips), then the key, then the real handle.
    pub(crate) fn insert_key(
        &self,
        key: i64,
        ptr: u64,
        num_entries: usize,
        flush: bool,
    ) -> usize {
        self.set_forward();

        if num_entries == 0 {
            // Empty page: no shifting, just the entry and its sentinel.
            self.records[0].key.store(key, WRITE_ORD);
            self.records[0].ptr.store(ptr, WRITE_ORD);
            self.records[1].ptr.store(NULL_OFF, WRITE_ORD);

            if flush {
                pmem::persist(self.entry_addr(0) as *const u8, 2 * ENTRY_SIZE);
            }
        } else {
            // Extend the sentinel outward; this is what commits the new
            // length once the slot behind it is filled.
            self.records[num_entries + 1]
                .ptr
                .store(self.records[num_entries].ptr.load(RELAXED), WRITE_ORD);
            if flush && pmem::entry_needs_flush(self.entry_addr(num_entries + 1) + 8, 8) {
                pmem::persist((self.entry_addr(num_entries + 1) + 8) as *const u8, 8);
            }

            let mut inserted = false;
            let mut i = num_entries as isize - 1;
            while i >= 0 {
                let slot = i as usize;
                let slot_key = self.records[slot].key.load(RELAXED);

                if key < slot_key {
                    // Shift this entry up one slot.
                    self.records[slot + 1]
                        .ptr
                        .store(self.records[slot].ptr.load(RELAXED), WRITE_ORD);
                    self.records[slot + 1].key.store(slot_key, WRITE_ORD);

                    if flush && pmem::entry_needs_flush(self.entry_addr(slot + 1), ENTRY_SIZE) {
                        self.persist_entry(slot + 1);
                    }
                } else {
                    // Place here: temporary pointer first, key, real handle.
                    self.records[slot + 1]
                        .ptr
                        .store(self.records[slot].ptr.load(RELAXED), WRITE_ORD);
                    self.records[slot + 1].key.store(key, WRITE_ORD);
                    self.records[slot + 1].ptr.store(ptr, WRITE_ORD);

                    if flush {
                        self.persist_entry(slot + 1);
                    }
                    inserted = true;
                    break;
                }

                i -= 1;
            }

            if !inserted {
                // Smallest key in the page: same temporary-pointer trick at
                // slot 0, seeded from the leftmost link for internal pages.
                self.records[0]
                    .ptr
                    .store(self.hdr.leftmost.load(RELAXED), WRITE_ORD);
                self.records[0].key.store(key, WRITE_ORD);
                self.records[0].ptr.store(ptr, WRITE_ORD);

                if flush {
                    self.persist_entry(0);
                }
            }
        }

        // The sentinel advance already encodes the new cardinality in
        // media; this store is a single aligned write within its line.
        #[allow(clippy::cast_possible_truncation)]
        self.hdr.last_index.store(num_entries as i16, WRITE_ORD);

        num_entries + 1
    }

    // ========================================================================
    //  Store: forwarding, FAST insert, FAIR split
    // ========================================================================

    /// Insert `(key, ptr)` into this page or the correct page to the right,
    /// splitting when full.
    ///
    /// Returns the handle of the page that received the entry.
    pub(crate) fn store(
        &self,
        tree: &BTree<CARD>,
        self_off: u64,
        key: i64,
        ptr: u64,
    ) -> Result<u64, StoreError> {
        let pool = tree.pool();
        let mut page = self;
        let mut off = self_off;

        loop {
            let guard = page.hdr.latch.lock();

            if page.is_deleted() {
                drop(guard);
                return Err(StoreError::Deleted);
            }

            // Store forwarding: a split may have moved the key range right
            // between descent and latch acquisition.
            let sib = page.sibling();
            if sib != NULL_OFF {
                let sibling = Page::<CARD>::at(pool, sib);
                if key > sibling.first_key() {
                    drop(guard);
                    trace_log!(key, from = off, to = sib, "store forwarded");
                    page = sibling;
                    off = sib;
                    continue;
                }
            }

            let num_entries = page.count();

            if num_entries < CARD - 1 {
                page.insert_key(key, ptr, num_entries, true);
                return Ok(off);
            }

            // FAIR split.
            return page.split_and_store(tree, off, key, ptr, num_entries, guard);
        }
    }

    /// Split a full page and place `(key, ptr)` into the proper half.
    ///
    /// Ordering is what makes this failure-atomic: the sibling is fully
    /// built and persisted before it is linked, the link is persisted before
    /// the truncation, and the truncation is a single sentinel store. A
    /// crash at any point leaves every migrated entry reachable through
    /// either the old page or the published sibling chain.
    fn split_and_store(
        &self,
        tree: &BTree<CARD>,
        self_off: u64,
        key: i64,
        ptr: u64,
        num_entries: usize,
        guard: crate::latch::LatchGuard<'_>,
    ) -> Result<u64, StoreError> {
        let pool = tree.pool();

        let sibling_off = match tree.alloc_page() {
            Ok(off) => off,
            Err(err) => {
                drop(guard);
                return Err(err);
            }
        };
        let sibling = Page::<CARD>::at(pool, sibling_off);
        let level = self.level();
        sibling.init(level);

        let m = num_entries.div_ceil(2);
        let split_key = self.records[m].key.load(RELAXED);

        // Migrate the upper half without per-entry flushes; one persist of
        // the whole sibling page afterwards.
        let mut sibling_cnt = 0;
        if self.is_leaf() {
            for i in m..num_entries {
                sibling_cnt = sibling.insert_key(
                    self.records[i].key.load(RELAXED),
                    self.records[i].ptr.load(RELAXED),
                    sibling_cnt,
                    false,
                );
            }
        } else {
            for i in (m + 1)..num_entries {
                sibling_cnt = sibling.insert_key(
                    self.records[i].key.load(RELAXED),
                    self.records[i].ptr.load(RELAXED),
                    sibling_cnt,
                    false,
                );
            }
            sibling
                .hdr
                .leftmost
                .store(self.records[m].ptr.load(RELAXED), WRITE_ORD);
        }

        sibling.hdr.sibling.store(self.sibling(), WRITE_ORD);
        pmem::persist(std::ptr::from_ref(sibling).cast::<u8>(), size_of::<Self>());

        // Publish the sibling. From here the migrated entries are reachable
        // through the chain even if we crash before truncating.
        self.hdr.sibling.store(sibling_off, WRITE_ORD);
        pmem::persist_obj(&self.hdr);

        // Truncate: bump the counter past every in-flight snapshot, retract
        // the sentinel to slot m, shrink last_index.
        let c = self.hdr.switch_counter.load(RELAXED);
        let bump = if Self::is_forward(c) { 2 } else { 1 };
        self.hdr.switch_counter.store(c.wrapping_add(bump), WRITE_ORD);

        self.records[m].ptr.store(NULL_OFF, WRITE_ORD);
        self.persist_entry(m);

        #[allow(clippy::cast_possible_truncation)]
        self.hdr.last_index.store(m as i16 - 1, WRITE_ORD);
        pmem::persist_obj(&self.hdr.last_index);

        let num_entries = m;

        // Insert the pending entry into whichever half owns it.
        let ret = if key < split_key {
            self.insert_key(key, ptr, num_entries, true);
            self_off
        } else {
            sibling.insert_key(key, ptr, sibling_cnt, true);
            sibling_off
        };

        trace_log!(page = self_off, sibling = sibling_off, split_key, "split");

        // Publish the separator: grow a new root, or re-descend into the
        // parent level. Only the current root's splitter replaces the root.
        if tree.root() == self_off {
            let new_root_off = match tree.alloc_page() {
                Ok(off) => off,
                Err(err) => {
                    drop(guard);
                    return Err(err);
                }
            };
            Page::<CARD>::at(pool, new_root_off).init_root(
                self_off,
                split_key,
                sibling_off,
                level + 1,
            );
            tree.set_new_root(new_root_off);
            drop(guard);
        } else {
            drop(guard);
            tree.insert_internal(split_key, sibling_off, level + 1);
        }

        Ok(ret)
    }

    // ========================================================================
    //  FAST removal
    // ========================================================================

    /// Backward-shift `key` out of the page. Caller holds the latch.
    ///
    /// The slot is vacated by overwriting its pointer with its left
    /// neighbour's (a duplicate a racing backward scan skips), then every
    /// entry above shifts down one slot, flushed at line boundaries.
    pub(crate) fn remove_key(&self, key: i64) -> bool {
        self.set_backward();

        let mut shift = false;
        let mut i = 0;
        while i < CARD - 1 && self.records[i].ptr.load(RELAXED) != NULL_OFF {
            if !shift && self.records[i].key.load(RELAXED) == key {
                let replacement = if i == 0 {
                    self.hdr.leftmost.load(RELAXED)
                } else {
                    self.records[i - 1].ptr.load(RELAXED)
                };
                self.records[i].ptr.store(replacement, WRITE_ORD);
                shift = true;
            }

            if shift {
                self.records[i]
                    .key
                    .store(self.records[i + 1].key.load(RELAXED), WRITE_ORD);
                self.records[i]
                    .ptr
                    .store(self.records[i + 1].ptr.load(RELAXED), WRITE_ORD);

                if pmem::entry_needs_flush(self.entry_addr(i), ENTRY_SIZE) {
                    self.persist_entry(i);
                }
            }

            i += 1;
        }

        if shift {
            let last = self.hdr.last_index.load(RELAXED);
            self.hdr.last_index.store(last - 1, WRITE_ORD);
        }
        shift
    }

    /// Latch, remove locally, unlatch. The underflow-tolerant delete path.
    pub(crate) fn remove(&self, key: i64) -> bool {
        let _guard = self.hdr.latch.lock();
        self.remove_key(key)
    }

    // ========================================================================
    //  FAIR delete: merge / redistribute
    // ========================================================================

    /// Remove `key` and rebalance on underflow.
    ///
    /// `only_rebalance` skips the local removal: it is set when a leftmost
    /// child asks its right sibling to rebalance on its behalf, since a
    /// leftmost child has no in-parent separator to remove.
    ///
    /// Lock order: the page's own latch is taken first; on underflow the
    /// parent's separator is removed under the parent's latch (released
    /// before returning here); then the left sibling is latched and chased
    /// right until it is the true predecessor. Right-then-left acquisition
    /// never deadlocks against `store`, which only ever moves rightward
    /// after releasing.
    pub(crate) fn remove_rebalancing(
        &self,
        tree: &BTree<CARD>,
        self_off: u64,
        key: i64,
        only_rebalance: bool,
    ) -> bool {
        let pool = tree.pool();
        let guard = self.hdr.latch.lock();

        if self.is_deleted() {
            drop(guard);
            return false;
        }

        if !only_rebalance {
            let num_entries_before = self.count();

            if tree.root() == self_off {
                // A single-separator internal root with no sibling collapses
                // into its only child.
                if self.level() > 0 && num_entries_before == 1 && self.sibling() == NULL_OFF {
                    tree.collapse_root(self.hdr.leftmost.load(RELAXED));
                    self.mark_deleted();
                }

                self.remove_key(key);
                drop(guard);
                return true;
            }

            let should_rebalance = num_entries_before.saturating_sub(1) < (CARD - 1) / 2;
            let removed = self.remove_key(key);

            if !should_rebalance {
                drop(guard);
                return if self.is_leaf() { removed } else { true };
            }
        }

        // Ask the parent for our left sibling and drop the separator.
        let (deleted_key_from_parent, mut left_off) =
            match tree.delete_internal(key, self_off, self.level() + 1) {
                crate::tree::ParentRemoval::LeftmostChild => {
                    // No separator to remove for the leftmost child; the
                    // right sibling rebalances instead and finds us as its
                    // left.
                    drop(guard);

                    let sib = self.sibling();
                    if sib != NULL_OFF {
                        let sibling = Page::<CARD>::at(pool, sib);
                        sibling.remove_rebalancing(tree, sib, sibling.first_key(), true);
                    }
                    return true;
                }
                crate::tree::ParentRemoval::NoParent => {
                    drop(guard);
                    return true;
                }
                crate::tree::ParentRemoval::Removed {
                    separator,
                    left_sibling,
                } => (separator, left_sibling),
            };

        // Latch the left sibling, chasing right past any splits that slid
        // between us since the parent was consulted.
        let mut left = Page::<CARD>::at(pool, left_off);
        let mut left_guard = left.hdr.latch.lock();
        while left.sibling() != self_off {
            let next = left.sibling();
            if next == NULL_OFF {
                // The chain was restructured under us; give up this round
                // and leave the page underflowed.
                drop(left_guard);
                drop(guard);
                return true;
            }
            drop(left_guard);
            left = Page::<CARD>::at(pool, next);
            left_off = next;
            left_guard = left.hdr.latch.lock();
        }

        let num_entries = self.count();
        let left_num_entries = left.count();
        let mut total = num_entries + left_num_entries;
        if !self.is_leaf() {
            total += 1;
        }

        if total > CARD - 1 {
            self.redistribute(
                tree,
                self_off,
                left,
                left_off,
                num_entries,
                left_num_entries,
                total,
                deleted_key_from_parent,
            );
        } else {
            // Merge this page into its left sibling.
            self.mark_deleted();

            let mut n = left_num_entries;
            if !self.is_leaf() {
                n = left.insert_key(
                    deleted_key_from_parent,
                    self.hdr.leftmost.load(RELAXED),
                    n,
                    true,
                );
            }

            let mut i = 0;
            while i < CARD && self.records[i].ptr.load(RELAXED) != NULL_OFF {
                n = left.insert_key(
                    self.records[i].key.load(RELAXED),
                    self.records[i].ptr.load(RELAXED),
                    n,
                    true,
                );
                i += 1;
            }

            left.hdr.sibling.store(self.sibling(), WRITE_ORD);
            pmem::persist_obj(&left.hdr.sibling);

            trace_log!(page = self_off, into = left_off, "merged");
        }

        drop(left_guard);
        drop(guard);
        true
    }

    /// Rebalance entries between `left` and `self` around the midpoint.
    ///
    /// Both latches are held by the caller.
    #[allow(clippy::too_many_arguments)]
    fn redistribute(
        &self,
        tree: &BTree<CARD>,
        self_off: u64,
        left: &Self,
        left_off: u64,
        num_entries: usize,
        left_num_entries: usize,
        total: usize,
        deleted_key_from_parent: i64,
    ) {
        let pool = tree.pool();
        let m = total.div_ceil(2);
        let level = self.level();
        let parent_key;

        if num_entries < left_num_entries {
            // Move the left sibling's tail into this page.
            let mut n = num_entries;

            if self.is_leaf() {
                for i in (m..left_num_entries).rev() {
                    n = self.insert_key(
                        left.records[i].key.load(RELAXED),
                        left.records[i].ptr.load(RELAXED),
                        n,
                        true,
                    );
                }

                left.records[m].ptr.store(NULL_OFF, WRITE_ORD);
                left.persist_entry(m);

                #[allow(clippy::cast_possible_truncation)]
                left.hdr.last_index.store(m as i16 - 1, WRITE_ORD);
                pmem::persist_obj(&left.hdr.last_index);

                parent_key = self.first_key();
            } else {
                // The parent's old separator re-enters as a real entry,
                // paired with the old leftmost child.
                n = self.insert_key(
                    deleted_key_from_parent,
                    self.hdr.leftmost.load(RELAXED),
                    n,
                    true,
                );

                for i in ((m + 1)..left_num_entries).rev() {
                    n = self.insert_key(
                        left.records[i].key.load(RELAXED),
                        left.records[i].ptr.load(RELAXED),
                        n,
                        true,
                    );
                }

                parent_key = left.records[m].key.load(RELAXED);

                self.hdr
                    .leftmost
                    .store(left.records[m].ptr.load(RELAXED), WRITE_ORD);
                pmem::persist_obj(&self.hdr.leftmost);

                left.records[m].ptr.store(NULL_OFF, WRITE_ORD);
                left.persist_entry(m);

                #[allow(clippy::cast_possible_truncation)]
                left.hdr.last_index.store(m as i16 - 1, WRITE_ORD);
                pmem::persist_obj(&left.hdr.last_index);
            }

            if tree.root() == left_off {
                if let Ok(new_root_off) = tree.alloc_page() {
                    Page::<CARD>::at(pool, new_root_off).init_root(
                        left_off,
                        parent_key,
                        self_off,
                        level + 1,
                    );
                    tree.set_new_root(new_root_off);
                }
            } else {
                tree.insert_internal(parent_key, self_off, level + 1);
            }
        } else {
            // Move this page's head into the left sibling; the remainder is
            // rebuilt in a fresh page and this one is tombstoned.
            self.mark_deleted();

            let Ok(new_sibling_off) = tree.alloc_page() else {
                return;
            };
            let new_sibling = Page::<CARD>::at(pool, new_sibling_off);
            new_sibling.init(level);

            let ns_guard = new_sibling.hdr.latch.lock();
            new_sibling.hdr.sibling.store(self.sibling(), WRITE_ORD);

            let num_dist_entries = num_entries - m;
            let mut left_n = left_num_entries;
            let mut new_cnt = 0;

            if self.is_leaf() {
                for i in 0..num_dist_entries {
                    left_n = left.insert_key(
                        self.records[i].key.load(RELAXED),
                        self.records[i].ptr.load(RELAXED),
                        left_n,
                        true,
                    );
                }

                let mut i = num_dist_entries;
                while i < CARD && self.records[i].ptr.load(RELAXED) != NULL_OFF {
                    new_cnt = new_sibling.insert_key(
                        self.records[i].key.load(RELAXED),
                        self.records[i].ptr.load(RELAXED),
                        new_cnt,
                        false,
                    );
                    i += 1;
                }

                pmem::persist(
                    std::ptr::from_ref(new_sibling).cast::<u8>(),
                    size_of::<Self>(),
                );

                left.hdr.sibling.store(new_sibling_off, WRITE_ORD);
                pmem::persist_obj(&left.hdr.sibling);

                parent_key = new_sibling.first_key();
            } else {
                left_n = left.insert_key(
                    deleted_key_from_parent,
                    self.hdr.leftmost.load(RELAXED),
                    left_n,
                    true,
                );

                for i in 0..(num_dist_entries - 1) {
                    left_n = left.insert_key(
                        self.records[i].key.load(RELAXED),
                        self.records[i].ptr.load(RELAXED),
                        left_n,
                        true,
                    );
                }

                parent_key = self.records[num_dist_entries - 1].key.load(RELAXED);

                new_sibling.hdr.leftmost.store(
                    self.records[num_dist_entries - 1].ptr.load(RELAXED),
                    WRITE_ORD,
                );

                let mut i = num_dist_entries;
                while i < CARD && self.records[i].ptr.load(RELAXED) != NULL_OFF {
                    new_cnt = new_sibling.insert_key(
                        self.records[i].key.load(RELAXED),
                        self.records[i].ptr.load(RELAXED),
                        new_cnt,
                        false,
                    );
                    i += 1;
                }

                pmem::persist(
                    std::ptr::from_ref(new_sibling).cast::<u8>(),
                    size_of::<Self>(),
                );

                left.hdr.sibling.store(new_sibling_off, WRITE_ORD);
                pmem::persist_obj(&left.hdr.sibling);
            }

            if tree.root() == left_off {
                if let Ok(new_root_off) = tree.alloc_page() {
                    Page::<CARD>::at(pool, new_root_off).init_root(
                        left_off,
                        parent_key,
                        new_sibling_off,
                        level + 1,
                    );
                    tree.set_new_root(new_root_off);
                }
            } else {
                tree.insert_internal(parent_key, new_sibling_off, level + 1);
            }

            drop(ns_guard);
        }
    }

    // ========================================================================
    //  Linear search (latch-free)
    // ========================================================================

    /// Leaf lookup under the reader protocol.
    ///
    /// Every candidate goes through a read-key / read-handle / recheck-key
    /// triple: a slot whose key moved under us is rejected, and a slot whose
    /// handle equals its left neighbour's is a shift duplicate and skipped.
    pub(crate) fn search_leaf(&self, pool: &PmPool, key: i64) -> LeafSearch {
        debug_assert!(self.is_leaf());
        let mut ret;

        loop {
            let previous = self.hdr.switch_counter.load(READ_ORD);
            ret = NULL_OFF;

            if Self::is_forward(previous) {
                let k = self.records[0].key.load(READ_ORD);
                if k == key {
                    let t = self.records[0].ptr.load(READ_ORD);
                    if t != NULL_OFF && self.records[0].key.load(READ_ORD) == k {
                        ret = t;
                    }
                }

                if ret == NULL_OFF {
                    let mut i = 1;
                    while i < CARD && self.records[i].ptr.load(READ_ORD) != NULL_OFF {
                        let k = self.records[i].key.load(READ_ORD);
                        if k == key {
                            let t = self.records[i].ptr.load(READ_ORD);
                            if self.records[i - 1].ptr.load(READ_ORD) != t
                                && self.records[i].key.load(READ_ORD) == k
                            {
                                ret = t;
                                break;
                            }
                        }
                        i += 1;
                    }
                }
            } else {
                let mut i = self.count() as isize - 1;
                while i > 0 {
                    let slot = i as usize;
                    let k = self.records[slot].key.load(READ_ORD);
                    if k == key {
                        let t = self.records[slot].ptr.load(READ_ORD);
                        if self.records[slot - 1].ptr.load(READ_ORD) != t
                            && t != NULL_OFF
                            && self.records[slot].key.load(READ_ORD) == k
                        {
                            ret = t;
                            break;
                        }
                    }
                    i -= 1;
                }

                if ret == NULL_OFF {
                    let k = self.records[0].key.load(READ_ORD);
                    if k == key {
                        let t = self.records[0].ptr.load(READ_ORD);
                        if t != NULL_OFF && self.records[0].key.load(READ_ORD) == k {
                            ret = t;
                        }
                    }
                }
            }

            if self.hdr.switch_counter.load(READ_ORD) == previous {
                break;
            }
        }

        if ret != NULL_OFF {
            return LeafSearch::Hit(ret);
        }

        let sib = self.sibling();
        if sib != NULL_OFF && key >= Page::<CARD>::at(pool, sib).first_key() {
            return LeafSearch::Sibling(sib);
        }

        LeafSearch::Miss
    }

    /// Internal-page routing: the child whose subtree covers `key`, or the
    /// right sibling when the key range has moved past this page.
    pub(crate) fn route(&self, pool: &PmPool, key: i64) -> u64 {
        debug_assert!(!self.is_leaf());
        let mut ret;

        loop {
            let previous = self.hdr.switch_counter.load(READ_ORD);
            ret = NULL_OFF;

            if Self::is_forward(previous) {
                if key < self.records[0].key.load(READ_ORD) {
                    let t = self.hdr.leftmost.load(READ_ORD);
                    if t != self.records[0].ptr.load(READ_ORD) {
                        ret = t;
                    }
                }

                if ret == NULL_OFF {
                    let mut i = 1;
                    while i < CARD && self.records[i].ptr.load(READ_ORD) != NULL_OFF {
                        if key < self.records[i].key.load(READ_ORD) {
                            let t = self.records[i - 1].ptr.load(READ_ORD);
                            if t != self.records[i].ptr.load(READ_ORD) {
                                ret = t;
                                break;
                            }
                        }
                        i += 1;
                    }

                    if ret == NULL_OFF {
                        // Key is beyond every separator: rightmost child.
                        ret = self.records[i - 1].ptr.load(READ_ORD);
                    }
                }
            } else {
                let mut i = self.count() as isize - 1;
                while i >= 0 {
                    let slot = i as usize;
                    if key >= self.records[slot].key.load(READ_ORD) {
                        let t = self.records[slot].ptr.load(READ_ORD);
                        let prev_ptr = if slot == 0 {
                            self.hdr.leftmost.load(READ_ORD)
                        } else {
                            self.records[slot - 1].ptr.load(READ_ORD)
                        };
                        if prev_ptr != t {
                            ret = t;
                            break;
                        }
                    }
                    i -= 1;
                }
            }

            if self.hdr.switch_counter.load(READ_ORD) == previous {
                break;
            }
        }

        let sib = self.sibling();
        if sib != NULL_OFF && key >= Page::<CARD>::at(pool, sib).first_key() {
            return sib;
        }

        if ret != NULL_OFF {
            ret
        } else {
            self.hdr.leftmost.load(READ_ORD)
        }
    }

    // ========================================================================
    //  Range scan
    // ========================================================================

    /// Collect values for keys in `(min, max)` from this leaf rightward.
    ///
    /// Fills `out` in sibling-chain order, stopping at `max`, the end of the
    /// chain, or a full buffer. Returns the number of values written.
    pub(crate) fn search_range(
        &self,
        pool: &PmPool,
        min: i64,
        max: i64,
        out: &mut [u64],
    ) -> usize {
        let mut current = self;
        let mut off = 0usize;

        loop {
            let old_off = off;
            loop {
                let previous = current.hdr.switch_counter.load(READ_ORD);
                off = old_off;

                if Self::is_forward(previous) {
                    let k = current.records[0].key.load(READ_ORD);
                    if k > min {
                        if k < max {
                            let t = current.records[0].ptr.load(READ_ORD);
                            if t != NULL_OFF && current.records[0].key.load(READ_ORD) == k {
                                if off == out.len() {
                                    return off;
                                }
                                out[off] = t;
                                off += 1;
                            }
                        } else {
                            return off;
                        }
                    }

                    let mut i = 1;
                    while i < CARD && current.records[i].ptr.load(READ_ORD) != NULL_OFF {
                        let k = current.records[i].key.load(READ_ORD);
                        if k > min {
                            if k < max {
                                let t = current.records[i].ptr.load(READ_ORD);
                                if t != current.records[i - 1].ptr.load(READ_ORD)
                                    && current.records[i].key.load(READ_ORD) == k
                                    && t != NULL_OFF
                                {
                                    if off == out.len() {
                                        return off;
                                    }
                                    out[off] = t;
                                    off += 1;
                                }
                            } else {
                                return off;
                            }
                        }
                        i += 1;
                    }
                } else {
                    let mut i = current.count() as isize - 1;
                    while i > 0 {
                        let slot = i as usize;
                        let k = current.records[slot].key.load(READ_ORD);
                        if k > min {
                            if k < max {
                                let t = current.records[slot].ptr.load(READ_ORD);
                                if t != current.records[slot - 1].ptr.load(READ_ORD)
                                    && current.records[slot].key.load(READ_ORD) == k
                                    && t != NULL_OFF
                                {
                                    if off == out.len() {
                                        return off;
                                    }
                                    out[off] = t;
                                    off += 1;
                                }
                            } else {
                                return off;
                            }
                        }
                        i -= 1;
                    }

                    let k = current.records[0].key.load(READ_ORD);
                    if k > min {
                        if k < max {
                            let t = current.records[0].ptr.load(READ_ORD);
                            if t != NULL_OFF && current.records[0].key.load(READ_ORD) == k {
                                if off == out.len() {
                                    return off;
                                }
                                out[off] = t;
                                off += 1;
                            }
                        } else {
                            return off;
                        }
                    }
                }

                if current.hdr.switch_counter.load(READ_ORD) == previous {
                    break;
                }
            }

            let sib = current.sibling();
            if sib == NULL_OFF {
                return off;
            }
            current = Page::<CARD>::at(pool, sib);
        }
    }

    // ========================================================================
    //  Invariant checker
    // ========================================================================

    /// Verify local page invariants; panics with details on violation.
    ///
    /// Quiescent-state only: the sorted-prefix check is meaningless while a
    /// writer is mid-shift.
    pub(crate) fn assert_local_invariants(&self) {
        let n = self.count();
        assert!(n < CARD, "live count {n} leaves no room for the sentinel");

        for i in 1..n {
            let prev = self.records[i - 1].key.load(RELAXED);
            let curr = self.records[i].key.load(RELAXED);
            assert!(
                prev <= curr,
                "records out of order at slot {i}: {prev} > {curr} (level {})",
                self.level()
            );
        }

        if n < CARD {
            assert_eq!(
                self.records[n].ptr.load(RELAXED),
                NULL_OFF,
                "missing sentinel after {n} entries"
            );
        }
    }
}

// ============================================================================
//  Size assertions
// ============================================================================

const _: () = {
    assert!(size_of::<Page<DEFAULT_CARDINALITY>>() == PAGE_SIZE);
    assert!(align_of::<Page<DEFAULT_CARDINALITY>>() == 64);
    assert!(DEFAULT_CARDINALITY == 28);
};

// ============================================================================
//  Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// A page on the heap: zeroed media is a valid empty page.
    fn heap_page<const CARD: usize>() -> Box<Page<CARD>> {
        // SAFETY: all-zero bytes are a valid Page (atomics of zero), matching
        // what a fresh pool allocation holds.
        let page: Box<Page<CARD>> = unsafe { Box::new(std::mem::zeroed()) };
        page.init(0);
        page
    }

    fn keys_of<const CARD: usize>(page: &Page<CARD>) -> Vec<i64> {
        (0..page.count())
            .map(|i| page.records[i].key.load(RELAXED))
            .collect()
    }

    #[test]
    fn test_fresh_page_is_empty() {
        let page = heap_page::<8>();
        assert_eq!(page.count(), 0);
        assert_eq!(page.hdr.last_index.load(RELAXED), -1);
        assert!(page.is_leaf());
    }

    #[test]
    fn test_insert_key_sorted_ascending() {
        let page = heap_page::<8>();
        let mut n = 0;
        for (i, key) in [30i64, 10, 20, 40].into_iter().enumerate() {
            n = page.insert_key(key, 100 + i as u64, n, true);
        }

        assert_eq!(n, 4);
        assert_eq!(page.count(), 4);
        assert_eq!(keys_of(&page), vec![10, 20, 30, 40]);
        page.assert_local_invariants();
    }

    #[test]
    fn test_insert_key_smallest_goes_to_slot_zero() {
        let page = heap_page::<8>();
        let mut n = 0;
        n = page.insert_key(50, 1, n, true);
        n = page.insert_key(5, 2, n, true);
        assert_eq!(n, 2);

        assert_eq!(page.records[0].key.load(RELAXED), 5);
        assert_eq!(page.records[0].ptr.load(RELAXED), 2);
        page.assert_local_invariants();
    }

    #[test]
    fn test_sentinel_follows_insertions() {
        let page = heap_page::<8>();
        let mut n = 0;
        for key in 0..5i64 {
            n = page.insert_key(key, (key + 1) as u64, n, true);
        }

        assert_eq!(page.records[5].ptr.load(RELAXED), NULL_OFF);
        assert_eq!(page.hdr.last_index.load(RELAXED), 4);
    }

    #[test]
    fn test_insert_sets_forward_parity() {
        let page = heap_page::<8>();
        // Force backward parity first.
        page.hdr.switch_counter.store(3, WRITE_ORD);

        page.insert_key(1, 1, 0, true);
        let c = page.hdr.switch_counter.load(RELAXED);
        assert!(Page::<8>::is_forward(c));
    }

    #[test]
    fn test_remove_key_closes_gap() {
        let page = heap_page::<8>();
        let mut n = 0;
        for key in [10i64, 20, 30, 40] {
            n = page.insert_key(key, key as u64, n, true);
        }

        assert!(page.remove_key(20));
        assert_eq!(page.count(), 3);
        assert_eq!(keys_of(&page), vec![10, 30, 40]);
        assert_eq!(page.records[3].ptr.load(RELAXED), NULL_OFF);
        page.assert_local_invariants();
    }

    #[test]
    fn test_remove_key_first_and_last() {
        let page = heap_page::<8>();
        let mut n = 0;
        for key in [1i64, 2, 3] {
            n = page.insert_key(key, key as u64, n, true);
        }

        assert!(page.remove_key(1));
        assert_eq!(keys_of(&page), vec![2, 3]);

        assert!(page.remove_key(3));
        assert_eq!(keys_of(&page), vec![2]);
        page.assert_local_invariants();
    }

    #[test]
    fn test_remove_key_missing_returns_false() {
        let page = heap_page::<8>();
        page.insert_key(10, 10, 0, true);
        assert!(!page.remove_key(99));
        assert_eq!(page.count(), 1);
    }

    #[test]
    fn test_remove_sets_backward_parity() {
        let page = heap_page::<8>();
        page.insert_key(10, 10, 0, true);
        let before = page.hdr.switch_counter.load(RELAXED);
        assert!(Page::<8>::is_forward(before));

        page.remove_key(10);
        let after = page.hdr.switch_counter.load(RELAXED);
        assert!(!Page::<8>::is_forward(after));
    }

    #[test]
    fn test_count_during_backward_parity() {
        let page = heap_page::<8>();
        let mut n = 0;
        for key in [1i64, 2, 3, 4] {
            n = page.insert_key(key, key as u64, n, true);
        }
        page.remove_key(2);

        // Counter is now odd; count() must still agree.
        assert_eq!(page.count(), 3);
    }

    #[test]
    fn test_fill_to_capacity() {
        const CARD: usize = 8;
        let page = heap_page::<CARD>();
        let mut n = 0;
        for key in 0..(CARD as i64 - 1) {
            n = page.insert_key(key, (key + 1) as u64, n, true);
        }

        assert_eq!(page.count(), CARD - 1);
        page.assert_local_invariants();
    }

    #[test]
    fn test_duplicate_keys_both_present() {
        let page = heap_page::<8>();
        let mut n = 0;
        n = page.insert_key(7, 1, n, true);
        n = page.insert_key(7, 2, n, true);
        assert_eq!(n, 2);
        assert_eq!(keys_of(&page), vec![7, 7]);
    }

    #[test]
    fn test_default_cardinality_layout() {
        assert_eq!(DEFAULT_CARDINALITY, 28);
        assert_eq!(size_of::<Page<DEFAULT_CARDINALITY>>(), PAGE_SIZE);
        assert_eq!(size_of::<Page<8>>(), HEADER_SIZE + 8 * ENTRY_SIZE);
    }
}
