//! Filepath: src/pmem.rs
//!
//! Persistence primitives: store fences and cache-line writeback.
//!
//! Everything durable in this crate funnels through [`persist`]: a store
//! fence, one cache-line flush per line overlapping the range, and a closing
//! store fence. On x86_64 these compile to `sfence`/`clflush`. On other
//! targets the flushes degrade to ordering-only fences, which keeps the
//! crate testable there but provides no persistence domain.
//!
//! [`entry_needs_flush`] is the boundary predicate that makes shift-based
//! insertion cheap: a shifted entry is flushed only when its write completed
//! a cache line, so shifting N entries issues one flush per dirtied line
//! rather than one per store.

/// Size of one cache line on every platform this crate targets.
pub const CACHE_LINE_SIZE: usize = 64;

/// Issue a store fence: all prior stores complete before subsequent stores.
#[inline]
pub fn sfence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: `_mm_sfence` has no preconditions; SSE2 is baseline on x86_64.
    unsafe {
        core::arch::x86_64::_mm_sfence();
    }

    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Write back the cache line containing `addr`. No fences.
#[inline]
pub fn flush_line(addr: *const u8) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: `addr` points into the mapped pool; clflush on any mapped
    // address is well-defined and SSE2 is baseline on x86_64.
    unsafe {
        core::arch::x86_64::_mm_clflush(addr);
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

/// Ensure every cache line touched by `[addr, addr + len)` reaches the
/// persistence domain before any subsequent store.
///
/// Fence, per-line flush, fence. The leading fence orders the just-issued
/// stores ahead of the flushes; the trailing fence orders the flushes ahead
/// of whatever publication store follows.
#[inline]
pub fn persist(addr: *const u8, len: usize) {
    sfence();

    let start = addr as usize & !(CACHE_LINE_SIZE - 1);
    let end = addr as usize + len;
    let mut line = start;
    while line < end {
        flush_line(line as *const u8);
        line += CACHE_LINE_SIZE;
    }

    sfence();
}

/// [`persist`] for a whole object.
#[inline]
pub fn persist_obj<T>(obj: &T) {
    persist(std::ptr::from_ref(obj).cast::<u8>(), size_of::<T>());
}

/// Whether a just-written entry at `addr` must be flushed now.
///
/// True when the entry begins a cache line, or when it ends exactly at or
/// runs into the next line boundary with a nonzero tail. Entries that sit
/// strictly inside a line are picked up by the flush of a later entry that
/// completes the line.
#[inline]
#[must_use]
pub fn entry_needs_flush(addr: usize, entry_size: usize) -> bool {
    let remainder = addr % CACHE_LINE_SIZE;
    remainder == 0
        || ((remainder + entry_size) / CACHE_LINE_SIZE == 1
            && (remainder + entry_size) % CACHE_LINE_SIZE != 0)
}
