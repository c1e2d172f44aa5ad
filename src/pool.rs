//! Filepath: src/pool.rs
//!
//! Persistent memory pool: a file-backed mapping with a bump allocator.
//!
//! The pool is the allocator façade the tree builds on. It maps one file,
//! once, for the life of the process, and hands out 64-byte-aligned zeroed
//! regions identified by *offsets* into the mapping. Offsets are the
//! persistent handle format: they stay valid across reopen even when the
//! mapping lands at a different address, and offset 0 doubles as the null
//! handle throughout the crate.
//!
//! Layout on media:
//!
//! ```text
//! [ PoolHeader (64 B reserved) | root object | nodes ... ]
//! ```
//!
//! The header carries a magic, a layout version, the pool size, the offset
//! of the root object, and the bump cursor. Reopen validates the first three
//! and resumes from the stored cursor; no recovery scan is performed.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::{PmError, Result};
use crate::pmem;
use crate::trace::debug_log;

/// Pool file magic: `PMBTREE1`.
const POOL_MAGIC: u64 = u64::from_le_bytes(*b"PMBTREE1");

/// On-media layout version.
const POOL_VERSION: u32 = 1;

/// Bytes reserved for the header at the start of the pool.
const HEADER_RESERVED: u64 = 64;

/// Smallest pool worth opening: header, root object, and a few nodes.
const MIN_POOL_SIZE: u64 = 16 * 1024;

/// On-media pool header. Lives at offset 0, fits in one cache line.
#[repr(C)]
struct PoolHeader {
    magic: u64,
    version: u32,
    _pad: u32,
    size: u64,
    /// Offset of the root object, 0 until first created.
    root_off: AtomicU64,
    /// Bump cursor: offset of the next unallocated byte.
    tail: AtomicU64,
}

const _: () = assert!(size_of::<PoolHeader>() as u64 <= HEADER_RESERVED);

/// Allocation state guarded by the pool mutex.
#[derive(Default)]
struct AllocState {
    /// Volatile free list of `(offset, size)` regions, rebuilt empty on
    /// reopen. The tree never frees on its operational paths, so nothing
    /// durable is lost by keeping this in DRAM.
    free: Vec<(u64, usize)>,
}

/// Allocation counters, exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Number of regions handed out since open.
    pub allocations: u64,
    /// Number of regions returned since open.
    pub frees: u64,
    /// Bytes handed out since open.
    pub allocated_bytes: u64,
}

/// A process-wide persistent memory pool.
///
/// Open once at startup, share by `Arc`, drop at teardown. All node and
/// root-object storage for a tree comes out of one pool.
pub struct PmPool {
    /// Keeps the mapping alive; never accessed directly after open.
    _mmap: MmapMut,
    base: NonNull<u8>,
    size: u64,
    path: PathBuf,
    alloc: Mutex<AllocState>,
    allocations: AtomicU64,
    frees: AtomicU64,
    allocated_bytes: AtomicU64,
}

// SAFETY: the mapping is stable for the pool's lifetime, `base` is only
// dereferenced through atomic fields or under per-node latches, and the
// allocator state is behind a mutex.
unsafe impl Send for PmPool {}
// SAFETY: see above.
unsafe impl Sync for PmPool {}

impl PmPool {
    /// Create or open the pool described by `config`.
    ///
    /// A missing file is created at the configured size and initialized. An
    /// existing file must match the configured size and carry the expected
    /// magic and version; changing path or size requires recreation.
    ///
    /// # Errors
    /// [`PmError::PoolTooSmall`] for undersized configs, [`PmError::Io`] for
    /// file and mapping failures, [`PmError::IncompatiblePool`] when an
    /// existing file fails validation.
    pub fn open(config: &PoolConfig) -> Result<Self> {
        if config.size < MIN_POOL_SIZE {
            return Err(PmError::PoolTooSmall {
                size: config.size,
                minimum: MIN_POOL_SIZE,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&config.path)?;

        let existing = file.metadata()?.len();
        let fresh = existing == 0;

        if fresh {
            file.set_len(config.size)?;
        } else if existing != config.size {
            return Err(PmError::IncompatiblePool {
                path: config.path.clone(),
                reason: format!(
                    "file is {existing} bytes, config says {} bytes",
                    config.size
                ),
            });
        }

        // SAFETY: the file stays open (and the mapping valid) for the
        // lifetime of the returned pool; no other mapping of this file is
        // created by this process.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| {
            PmError::Io(std::io::Error::other("mapping returned null base"))
        })?;

        let pool = Self {
            _mmap: mmap,
            base,
            size: config.size,
            path: config.path.clone(),
            alloc: Mutex::new(AllocState::default()),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            allocated_bytes: AtomicU64::new(0),
        };

        if fresh {
            pool.format();
            debug_log!(path = ?pool.path, size = pool.size, "created pool");
        } else {
            pool.validate()?;
            debug_log!(path = ?pool.path, "opened existing pool");
        }

        Ok(pool)
    }

    /// Write and persist a fresh header.
    fn format(&self) {
        let raw = self.base.as_ptr().cast::<PoolHeader>();
        // SAFETY: during open no other reference to the header exists; the
        // plain fields are written exactly once, before any sharing.
        unsafe {
            (*raw).magic = POOL_MAGIC;
            (*raw).version = POOL_VERSION;
            (*raw).size = self.size;
        }

        let hdr = self.header();
        hdr.root_off.store(0, Ordering::Release);
        hdr.tail.store(HEADER_RESERVED, Ordering::Release);
        pmem::persist_obj(hdr);
    }

    fn validate(&self) -> Result<()> {
        let hdr = self.header();
        if hdr.magic != POOL_MAGIC {
            return Err(PmError::IncompatiblePool {
                path: self.path.clone(),
                reason: format!("bad magic {:#x}", hdr.magic),
            });
        }
        if hdr.version != POOL_VERSION {
            return Err(PmError::IncompatiblePool {
                path: self.path.clone(),
                reason: format!("layout version {} != {POOL_VERSION}", hdr.version),
            });
        }
        if hdr.size != self.size {
            return Err(PmError::IncompatiblePool {
                path: self.path.clone(),
                reason: format!("header size {} != file size {}", hdr.size, self.size),
            });
        }
        Ok(())
    }

    fn header(&self) -> &PoolHeader {
        // SAFETY: offset 0 holds a PoolHeader for the pool's lifetime and
        // its mutable fields are atomics.
        unsafe { &*self.base.as_ptr().cast::<PoolHeader>() }
    }

    /// Map a persistent handle to a directly addressable pointer.
    ///
    /// # Panics
    /// Debug builds panic on the null handle or an out-of-range offset.
    #[inline]
    #[must_use]
    pub fn direct(&self, off: u64) -> *mut u8 {
        debug_assert!(off != 0, "direct() on null handle");
        debug_assert!(off < self.size, "offset {off} beyond pool size {}", self.size);
        // SAFETY: off < size, checked above in debug; callers only present
        // handles produced by this pool.
        unsafe { self.base.as_ptr().add(off as usize) }
    }

    /// Map an address inside the pool back to its persistent handle.
    #[inline]
    #[must_use]
    pub fn offset_of(&self, addr: *const u8) -> u64 {
        let base = self.base.as_ptr() as usize;
        let addr = addr as usize;
        debug_assert!(addr >= base && addr < base + self.size as usize);
        (addr - base) as u64
    }

    /// Allocate a zero-initialized, 64-byte-aligned region.
    ///
    /// Fresh regions come from the bump cursor and are already zero; recycled
    /// regions are re-zeroed and persisted before they are handed out. The
    /// cursor is persisted after every bump, so a crash can leak at most the
    /// region being allocated, never double-allocate it.
    ///
    /// # Errors
    /// [`PmError::PoolExhausted`] when the pool is full.
    pub fn allocate_zeroed(&self, size: usize) -> Result<u64> {
        let mut state = self.alloc.lock();

        if let Some(pos) = state.free.iter().position(|&(_, s)| s == size) {
            let (off, _) = state.free.swap_remove(pos);
            drop(state);

            let addr = self.direct(off);
            // SAFETY: the region [off, off+size) was previously allocated at
            // this size and is not referenced by any live node.
            unsafe {
                std::ptr::write_bytes(addr, 0, size);
            }
            pmem::persist(addr, size);

            self.allocations.fetch_add(1, Ordering::Relaxed);
            self.allocated_bytes
                .fetch_add(size as u64, Ordering::Relaxed);
            return Ok(off);
        }

        let hdr = self.header();
        let tail = hdr.tail.load(Ordering::Relaxed);
        let off = tail.next_multiple_of(pmem::CACHE_LINE_SIZE as u64);
        let new_tail = off + size as u64;

        if new_tail > self.size {
            return Err(PmError::PoolExhausted {
                requested: size,
                available: self.size.saturating_sub(off),
            });
        }

        hdr.tail.store(new_tail, Ordering::Release);
        pmem::persist_obj(&hdr.tail);
        drop(state);

        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.allocated_bytes
            .fetch_add(size as u64, Ordering::Relaxed);
        Ok(off)
    }

    /// Return a region to the pool.
    ///
    /// The region joins a volatile free list and may be reissued (re-zeroed)
    /// by a later allocation in this process. The list is rebuilt empty on
    /// reopen; a region freed but never reused is leaked until the pool is
    /// recreated.
    pub fn free(&self, off: u64, size: usize) {
        debug_assert!(off != 0, "free() on null handle");
        self.alloc.lock().free.push((off, size));
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Fetch the pool's persistent root slot, creating it on first open.
    ///
    /// The slot is `size` bytes, zeroed at creation; its offset is stored in
    /// the pool header, so every reopen returns the same slot.
    ///
    /// # Errors
    /// [`PmError::PoolExhausted`] if a fresh pool cannot fit the slot.
    pub fn root_object(&self, size: usize) -> Result<u64> {
        let hdr = self.header();
        let existing = hdr.root_off.load(Ordering::Acquire);
        if existing != 0 {
            return Ok(existing);
        }

        let off = self.allocate_zeroed(size)?;
        hdr.root_off.store(off, Ordering::Release);
        pmem::persist_obj(&hdr.root_off);
        Ok(off)
    }

    /// Ensure `[addr, addr + len)` is in the persistence domain.
    #[inline]
    pub fn persist(&self, addr: *const u8, len: usize) {
        pmem::persist(addr, len);
    }

    /// Allocation counters since open.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            allocated_bytes: self.allocated_bytes.load(Ordering::Relaxed),
        }
    }

    /// Total pool size in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl std::fmt::Debug for PmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmPool")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_pool(size: u64) -> (tempfile::TempDir, PmPool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = PoolConfig::new(dir.path().join("test.pool")).with_size(size);
        let pool = PmPool::open(&cfg).expect("open pool");
        (dir, pool)
    }

    #[test]
    fn test_open_fresh_pool() {
        let (_dir, pool) = temp_pool(MIN_POOL_SIZE);
        assert_eq!(pool.size(), MIN_POOL_SIZE);
        assert_eq!(pool.stats().allocations, 0);
    }

    #[test]
    fn test_too_small_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = PoolConfig::new(dir.path().join("tiny.pool")).with_size(512);
        assert!(matches!(
            PmPool::open(&cfg),
            Err(PmError::PoolTooSmall { .. })
        ));
    }

    #[test]
    fn test_allocate_is_aligned_and_zeroed() {
        let (_dir, pool) = temp_pool(MIN_POOL_SIZE);

        let off = pool.allocate_zeroed(512).expect("alloc");
        assert_eq!(off % 64, 0);
        assert_ne!(off, 0);

        let addr = pool.direct(off);
        // SAFETY: freshly allocated 512-byte region.
        let bytes = unsafe { std::slice::from_raw_parts(addr, 512) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exhaustion() {
        let (_dir, pool) = temp_pool(MIN_POOL_SIZE);

        let mut last = Ok(0);
        for _ in 0..(MIN_POOL_SIZE / 512 + 2) {
            last = pool.allocate_zeroed(512);
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(PmError::PoolExhausted { .. })));
    }

    #[test]
    fn test_free_then_reuse_rezeroes() {
        let (_dir, pool) = temp_pool(MIN_POOL_SIZE);

        let off = pool.allocate_zeroed(512).expect("alloc");
        let addr = pool.direct(off);
        // SAFETY: region is ours; scribble then free.
        unsafe {
            std::ptr::write_bytes(addr, 0xAB, 512);
        }
        pool.free(off, 512);

        let again = pool.allocate_zeroed(512).expect("realloc");
        assert_eq!(again, off);
        // SAFETY: freshly reissued region.
        let bytes = unsafe { std::slice::from_raw_parts(pool.direct(again), 512) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(pool.stats().frees, 1);
    }

    #[test]
    fn test_root_object_is_stable() {
        let (_dir, pool) = temp_pool(MIN_POOL_SIZE);

        let first = pool.root_object(64).expect("root object");
        let second = pool.root_object(64).expect("root object again");
        assert_eq!(first, second);
    }

    #[test]
    fn test_reopen_preserves_root_and_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = PoolConfig::new(dir.path().join("persist.pool")).with_size(MIN_POOL_SIZE);

        let (root, node, tail_probe) = {
            let pool = PmPool::open(&cfg).expect("open");
            let root = pool.root_object(64).expect("root");
            let node = pool.allocate_zeroed(512).expect("node");
            // SAFETY: region is ours.
            unsafe {
                *pool.direct(node) = 0x42;
            }
            pool.persist(pool.direct(node), 1);
            (root, node, pool.allocate_zeroed(512).expect("probe"))
        };

        let pool = PmPool::open(&cfg).expect("reopen");
        assert_eq!(pool.root_object(64).expect("root after reopen"), root);

        // SAFETY: node offset is still valid and was persisted.
        assert_eq!(unsafe { *pool.direct(node) }, 0x42);

        // The cursor resumed past everything handed out before reopen.
        let fresh = pool.allocate_zeroed(512).expect("fresh alloc");
        assert!(fresh > tail_probe);
    }

    #[test]
    fn test_reopen_size_mismatch_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("size.pool");

        let cfg = PoolConfig::new(&path).with_size(MIN_POOL_SIZE);
        drop(PmPool::open(&cfg).expect("create"));

        let bigger = PoolConfig::new(&path).with_size(MIN_POOL_SIZE * 2);
        assert!(matches!(
            PmPool::open(&bigger),
            Err(PmError::IncompatiblePool { .. })
        ));
    }

    #[test]
    fn test_concurrent_allocation_is_disjoint() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let (_dir, pool) = temp_pool(1024 * 1024);
        let pool = Arc::new(pool);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| pool.allocate_zeroed(512).expect("alloc"))
                        .collect::<Vec<u64>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for off in h.join().expect("alloc thread") {
                assert!(seen.insert(off), "offset {off} handed out twice");
            }
        }
    }
}
