//! Filepath: src/latch.rs
//!
//! Per-node writer latch.
//!
//! A [`Latch`] is a spinlock word embedded in each page header. Writers
//! acquire it for every mutation; readers never touch it and reconcile with
//! writers through the page's switch counter instead.
//!
//! The latch word lives in persistent memory with the rest of the header but
//! its state is volatile in meaning: it is never flushed, and a fresh pool
//! starts with every latch word zeroed.
//!
//! # Type-State Pattern
//! [`LatchGuard`] is proof that the latch is held. It releases on drop,
//! including during unwinding, and cannot cross threads.
//!
//! ```rust,ignore
//! let guard = page.hdr.latch.lock();
//! // mutate the page
//! // latch released when guard drops
//! ```

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

/// Spins before the lock loop starts yielding the CPU.
const SPIN_LIMIT: u32 = 6;

/// Backoff rounds before falling back to `yield_now`.
const YIELD_LIMIT: u32 = 10;

/// A spinlock with bounded backoff, one per page.
#[derive(Debug)]
#[repr(transparent)]
pub struct Latch {
    state: AtomicU32,
}

/// Proof that a [`Latch`] is held.
///
/// Releases the latch on drop, even during a panic. `!Send`/`!Sync` via
/// `PhantomData<*mut ()>` so a guard cannot cross thread boundaries.
#[derive(Debug)]
#[must_use = "releasing a latch without using the guard is a logic error"]
pub struct LatchGuard<'a> {
    latch: &'a Latch,
    _marker: PhantomData<*mut ()>,
}

impl Drop for LatchGuard<'_> {
    fn drop(&mut self) {
        self.latch.state.store(0, Ordering::Release);
    }
}

impl Latch {
    /// A new unlocked latch.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(0),
        }
    }

    /// Acquire the latch, spinning with bounded backoff.
    ///
    /// The critical sections this guards are short and cache-local (a page
    /// shift plus a handful of flushes), so the loop spins briefly with
    /// exponential `spin_loop` rounds and only then starts yielding.
    pub fn lock(&self) -> LatchGuard<'_> {
        let mut backoff: u32 = 0;
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }

            // Wait for the holder to release before re-attempting the CAS,
            // so the line is not bounced while contended.
            while self.state.load(Ordering::Relaxed) != 0 {
                if backoff <= SPIN_LIMIT {
                    for _ in 0..(1 << backoff) {
                        std::hint::spin_loop();
                    }
                    backoff += 1;
                } else if backoff <= YIELD_LIMIT {
                    std::thread::yield_now();
                    backoff += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Try to acquire the latch without blocking.
    #[must_use]
    pub fn try_lock(&self) -> Option<LatchGuard<'_>> {
        if self
            .state
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(LatchGuard {
                latch: self,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Whether the latch is currently held.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) != 0
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock_roundtrip() {
        let latch = Latch::new();
        assert!(!latch.is_locked());

        {
            let _guard = latch.lock();
            assert!(latch.is_locked());
        }

        assert!(!latch.is_locked());
    }

    #[test]
    fn test_try_lock_contended() {
        let latch = Latch::new();

        let guard = latch.try_lock();
        assert!(guard.is_some());
        assert!(latch.try_lock().is_none());

        drop(guard);
        assert!(latch.try_lock().is_some());
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let latch = Arc::new(Latch::new());
        let inner = Arc::clone(&latch);

        let result = thread::spawn(move || {
            let _guard = inner.lock();
            panic!("poisoned on purpose");
        })
        .join();

        assert!(result.is_err());
        assert!(!latch.is_locked());
    }

    #[test]
    fn test_mutual_exclusion() {
        const THREADS: usize = 8;
        const OPS: usize = 10_000;

        let latch = Arc::new(Latch::new());
        let counter = Arc::new(std::cell::UnsafeCell::new(0u64));

        struct SharedCell(Arc<std::cell::UnsafeCell<u64>>);
        // SAFETY: all access to the cell happens under the latch.
        unsafe impl Send for SharedCell {}

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let cell = SharedCell(Arc::clone(&counter));
                thread::spawn(move || {
                    let cell = cell;
                    for _ in 0..OPS {
                        let _guard = latch.lock();
                        // SAFETY: the latch serializes these writes.
                        unsafe {
                            *cell.0.get() += 1;
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().expect("latch thread panicked");
        }

        let _guard = latch.lock();
        // SAFETY: the latch is held.
        assert_eq!(unsafe { *counter.get() }, (THREADS * OPS) as u64);
    }
}
