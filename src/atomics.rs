//! Atomic primitives the rest of the runtime is built on.
//!
//! This is the "Atomics" component: compare-and-swap booleans and a small
//! spinlock built from one, plus the monotonic `Clock` used to arbitrate
//! commit validity (see [`crate::commit`]). Everything here is a thin,
//! safe wrapper around `std::sync::atomic` -- the platform capability the
//! rest of the runtime assumes.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A compare-and-swap boolean, named to match the reference runtime's
/// `PICC_AtomicBoolean` (see `atomic.c` in the original source).
#[derive(Debug, Default)]
pub struct AtomicFlag(AtomicBool);

impl AtomicFlag {
    pub const fn new(value: bool) -> Self {
        AtomicFlag(AtomicBool::new(value))
    }

    /// Sets the value to `new` if the current value equals `expected`,
    /// returning the value that was actually there before the attempt.
    #[inline]
    pub fn compare_and_swap(&self, expected: bool, new: bool) -> bool {
        match self
            .0
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(old) => old,
            Err(old) => old,
        }
    }

    #[inline]
    pub fn load(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, value: bool) {
        self.0.store(value, Ordering::Release)
    }
}

/// A spinlock guarding one value with a test-and-set `AtomicFlag`.
///
/// Used for `Channel::lock`: brief, strictly local to commit-queue
/// manipulation, never held across a blocking wait -- a thread never parks
/// or blocks on anything else while holding it.
pub struct SpinLock<T> {
    flag: AtomicFlag,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is only ever granted through a guard obtained
// while `flag` is held, so concurrent access is serialized by the CAS loop.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        SpinLock {
            flag: AtomicFlag::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until the test-and-set succeeds.
    pub fn acquire(&self) -> SpinLockGuard<'_, T> {
        while self.flag.compare_and_swap(false, true) {
            std::hint::spin_loop();
        }
        SpinLockGuard { lock: self }
    }
}

pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.flag.store(false);
    }
}

/// A per-thread monotonically increasing clock. Every suspension increments
/// it before the thread sleeps, invalidating every commit registered before
/// that point in a single atomic step.
#[derive(Debug)]
pub struct Clock(AtomicU64);

impl Clock {
    pub fn new() -> Self {
        Clock(AtomicU64::new(0))
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidate all commits registered against the current value: bumps
    /// the clock unconditionally. Used by the owning thread when cancelling
    /// its own pending commits (e.g. a successful try on one branch of a
    /// choice invalidates the commits of every sibling branch).
    #[inline]
    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel)
    }

    /// The claim primitive: a counterpart attempts to advance this clock
    /// from `expected` to `expected + 1`. At most one claimant can win this
    /// race; the winner becomes the unique party to the rendezvous.
    #[inline]
    pub fn claim(&self, expected: u64) -> bool {
        self.0
            .compare_exchange(expected, expected + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn atomic_flag_compare_and_swap() {
        let flag = AtomicFlag::new(false);
        assert_eq!(flag.compare_and_swap(false, true), false);
        assert!(flag.load());
        // Expected no longer matches, swap does not happen.
        assert_eq!(flag.compare_and_swap(false, true), true);
        assert!(flag.load());
    }

    #[test]
    fn spinlock_mutual_exclusion() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    *lock.acquire() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.acquire(), 8000);
    }

    #[test]
    fn clock_bump_invalidates() {
        let clock = Clock::new();
        let v0 = clock.load();
        assert!(clock.claim(v0));
        // Same value cannot be claimed twice.
        assert!(!clock.claim(v0));
    }

    #[test]
    fn clock_concurrent_claim_single_winner() {
        let clock = Arc::new(Clock::new());
        let v0 = clock.load();
        let wins: Arc<std::sync::atomic::AtomicU64> = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let clock = Arc::clone(&clock);
            let wins = Arc::clone(&wins);
            handles.push(std::thread::spawn(move || {
                if clock.claim(v0) {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }
}
