//! Spin lock for short critical sections.
//!
//! The lock never parks the calling thread, so it can be taken from contexts
//! where blocking is forbidden. Critical sections guarded by it must stay
//! short and must not allocate from a pool that may block.

use core::hint;
use core::sync::atomic::{AtomicBool, Ordering};

/// Test-and-test-and-set lock word.
#[derive(Debug)]
pub struct RawSpinLock {
    locked: AtomicBool,
}

unsafe impl lock_api::RawMutex for RawSpinLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = RawSpinLock {
        locked: AtomicBool::new(false),
    };

    type GuardMarker = lock_api::GuardSend;

    #[inline]
    fn lock(&self) {
        while !self.try_lock() {
            // Spin on a plain load so waiters don't bounce the cache line.
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// Non-reentrant mutual exclusion over `T`. Taking it twice on one thread
/// spins forever.
pub type SpinLock<T> = lock_api::Mutex<RawSpinLock, T>;

pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinLock, T>;

pub type MappedSpinLockGuard<'a, T> = lock_api::MappedMutexGuard<'a, RawSpinLock, T>;

#[cfg(test)]
mod tests {
    use super::SpinLock;
    use std::thread;

    #[test]
    fn lock_and_unlock() {
        let l = SpinLock::new(1);
        {
            let mut g = l.lock();
            *g += 1;
            assert!(l.is_locked());
            assert!(l.try_lock().is_none());
        }
        assert!(!l.is_locked());
        assert_eq!(*l.lock(), 2);
    }

    /// Invariant: increments from many threads are never lost.
    #[test]
    fn contended_counter() {
        let l = SpinLock::new(0usize);
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        *l.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(l.into_inner(), 40_000);
    }
}
