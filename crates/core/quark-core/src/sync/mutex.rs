//! Blocking mutual exclusion.
//!
//! Unlike [`SpinLock`](super::SpinLock), a [`Mutex`] may be held across
//! long critical sections (page-table walks, multi-page commits). A
//! contended acquirer spins briefly and then yields the CPU through a
//! registered hook; before the scheduler is up the hook is absent and
//! the mutex degenerates to a spin lock, which is correct on the boot
//! core.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Spins before the acquirer starts yielding.
const SPINS_BEFORE_YIELD: u32 = 100;

/// Registered yield hook. Null until the scheduler registers itself.
static YIELD_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the function used to give up the CPU while a [`Mutex`] is
/// contended. The scheduler installs its yield entry point here during
/// bring-up.
pub fn set_yield_fn(f: fn()) {
    YIELD_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn yield_now() {
    let ptr = YIELD_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        core::hint::spin_loop();
    } else {
        // SAFETY: The pointer was stored via `set_yield_fn` from a valid `fn()`.
        let f: fn() = unsafe { core::mem::transmute(ptr) };
        f();
    }
}

/// A blocking mutual exclusion lock.
pub struct Mutex<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The Mutex ensures exclusive access to `T` via atomic operations.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new unlocked `Mutex`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, yielding while contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut spins = 0u32;
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return MutexGuard { lock: self };
            }

            while self.locked.load(Ordering::Relaxed) {
                spins += 1;
                if spins >= SPINS_BEFORE_YIELD {
                    spins = 0;
                    yield_now();
                } else {
                    core::hint::spin_loop();
                }
            }
        }
    }

    /// Attempts to acquire the mutex without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { lock: self })
        } else {
            None
        }
    }
}

/// RAII guard that releases the [`Mutex`] when dropped.
pub struct MutexGuard<'a, T> {
    lock: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let mutex = Mutex::new(1);
        {
            let mut guard = mutex.lock();
            *guard = 2;
        }
        assert_eq!(*mutex.lock(), 2);
    }

    #[test]
    fn try_lock_fails_when_held() {
        let mutex = Mutex::new(());
        let _guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
    }

    #[test]
    fn contended_threads() {
        use std::sync::Arc;
        use std::thread;

        let mutex = Arc::new(Mutex::new(0u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let mutex = mutex.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        *mutex.lock() += 1;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*mutex.lock(), 2000);
    }
}
