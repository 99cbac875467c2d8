//! The system tick.
//!
//! A monotonic millisecond counter driven by the platform timer. The
//! source is registered at boot (HPET or the APIC timer calibration
//! path); before registration the tick reads 0, which the scheduler
//! treats as "time not started".

use core::sync::atomic::{AtomicPtr, Ordering};

static TICK_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the function that reports milliseconds since boot.
pub fn set_tick_fn(f: fn() -> u64) {
    TICK_FN.store(f as *mut (), Ordering::Release);
}

/// Milliseconds since boot, or 0 before a source is registered.
#[inline]
#[must_use]
pub fn current_ms() -> u64 {
    let ptr = TICK_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return 0;
    }
    // SAFETY: The pointer was stored via `set_tick_fn` from a valid fn.
    let f: fn() -> u64 = unsafe { core::mem::transmute(ptr) };
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU64;

    static FAKE_MS: AtomicU64 = AtomicU64::new(0);

    fn fake_tick() -> u64 {
        FAKE_MS.load(Ordering::SeqCst)
    }

    #[test]
    fn registered_source_is_read() {
        set_tick_fn(fake_tick);
        FAKE_MS.store(1234, Ordering::SeqCst);
        assert_eq!(current_ms(), 1234);
    }
}
