//! x86_64 support: APIC access and TLB invalidation.

pub mod apic;
pub mod tlb;

/// Wires the architecture's reschedule entry point into the portable
/// layers: the scheduler's resched hint and the blocking mutex's yield
/// hook are the same context-switch trigger.
pub fn install_resched(resched: fn()) {
    quark_sched::set_resched_fn(resched);
    quark_core::sync::set_yield_fn(resched);
}

/// Volatile 32-bit MMIO read.
///
/// # Safety
///
/// `addr` must be a mapped, device-backed register address.
#[inline]
pub unsafe fn mmio_read32(addr: u64) -> u32 {
    // SAFETY: Caller guarantees a valid device register.
    unsafe { (addr as *const u32).read_volatile() }
}

/// Volatile 32-bit MMIO write.
///
/// # Safety
///
/// `addr` must be a mapped, device-backed register address.
#[inline]
pub unsafe fn mmio_write32(addr: u64, value: u32) {
    // SAFETY: Caller guarantees a valid device register.
    unsafe { (addr as *mut u32).write_volatile(value) };
}
