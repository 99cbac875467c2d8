//! TLB invalidation primitives.

use quark_core::addr::VirtAddr;

/// Invalidates the TLB entry for one page on the executing core.
pub fn invlpg(va: VirtAddr) {
    // SAFETY: invlpg is always safe in kernel mode; a spurious
    // invalidation only costs a refill.
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Registers [`invlpg`] as the portable layer's flush primitive.
pub fn install() {
    quark_mm::tlb::register_flush_fn(invlpg);
}
