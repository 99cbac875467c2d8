//! Per-CPU pointers.
//!
//! Each core carries a [`PerCpu`] block reachable through its GS base;
//! `current_cpu_id` reads the id field through `GS:` so the hot paths
//! (scheduler, TXU, dispatch) never touch a shared table. The block is
//! `#[repr(C)]` because the assembly entry stubs index it by fixed
//! offsets:
//!
//! - offset 0: `self_ptr`
//! - offset 8: `kernel_rsp`
//! - offset 16: `cpu_id`
//! - offset 20: `apic_id`
//!
//! On hosts the GS machinery does not exist and the registered CPU-id
//! function simply reports the BSP.

use core::sync::atomic::{AtomicU32, Ordering};

use quark_core::cpu_local::set_cpu_id_fn;
use quark_core::id::CpuId;

/// Per-core state block, pointed to by the core's GS base.
#[repr(C)]
pub struct PerCpu {
    /// Self-pointer, for the `GS:[0]` access pattern.
    pub self_ptr: u64,
    /// Kernel stack pointer loaded on privilege transitions.
    pub kernel_rsp: u64,
    /// Logical CPU id.
    pub cpu_id: AtomicU32,
    /// Local APIC id.
    pub apic_id: AtomicU32,
}

impl PerCpu {
    /// Creates an uninitialized block.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            self_ptr: 0,
            kernel_rsp: 0,
            cpu_id: AtomicU32::new(0),
            apic_id: AtomicU32::new(0),
        }
    }

    /// Fills in the identity fields.
    pub fn init(&self, cpu: CpuId, apic_id: u32) {
        self.cpu_id.store(cpu.as_u32(), Ordering::Release);
        self.apic_id.store(apic_id, Ordering::Release);
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads the executing core's id from its per-CPU block.
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
fn gs_cpu_id() -> u32 {
    // SAFETY: GS:[16] is the cpu_id field of the PerCpu block, set up
    // before this function is registered.
    unsafe {
        let id: u32;
        core::arch::asm!("mov {:e}, gs:[16]", out(reg) id, options(readonly, nostack));
        id
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
fn gs_cpu_id() -> u32 {
    0
}

/// Registers the per-CPU id reader with the core crate. Called once on
/// the BSP after its GS base is programmed; APs inherit the function.
pub fn install_cpu_id_reader() {
    set_cpu_id_fn(gs_cpu_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_stores_identity() {
        let percpu = PerCpu::new();
        percpu.init(CpuId::new(3), 6);
        assert_eq!(percpu.cpu_id.load(Ordering::Acquire), 3);
        assert_eq!(percpu.apic_id.load(Ordering::Acquire), 6);
    }

    #[test]
    fn layout_offsets_match_the_stub_contract() {
        assert_eq!(core::mem::offset_of!(PerCpu, self_ptr), 0);
        assert_eq!(core::mem::offset_of!(PerCpu, kernel_rsp), 8);
        assert_eq!(core::mem::offset_of!(PerCpu, cpu_id), 16);
        assert_eq!(core::mem::offset_of!(PerCpu, apic_id), 20);
    }
}
