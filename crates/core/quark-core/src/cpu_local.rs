//! Per-CPU storage.
//!
//! [`CpuLocal`] wraps a `[T; MAX_CPUS]` indexed by the current CPU id.
//! The id itself comes from a registered function: the kernel installs
//! its GS-based reader during per-core bring-up, host tests install a
//! thread-local mapping, and before either registration every caller is
//! treated as CPU 0 (true on the boot core).

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::id::CpuId;

/// Maximum supported CPUs.
pub const MAX_CPUS: usize = 64;

static CPU_ID_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Registers the function that reports the executing CPU's id.
pub fn set_cpu_id_fn(f: fn() -> u32) {
    CPU_ID_FN.store(f as *mut (), Ordering::Release);
}

/// Returns the executing CPU's id. CPU 0 before registration.
#[inline]
#[must_use]
pub fn current_cpu() -> CpuId {
    let ptr = CPU_ID_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return CpuId::BSP;
    }
    // SAFETY: The pointer was stored via `set_cpu_id_fn` from a valid fn.
    let f: fn() -> u32 = unsafe { core::mem::transmute(ptr) };
    CpuId::new(f())
}

/// Returns the number of online CPUs.
#[must_use]
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Sets the number of online CPUs. Called as cores come up.
pub fn set_cpu_count(count: u32) {
    debug_assert!(count as usize <= MAX_CPUS);
    CPU_COUNT.store(count, Ordering::Release);
}

/// Per-CPU storage. Wraps `[T; MAX_CPUS]`, indexed by current CPU id.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    /// Creates a new `CpuLocal` wrapping the given array.
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    /// Returns a reference to the current CPU's instance.
    ///
    /// Falls back to CPU 0's slot if the registered id function reports
    /// an out-of-range id, preventing an out-of-bounds panic during
    /// early AP bring-up.
    pub fn get(&self) -> &T {
        let id = current_cpu().as_usize();
        if id < MAX_CPUS {
            &self.data[id]
        } else {
            &self.data[0]
        }
    }

    /// Returns a reference to a specific CPU's instance.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    pub fn get_for(&self, cpu: CpuId) -> &T {
        &self.data[cpu.as_usize()]
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access. Send/Sync are safe
// because each CPU only accesses its own slot.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}
