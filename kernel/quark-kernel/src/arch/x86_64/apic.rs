//! Local APIC access.
//!
//! All register access is volatile through the permanent kernel
//! mapping of the APIC page. The shutdown path follows the canonical
//! sequence: mask every LVT entry in place, then overwrite each with
//! the bare masked value (deasserting whatever the old vector bits
//! held), then clear the error status register — masking strictly
//! before deasserting, ESR last.

use quark_core::id::{CpuId, IrqLine};
use quark_core::status::OsResult;
use quark_core::addr::VirtAddr;

use super::{mmio_read32, mmio_write32};

// Register offsets.
const REG_ID: u64 = 0x020;
const REG_TPR: u64 = 0x080;
const REG_EOI: u64 = 0x0B0;
const REG_SVR: u64 = 0x0F0;
const REG_ESR: u64 = 0x280;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_LVT_LINT0: u64 = 0x350;
const REG_LVT_LINT1: u64 = 0x360;
const REG_LVT_ERROR: u64 = 0x370;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;
/// LVT mask bit.
const LVT_MASKED: u32 = 1 << 16;
/// Timer periodic mode.
const TIMER_PERIODIC: u32 = 1 << 17;
/// ICR delivery-pending bit.
const ICR_PENDING: u32 = 1 << 12;

/// The executing core's local APIC, reached through the kernel mapping
/// of its register page.
pub struct LocalApic {
    base: VirtAddr,
}

impl LocalApic {
    /// Wraps a mapped APIC register page.
    ///
    /// # Safety
    ///
    /// `base` must be the kernel mapping of the local APIC's 4 KiB
    /// register page, mapped uncached.
    #[must_use]
    pub const unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    #[inline]
    fn read(&self, reg: u64) -> u32 {
        // SAFETY: Construction guarantees a mapped register page.
        unsafe { mmio_read32(self.base.as_u64() + reg) }
    }

    #[inline]
    fn write(&self, reg: u64, value: u32) {
        // SAFETY: Construction guarantees a mapped register page.
        unsafe { mmio_write32(self.base.as_u64() + reg, value) };
    }

    /// This core's APIC id.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.read(REG_ID) >> 24
    }

    /// Software-enables the APIC with `spurious_vector`.
    pub fn enable(&self, spurious_vector: u8) {
        self.write(REG_SVR, SVR_ENABLE | u32::from(spurious_vector));
    }

    /// End of interrupt.
    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Task priority.
    #[must_use]
    pub fn priority(&self) -> u32 {
        self.read(REG_TPR)
    }

    /// Sets the task priority.
    pub fn set_priority(&self, priority: u32) {
        self.write(REG_TPR, priority);
    }

    /// Starts the periodic timer at `vector`.
    pub fn start_timer(&self, vector: u8, initial_count: u32) {
        self.write(REG_TIMER_DIVIDE, 0b0011); // divide by 16
        self.write(REG_LVT_TIMER, TIMER_PERIODIC | u32::from(vector));
        self.write(REG_TIMER_INITIAL, initial_count);
    }

    /// Sends `vector` to the core with APIC id `target`.
    pub fn send_ipi(&self, target: u32, vector: u8) {
        self.write(REG_ICR_HIGH, target << 24);
        self.write(REG_ICR_LOW, u32::from(vector));
        while self.read(REG_ICR_LOW) & ICR_PENDING != 0 {
            core::hint::spin_loop();
        }
    }

    /// Takes the APIC out of service: mask, then deassert, then clear
    /// ESR. Clearing a vector field while its entry is unmasked can
    /// deliver a stray interrupt, so the mask bit goes in first and the
    /// vector bits are wiped in a second pass; the ESR write comes last
    /// (per the Pentium 3AP/11AP errata, write then read back).
    pub fn shutdown(&self) {
        let lvts = [REG_LVT_TIMER, REG_LVT_LINT0, REG_LVT_LINT1, REG_LVT_ERROR];

        // 1. Mask every local vector in place.
        for reg in lvts {
            let value = self.read(reg);
            self.write(reg, value | LVT_MASKED);
        }
        self.write(REG_TIMER_INITIAL, 0);

        // 2. Deassert: overwrite each entry with the bare masked value.
        for reg in lvts {
            self.write(reg, LVT_MASKED);
        }

        // 3. Clear the error status.
        self.write(REG_ESR, 0);
        self.read(REG_ESR);
    }
}

/// The APIC-backed implementation of the interrupt subsystem's
/// controller trait. Vector routing at the IOAPIC is delegated to the
/// platform's redirection programming.
pub struct ApicController {
    lapic: LocalApic,
    route: fn(IrqLine, usize, bool) -> OsResult,
}

impl ApicController {
    /// Builds the controller over a mapped local APIC and the IOAPIC
    /// redirection programmer.
    #[must_use]
    pub fn new(lapic: LocalApic, route: fn(IrqLine, usize, bool) -> OsResult) -> Self {
        Self { lapic, route }
    }
}

impl quark_interrupt::InterruptController for ApicController {
    fn configure(
        &self,
        descriptor: &quark_interrupt::InterruptDescriptor,
        enable: bool,
    ) -> OsResult {
        (self.route)(descriptor.source(), descriptor.table_index(), enable)
    }

    fn get_priority(&self) -> u32 {
        self.lapic.priority()
    }

    fn set_priority(&self, priority: u32) {
        self.lapic.set_priority(priority);
    }

    fn acknowledge(&self, _source: Option<IrqLine>, _table_index: usize) {
        self.lapic.eoi();
    }
}

/// Installs the wake-IPI transport for TXU. `apic_ids` maps logical
/// CPU ids to APIC ids and must live for the kernel's lifetime.
pub fn install_txu_notify(lapic_base: VirtAddr, wake_vector: u8, apic_ids: &'static [u32]) {
    use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

    static LAPIC_BASE: AtomicU64 = AtomicU64::new(0);
    static WAKE_VECTOR: AtomicU64 = AtomicU64::new(0);
    static IDS_PTR: AtomicPtr<u32> = AtomicPtr::new(core::ptr::null_mut());
    static IDS_LEN: AtomicUsize = AtomicUsize::new(0);

    LAPIC_BASE.store(lapic_base.as_u64(), Ordering::Release);
    WAKE_VECTOR.store(u64::from(wake_vector), Ordering::Release);
    IDS_PTR.store(apic_ids.as_ptr().cast_mut(), Ordering::Release);
    IDS_LEN.store(apic_ids.len(), Ordering::Release);

    fn notify(target: CpuId) {
        let base = LAPIC_BASE.load(Ordering::Acquire);
        let len = IDS_LEN.load(Ordering::Acquire);
        if base == 0 || target.as_usize() >= len {
            return;
        }
        // SAFETY: The pointer and length come from the 'static slice
        // stored above; the APIC page mapping is permanent.
        unsafe {
            let ids = core::slice::from_raw_parts(IDS_PTR.load(Ordering::Acquire), len);
            let lapic = LocalApic::new(VirtAddr::new(base));
            lapic.send_ipi(ids[target.as_usize()], WAKE_VECTOR.load(Ordering::Acquire) as u8);
        }
    }
    quark_core::txu::set_notify_fn(notify);
}
