//! The machine context.
//!
//! One [`Machine`] per system, created at BSP bring-up and passed (or
//! reachable) wherever kernel code used to grab a global: the physical
//! allocator, the kernel address space, the user space arena, the
//! region broker, the interrupt subsystem, the schedulers and the
//! thread manager all hang off it.

use alloc::sync::Arc;

use quark_core::handle::HandleTable;
use quark_core::id::Handle;
use quark_core::status::OsResult;
use quark_interrupt::Interrupts;
use quark_mm::phys::PhysicalMemory;
use quark_mm::region::RegionBroker;
use quark_mm::space::AddressSpace;
use quark_sched::{SchedulerSet, Threading};

use crate::boot::PhysRange;

/// The singleton system context.
pub struct Machine {
    pmem: Arc<PhysicalMemory>,
    kernel_space: Arc<AddressSpace>,
    spaces: HandleTable<Arc<AddressSpace>>,
    regions: RegionBroker,
    interrupts: Interrupts,
    scheduler: Arc<SchedulerSet>,
    threading: Arc<Threading>,
    kernel_image: PhysRange,
    ramdisk: PhysRange,
}

impl Machine {
    pub(crate) fn new(
        pmem: Arc<PhysicalMemory>,
        kernel_space: Arc<AddressSpace>,
        scheduler: Arc<SchedulerSet>,
        threading: Arc<Threading>,
        kernel_image: PhysRange,
        ramdisk: PhysRange,
    ) -> OsResult<Arc<Self>> {
        Ok(Arc::new(Self {
            pmem,
            kernel_space,
            spaces: HandleTable::new(),
            regions: RegionBroker::new(),
            interrupts: Interrupts::new(),
            scheduler,
            threading,
            kernel_image,
            ramdisk,
        }))
    }

    /// The physical memory allocator.
    #[must_use]
    pub fn pmem(&self) -> &Arc<PhysicalMemory> {
        &self.pmem
    }

    /// The singleton kernel address space.
    #[must_use]
    pub fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel_space
    }

    /// The user address-space arena.
    #[must_use]
    pub fn spaces(&self) -> &HandleTable<Arc<AddressSpace>> {
        &self.spaces
    }

    /// Resolves a memory-space handle to the space itself.
    pub fn space(&self, handle: Handle) -> OsResult<Arc<AddressSpace>> {
        Ok(self.spaces.get(handle)?.as_ref().clone())
    }

    /// The memory region broker.
    #[must_use]
    pub fn regions(&self) -> &RegionBroker {
        &self.regions
    }

    /// The interrupt subsystem.
    #[must_use]
    pub fn interrupts(&self) -> &Interrupts {
        &self.interrupts
    }

    /// The per-core schedulers.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<SchedulerSet> {
        &self.scheduler
    }

    /// The thread manager.
    #[must_use]
    pub fn threading(&self) -> &Arc<Threading> {
        &self.threading
    }

    /// Where the kernel image sits in physical memory.
    #[must_use]
    pub fn kernel_image(&self) -> PhysRange {
        self.kernel_image
    }

    /// Where the ramdisk sits in physical memory.
    #[must_use]
    pub fn ramdisk(&self) -> PhysRange {
        self.ramdisk
    }

    /// Memory pressure report: `(pages_total, pages_free)`.
    #[must_use]
    pub fn memory_usage(&self) -> (u64, u64) {
        (self.pmem.pages_total(), self.pmem.pages_free())
    }
}
