//! Boot-time bring-up.
//!
//! The loader hands the kernel a [`VBoot`] record: the firmware memory
//! map, the kernel image and ramdisk ranges, the platform page size and
//! an identity-mapped boot region for transient allocations. The BSP
//! turns it into the [`Machine`] context; application cores join with
//! [`ap_init`] and enable their scheduler last, exactly like the BSP.

use alloc::sync::Arc;
use alloc::vec::Vec;

use quark_core::addr::PhysAddr;
use quark_core::cpu_local::{self, MAX_CPUS};
use quark_core::id::CpuId;
use quark_core::status::{OsError, OsResult};
use quark_core::{kinfo, txu};
use quark_mm::phys::PhysicalMemory;
use quark_mm::space::{AddressSpace, MemoryLayout};
use quark_mm::{PAGE_SIZE, PhysMemoryRegion};
use quark_sched::{SchedulerSet, ThreadFlags, Threading};
use quark_core::id::Handle;

use crate::machine::Machine;

/// The platform's DMA masks, ascending: ISA (16 MiB), 32-bit devices
/// (4 GiB), everything.
pub const MEMORY_MASKS: [u64; 3] = [0x100_0000, 0x1_0000_0000, u64::MAX];

/// Classification of one firmware memory run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBootMemoryType {
    /// Free for the kernel.
    Available,
    /// Never usable.
    Reserved,
    /// ACPI tables; reclaimable after parsing.
    AcpiReclaim,
    /// Firmware-owned (runtime services).
    Firmware,
}

/// One run of the firmware memory map.
#[derive(Debug, Clone, Copy)]
pub struct VBootMemoryEntry {
    /// First physical byte.
    pub physical_base: u64,
    /// Length in bytes.
    pub length: u64,
    /// What the run is.
    pub kind: VBootMemoryType,
}

/// A physical range within the boot record.
#[derive(Debug, Clone, Copy)]
pub struct PhysRange {
    /// First byte.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
}

impl PhysRange {
    fn end(&self) -> u64 {
        self.base + self.length
    }
}

/// The record the loader passes at entry.
#[derive(Debug, Clone)]
pub struct VBoot {
    /// Firmware memory map.
    pub memory: Vec<VBootMemoryEntry>,
    /// Where the kernel image sits.
    pub kernel_image: PhysRange,
    /// Where the ramdisk sits.
    pub ramdisk: PhysRange,
    /// Platform page size.
    pub page_size: u64,
    /// Identity-mapped region for transient boot allocations.
    pub boot_region: PhysRange,
}

/// Converts the firmware map into allocator regions, withholding the
/// kernel image, the ramdisk and the boot region from the usable set.
fn build_regions(vboot: &VBoot) -> Vec<PhysMemoryRegion> {
    let withheld = [vboot.kernel_image, vboot.ramdisk, vboot.boot_region];
    let mut regions = Vec::new();

    for entry in &vboot.memory {
        if entry.kind != VBootMemoryType::Available {
            regions.push(PhysMemoryRegion {
                start: PhysAddr::new(entry.physical_base),
                size: entry.length,
                usable: false,
            });
            continue;
        }

        // Split the run around every withheld range that intersects it.
        let mut cursor = entry.physical_base;
        let end = entry.physical_base + entry.length;
        let mut cuts: Vec<&PhysRange> = withheld
            .iter()
            .filter(|r| r.length > 0 && r.base < end && r.end() > cursor)
            .collect();
        cuts.sort_by_key(|r| r.base);

        for cut in cuts {
            if cut.base > cursor {
                regions.push(PhysMemoryRegion {
                    start: PhysAddr::new(cursor),
                    size: cut.base - cursor,
                    usable: true,
                });
            }
            cursor = cursor.max(cut.end());
        }
        if cursor < end {
            regions.push(PhysMemoryRegion {
                start: PhysAddr::new(cursor),
                size: end - cursor,
                usable: true,
            });
        }
    }
    regions
}

/// BSP bring-up: memory, kernel space, brokers, schedulers, the idle
/// thread — and the scheduler gate last.
///
/// `cpu_count` comes from the platform's CPU discovery (MADT).
pub fn bsp_init(vboot: &VBoot, cpu_count: u32) -> OsResult<Arc<Machine>> {
    if vboot.page_size != PAGE_SIZE as u64 {
        return Err(OsError::NotSupported);
    }
    if cpu_count == 0 || cpu_count as usize > MAX_CPUS {
        return Err(OsError::InvalidParameters);
    }

    let regions = build_regions(vboot);
    // The boot region is identity-mapped, so the direct-map offset
    // starts at zero; it moves when the VMM takes over.
    // SAFETY: The loader guarantees the map describes unused memory.
    let pmem = Arc::new(unsafe { PhysicalMemory::new(&MEMORY_MASKS, &regions, 0)? });
    kinfo!(
        "physical memory: {}/{} pages free",
        pmem.pages_free(),
        pmem.pages_total()
    );

    let kernel_space = AddressSpace::new_kernel(pmem.clone(), MemoryLayout::default_layout())?;

    let scheduler = SchedulerSet::new(cpu_count);
    let threading = Threading::new(scheduler.clone());
    cpu_local::set_cpu_count(1);

    let machine = Machine::new(
        pmem,
        kernel_space,
        scheduler.clone(),
        threading.clone(),
        vboot.kernel_image,
        vboot.ramdisk,
    )?;
    machine
        .interrupts()
        .set_kernel_space(machine.kernel_space().clone());

    // The BSP's idle thread, then — last — its scheduler gate.
    threading.create("idle0", 0, 0, ThreadFlags::IDLE, Handle::INVALID)?;
    scheduler.scheduler(CpuId::BSP).enable();
    kinfo!("bsp online, {} cores expected", cpu_count);
    Ok(machine)
}

/// Application-core bring-up: runs on the AP after the SIPI trampoline,
/// with its per-CPU pointer already set. Creates the core's idle
/// thread, drains any early TXU handoffs, and enables the scheduler
/// gate last.
pub fn ap_init(machine: &Arc<Machine>, cpu: CpuId) -> OsResult {
    let threading = machine.threading();

    let mut name_buf = alloc::string::String::new();
    core::fmt::write(&mut name_buf, format_args!("idle{}", cpu.as_u32()))
        .map_err(|_| OsError::OutOfMemory)?;
    threading.create(&name_buf, 0, 0, ThreadFlags::IDLE, Handle::INVALID)?;

    cpu_local::set_cpu_count(cpu_local::cpu_count().max(cpu.as_u32() + 1));
    txu::process();
    machine.scheduler().scheduler(cpu).enable();
    kinfo!("{} online", cpu);
    Ok(())
}
