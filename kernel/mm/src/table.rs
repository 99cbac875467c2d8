//! Software-walked multi-level page tables.
//!
//! Four levels of 512-entry tables, every entry an `AtomicU64` in the
//! [`PageEntry`](crate::attrs::PageEntry) format. There is no global
//! lock: leaf transitions go through compare-and-swap, and intermediate
//! tables are attached with compare-and-swap so concurrent walkers
//! agree on a single winner. Table frames come from — and return to —
//! the physical allocator; they are reached through its direct map.
//!
//! An architecture backend mirrors committed entries into the hardware
//! format; everything above this module is portable.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::status::OsResult;

use crate::attrs::{MemoryAttrs, PageEntry};
use crate::phys::{MASK_ANY, PhysicalMemory};
use crate::PAGE_SIZE;

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Table levels. Level 0 holds leaf entries.
const LEVELS: u32 = 4;

/// Root-table index from which the kernel half begins.
pub const KERNEL_HALF_START: usize = ENTRIES_PER_TABLE / 2;

#[inline]
fn index_at(va: VirtAddr, level: u32) -> usize {
    ((va.as_u64() >> (12 + 9 * level)) & 0x1FF) as usize
}

/// A page-table tree rooted at one physical frame.
pub struct PageTables {
    root: PhysAddr,
}

impl PageTables {
    /// Allocates a zeroed root table.
    pub fn new(pmem: &PhysicalMemory) -> OsResult<Self> {
        let root = alloc_table_frame(pmem)?;
        Ok(Self { root })
    }

    /// Physical address of the root table (what the arch loads on a
    /// space switch).
    #[must_use]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Copies the kernel-half root entries from `kernel` into this tree,
    /// sharing the kernel's lower-level tables.
    pub fn share_kernel_half(&self, pmem: &PhysicalMemory, kernel: &PageTables) {
        let src = table_at(pmem, kernel.root);
        let dst = table_at(pmem, self.root);
        for i in KERNEL_HALF_START..ENTRIES_PER_TABLE {
            dst[i].store(src[i].load(Ordering::Acquire), Ordering::Release);
        }
    }

    /// Returns the leaf entry for `va` if every intermediate table
    /// exists, without allocating.
    pub fn entry<'a>(&self, pmem: &'a PhysicalMemory, va: VirtAddr) -> Option<&'a AtomicU64> {
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let slot = &table_at(pmem, table)[index_at(va, level)];
            let entry = PageEntry::from_raw(slot.load(Ordering::Acquire));
            table = entry.table_addr()?;
        }
        Some(&table_at(pmem, table)[index_at(va, 0)])
    }

    /// Returns the leaf entry for `va`, allocating intermediate tables
    /// as needed.
    pub fn ensure_entry<'a>(
        &self,
        pmem: &'a PhysicalMemory,
        va: VirtAddr,
    ) -> OsResult<&'a AtomicU64> {
        let mut table = self.root;
        for level in (1..LEVELS).rev() {
            let slot = &table_at(pmem, table)[index_at(va, level)];
            let entry = PageEntry::from_raw(slot.load(Ordering::Acquire));
            table = match entry.table_addr() {
                Some(next) => next,
                None => {
                    let fresh = alloc_table_frame(pmem)?;
                    match slot.compare_exchange(
                        0,
                        PageEntry::table(fresh).raw(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => fresh,
                        Err(raced) => {
                            // Another walker attached a table first.
                            pmem.free(&[fresh]);
                            PageEntry::from_raw(raced)
                                .table_addr()
                                .expect("non-empty intermediate entry must be a table")
                        }
                    }
                }
            };
        }
        Ok(&table_at(pmem, table)[index_at(va, 0)])
    }

    /// Tears down the user half of the tree: frees every table frame
    /// below user-half root entries, plus committed leaf frames that are
    /// not `PERSISTENT`. Kernel-half entries are shared and left alone.
    ///
    /// Returns the number of leaf frames released.
    pub fn release_user_half(&self, pmem: &PhysicalMemory) -> usize {
        let mut leaves = Vec::new();
        let mut tables = Vec::new();

        let root = table_at(pmem, self.root);
        for slot in root.iter().take(KERNEL_HALF_START) {
            let entry = PageEntry::from_raw(slot.swap(0, Ordering::AcqRel));
            if let Some(next) = entry.table_addr() {
                collect_subtree(pmem, next, LEVELS - 1, &mut leaves, &mut tables);
            }
        }

        let released = leaves.len();
        if !leaves.is_empty() {
            pmem.free(&leaves);
        }
        if !tables.is_empty() {
            pmem.free(&tables);
        }
        released
    }

    /// Frees the root frame itself. The caller must have released
    /// everything below first (and must not share this root).
    pub fn release_root(&self, pmem: &PhysicalMemory) {
        pmem.free(&[self.root]);
    }
}

/// Recursively collects leaf and table frames under `table` at `level`.
fn collect_subtree(
    pmem: &PhysicalMemory,
    table: PhysAddr,
    level: u32,
    leaves: &mut Vec<PhysAddr>,
    tables: &mut Vec<PhysAddr>,
) {
    let entries = table_at(pmem, table);
    if level == 1 {
        for slot in entries {
            let entry = PageEntry::from_raw(slot.swap(0, Ordering::AcqRel));
            if let Some(frame) = entry.frame() {
                if !entry.attrs().contains(MemoryAttrs::PERSISTENT) {
                    leaves.push(frame);
                }
            }
        }
    } else {
        for slot in entries {
            let entry = PageEntry::from_raw(slot.swap(0, Ordering::AcqRel));
            if let Some(next) = entry.table_addr() {
                collect_subtree(pmem, next, level - 1, leaves, tables);
            }
        }
    }
    tables.push(table);
}

/// Views a physical frame as a table of atomic entries.
fn table_at(pmem: &PhysicalMemory, frame: PhysAddr) -> &[AtomicU64; ENTRIES_PER_TABLE] {
    let virt = pmem.phys_to_virt(frame);
    // SAFETY: `frame` is a live table frame owned by this tree, mapped
    // through the allocator's direct map, and AtomicU64 access needs no
    // further synchronization.
    unsafe { &*virt.as_ptr::<[AtomicU64; ENTRIES_PER_TABLE]>() }
}

/// Allocates and zeroes one table frame.
fn alloc_table_frame(pmem: &PhysicalMemory) -> OsResult<PhysAddr> {
    let frame = pmem.alloc_one(MASK_ANY)?;
    let virt = pmem.phys_to_virt(frame);
    // SAFETY: Freshly allocated frame, exclusively owned until attached.
    unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMemory;

    #[test]
    fn entry_absent_before_ensure() {
        let mem = TestMemory::new(64);
        let tables = PageTables::new(mem.pmem()).unwrap();
        assert!(tables.entry(mem.pmem(), VirtAddr::new(0x4000)).is_none());
    }

    #[test]
    fn ensure_then_read_back() {
        let mem = TestMemory::new(64);
        let pmem = mem.pmem();
        let tables = PageTables::new(pmem).unwrap();
        let va = VirtAddr::new(0x7000_0000);

        let slot = tables.ensure_entry(pmem, va).unwrap();
        let frame = PhysAddr::new(0x1234_5000);
        slot.store(
            PageEntry::committed(frame, MemoryAttrs::GLOBAL).raw(),
            Ordering::Release,
        );

        let read = tables.entry(pmem, va).unwrap();
        let entry = PageEntry::from_raw(read.load(Ordering::Acquire));
        assert_eq!(entry.frame(), Some(frame));
    }

    #[test]
    fn adjacent_pages_share_tables() {
        let mem = TestMemory::new(64);
        let pmem = mem.pmem();
        let tables = PageTables::new(pmem).unwrap();

        let before = pmem.pages_free();
        tables.ensure_entry(pmem, VirtAddr::new(0x1000)).unwrap();
        let after_first = pmem.pages_free();
        tables.ensure_entry(pmem, VirtAddr::new(0x2000)).unwrap();
        let after_second = pmem.pages_free();

        // First walk allocates three intermediate tables; the neighbor
        // reuses all of them.
        assert_eq!(before - after_first, 3);
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn share_kernel_half_aliases_tables() {
        let mem = TestMemory::new(128);
        let pmem = mem.pmem();
        let kernel = PageTables::new(pmem).unwrap();
        let kernel_va = VirtAddr::new(0x8000_0000_0000);
        let slot = kernel.ensure_entry(pmem, kernel_va).unwrap();
        let frame = PhysAddr::new(0xAAAA_A000);
        slot.store(
            PageEntry::committed(frame, MemoryAttrs::GLOBAL).raw(),
            Ordering::Release,
        );

        let user = PageTables::new(pmem).unwrap();
        user.share_kernel_half(pmem, &kernel);

        let entry = user.entry(pmem, kernel_va).unwrap();
        assert_eq!(
            PageEntry::from_raw(entry.load(Ordering::Acquire)).frame(),
            Some(frame)
        );
    }

    #[test]
    fn release_user_half_returns_frames() {
        let mem = TestMemory::new(128);
        let pmem = mem.pmem();
        let tables = PageTables::new(pmem).unwrap();

        let baseline = pmem.pages_free();
        let leaf = pmem.alloc_one(MASK_ANY).unwrap();
        let slot = tables.ensure_entry(pmem, VirtAddr::new(0x5000)).unwrap();
        slot.store(
            PageEntry::committed(leaf, MemoryAttrs::empty()).raw(),
            Ordering::Release,
        );

        let released = tables.release_user_half(pmem);
        assert_eq!(released, 1);
        // Leaf + three tables all returned.
        assert_eq!(pmem.pages_free(), baseline);
    }

    #[test]
    fn release_user_half_keeps_persistent_frames() {
        let mem = TestMemory::new(128);
        let pmem = mem.pmem();
        let tables = PageTables::new(pmem).unwrap();

        let leaf = pmem.alloc_one(MASK_ANY).unwrap();
        let slot = tables.ensure_entry(pmem, VirtAddr::new(0x5000)).unwrap();
        slot.store(
            PageEntry::committed(leaf, MemoryAttrs::PERSISTENT).raw(),
            Ordering::Release,
        );

        assert_eq!(tables.release_user_half(pmem), 0);
        // The persistent frame is still owned elsewhere; freeing it now
        // must not trip the double-free ledger.
        pmem.free(&[leaf]);
    }

    #[test]
    fn release_user_half_leaves_kernel_half() {
        let mem = TestMemory::new(128);
        let pmem = mem.pmem();
        let kernel = PageTables::new(pmem).unwrap();
        let kernel_va = VirtAddr::new(0x8000_0000_0000);
        kernel.ensure_entry(pmem, kernel_va).unwrap();

        let user = PageTables::new(pmem).unwrap();
        user.share_kernel_half(pmem, &kernel);
        user.ensure_entry(pmem, VirtAddr::new(0x1000)).unwrap();
        user.release_user_half(pmem);

        // The kernel's tables are untouched and still walkable.
        assert!(kernel.entry(pmem, kernel_va).is_some());
        assert!(user.entry(pmem, kernel_va).is_some());
    }
}
