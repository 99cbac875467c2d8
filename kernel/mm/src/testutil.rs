//! Host-test backing store for physical memory.
//!
//! Allocates a page-aligned arena and presents it as a run of physical
//! memory at an arbitrary physical base. The direct-map offset handed to
//! [`PhysicalMemory`] makes `phys_to_virt` land inside the arena, so the
//! allocator's stack pages and the page-table walker operate on real
//! bytes.

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::alloc::{Layout, alloc_zeroed, dealloc};

use quark_core::addr::PhysAddr;

use crate::phys::PhysicalMemory;
use crate::{PAGE_SIZE, PhysMemoryRegion};

/// Arbitrary, page-aligned physical base for the fake memory run.
const PHYS_BASE: u64 = 0x1000_0000;

/// A page-aligned arena posing as physical memory.
pub struct TestMemory {
    ptr: *mut u8,
    layout: Layout,
    masks: Vec<u64>,
    pmem: Arc<PhysicalMemory>,
}

// SAFETY: The arena is owned and the allocator serializes its own access.
unsafe impl Send for TestMemory {}
unsafe impl Sync for TestMemory {}

impl TestMemory {
    /// Creates an arena of `pages` frames under a single unbounded mask.
    pub fn new(pages: usize) -> Self {
        Self::with_masks(pages, &[pages])
    }

    /// Creates an arena of `pages` frames partitioned by masks whose
    /// limits are given in pages from the arena base. The last limit
    /// must be `>= pages` so every frame has a covering mask.
    pub fn with_masks(pages: usize, mask_pages: &[usize]) -> Self {
        assert!(pages > 0);
        assert!(*mask_pages.last().unwrap() >= pages);

        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());

        let offset = (ptr as u64).wrapping_sub(PHYS_BASE);
        let region = PhysMemoryRegion {
            start: PhysAddr::new(PHYS_BASE),
            size: (pages * PAGE_SIZE) as u64,
            usable: true,
        };
        let masks: Vec<u64> = mask_pages
            .iter()
            .map(|&mp| PHYS_BASE + (mp * PAGE_SIZE) as u64)
            .collect();

        // SAFETY: The arena is unused, exclusively owned, and reachable
        // through `offset` until drop.
        let pmem = unsafe { PhysicalMemory::new(&masks, &[region], offset).unwrap() };

        Self {
            ptr,
            layout,
            masks,
            pmem: Arc::new(pmem),
        }
    }

    /// The physical memory allocator over this arena.
    pub fn pmem(&self) -> &Arc<PhysicalMemory> {
        &self.pmem
    }

    /// Absolute limit of the `idx`-th mask.
    pub fn mask_limit(&self, idx: usize) -> u64 {
        self.masks[idx]
    }

    /// Physical base of the arena.
    pub fn phys_base(&self) -> PhysAddr {
        PhysAddr::new(PHYS_BASE)
    }
}

impl Drop for TestMemory {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated with `layout` in `with_masks`.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}
