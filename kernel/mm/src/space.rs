//! Address spaces.
//!
//! An [`AddressSpace`] owns a page-table tree and the bookkeeping for
//! virtual range placement. The kernel space is a singleton whose upper
//! half is shared into every user space at creation; the kernel-global
//! range allocator is likewise shared, so a global mapping made through
//! any space is visible to all of them.
//!
//! A page is in exactly one of three states (see [`MappingState`]):
//! absent, reserved (claimed, unbacked, not present) or committed
//! (frame attached). `reserve` writes reserved entries, `commit_*`
//! moves them to committed with a compare-and-swap — two racing
//! committers cannot both win a page; the loser observes `Exists`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::status::{OsError, OsResult};
use quark_core::sync::SpinLock;
use core::sync::atomic::Ordering;

use crate::attrs::{MemoryAttrs, PageEntry};
use crate::phys::PhysicalMemory;
use crate::range::{RangeAllocator, VirtRegion};
use crate::table::PageTables;
use crate::{PAGE_SIZE, page_count, tlb};

/// Capacity of the kernel-global range allocator's free list.
const GLOBAL_RANGE_SLOTS: usize = 256;
/// Capacity of each per-space range allocator's free list.
const PROCESS_RANGE_SLOTS: usize = 128;

/// Ports covered by the IO permission bitmap.
const IO_PORT_COUNT: usize = 0x10000;

/// Where a new mapping is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Kernel-global region, visible in every address space.
    AnywhereGlobal,
    /// The space's private region.
    AnywhereProcess,
    /// Exactly this address. Inside the managed regions the range is
    /// claimed from the owning allocator; outside them (e.g. image load
    /// addresses) conflicts are detected at the page entries alone.
    Fixed(VirtAddr),
}

/// Kernel or user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// The singleton kernel space.
    Kernel,
    /// A per-process space sharing the kernel half.
    User,
}

/// State of one page in a space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// Not part of any mapping.
    None,
    /// Claimed by a reservation, no frame attached.
    Reserved(MemoryAttrs),
    /// Frame attached and present.
    Committed(PhysAddr, MemoryAttrs),
}

/// Virtual layout handed to the kernel space at construction.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLayout {
    /// Region for `AnywhereGlobal` placements. Must lie in the kernel
    /// half of the address space.
    pub kernel_global: VirtRegion,
    /// Region for `AnywhereProcess` placements.
    pub process: VirtRegion,
}

impl MemoryLayout {
    /// The layout used by the supported platforms: 64 GiB of global
    /// kernel window, 1 TiB of per-process window.
    #[must_use]
    pub const fn default_layout() -> Self {
        Self {
            kernel_global: VirtRegion::new(
                VirtAddr::new(0x8000_0000_0000),
                64 * 1024 * 1024 * 1024,
            ),
            process: VirtRegion::new(VirtAddr::new(0x10_0000_0000), 1024 * 1024 * 1024 * 1024),
        }
    }
}

/// A kernel or user address space.
pub struct AddressSpace {
    kind: SpaceKind,
    tables: PageTables,
    pmem: Arc<PhysicalMemory>,
    layout: MemoryLayout,
    /// Shared between the kernel space and every user space.
    global_ranges: Arc<SpinLock<RangeAllocator<GLOBAL_RANGE_SLOTS>>>,
    /// Private to this space.
    process_ranges: SpinLock<RangeAllocator<PROCESS_RANGE_SLOTS>>,
    /// Lazily allocated IO permission bitmap, one bit per port.
    io_bitmap: SpinLock<Option<alloc::boxed::Box<[u8]>>>,
}

impl AddressSpace {
    /// Creates the kernel space. Pre-touches the kernel-global window so
    /// its root entries exist before any user space copies the kernel
    /// half.
    pub fn new_kernel(pmem: Arc<PhysicalMemory>, layout: MemoryLayout) -> OsResult<Arc<Self>> {
        let tables = PageTables::new(&pmem)?;

        // Materialize the root entries spanning the global window; user
        // spaces copy the root's kernel half once, so these must exist
        // up front. One touch per 512 GiB of window.
        let span = 512u64 * 1024 * 1024 * 1024;
        let mut va = layout.kernel_global.base();
        while va.as_u64() < layout.kernel_global.end() {
            tables.ensure_entry(&pmem, va)?;
            va += span;
        }

        Ok(Arc::new(Self {
            kind: SpaceKind::Kernel,
            tables,
            pmem,
            layout,
            global_ranges: Arc::new(SpinLock::new(RangeAllocator::new(layout.kernel_global))),
            process_ranges: SpinLock::new(RangeAllocator::new(layout.process)),
            io_bitmap: SpinLock::new(None),
        }))
    }

    /// Creates a user space sharing `kernel`'s upper half and global
    /// range allocator.
    pub fn new_user(kernel: &Arc<Self>) -> OsResult<Arc<Self>> {
        debug_assert_eq!(kernel.kind, SpaceKind::Kernel);
        let tables = PageTables::new(&kernel.pmem)?;
        tables.share_kernel_half(&kernel.pmem, &kernel.tables);

        Ok(Arc::new(Self {
            kind: SpaceKind::User,
            tables,
            pmem: kernel.pmem.clone(),
            layout: kernel.layout,
            global_ranges: kernel.global_ranges.clone(),
            process_ranges: SpinLock::new(RangeAllocator::new(kernel.layout.process)),
            io_bitmap: SpinLock::new(None),
        }))
    }

    /// Kernel or user.
    #[must_use]
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Root table address (loaded by the arch on a space switch).
    #[must_use]
    pub fn root(&self) -> PhysAddr {
        self.tables.root()
    }

    /// The physical allocator this space draws from.
    #[must_use]
    pub fn pmem(&self) -> &Arc<PhysicalMemory> {
        &self.pmem
    }

    // -----------------------------------------------------------------------
    // Reserve / commit / map / unmap / query / clone
    // -----------------------------------------------------------------------

    /// Carves a virtual range of `len` bytes and writes reserved entries
    /// for every page. No frames are attached. Returns the range base.
    pub fn reserve(
        &self,
        len: u64,
        attrs: MemoryAttrs,
        placement: Placement,
    ) -> OsResult<VirtAddr> {
        if len == 0 {
            return Err(OsError::InvalidParameters);
        }
        let pages = page_count(len);
        let base = self.place(len, placement)?;

        let reserved = PageEntry::reserved(attrs).raw();
        for i in 0..pages {
            let va = base + i * PAGE_SIZE as u64;
            let slot = match self.tables.ensure_entry(&self.pmem, va) {
                Ok(slot) => slot,
                Err(err) => {
                    self.undo_reserve(base, i);
                    self.unplace(base, len);
                    return Err(err);
                }
            };
            if slot
                .compare_exchange(0, reserved, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                self.undo_reserve(base, i);
                self.unplace(base, len);
                return Err(OsError::Exists);
            }
        }
        Ok(base)
    }

    /// Commits `len` bytes starting at `va`, allocating frames below
    /// `mask` and zeroing them. Every page must be reserved. Returns the
    /// attached frames.
    ///
    /// # Errors
    ///
    /// `DoesNotExist` if a page is not reserved, `Exists` if a page is
    /// already committed (also the racing-committer outcome). This
    /// call's own commits are rolled back on error.
    pub fn commit_alloc(&self, va: VirtAddr, len: u64, mask: u64) -> OsResult<Vec<PhysAddr>> {
        let pages = page_count(len);
        let mut frames = Vec::with_capacity(pages as usize);

        for i in 0..pages {
            let page_va = va + i * PAGE_SIZE as u64;
            match self.commit_one(page_va, None, mask) {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    self.undo_commit(va, i, &frames);
                    return Err(err);
                }
            }
        }
        Ok(frames)
    }

    /// Commits pages at `va` with caller-provided frames (one per page).
    /// The frames' ownership stays with the caller; the entries are
    /// marked `PERSISTENT` in addition to their reserved attributes.
    pub fn commit_fixed(&self, va: VirtAddr, frames: &[PhysAddr]) -> OsResult {
        for (i, frame) in frames.iter().enumerate() {
            let page_va = va + (i as u64) * PAGE_SIZE as u64;
            if let Err(err) = self.commit_one(page_va, Some(*frame), 0) {
                self.undo_commit(va, i as u64, &[]);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Reserve + commit with fresh frames. Returns the base and frames.
    pub fn map_alloc(
        &self,
        len: u64,
        mask: u64,
        attrs: MemoryAttrs,
        placement: Placement,
    ) -> OsResult<(VirtAddr, Vec<PhysAddr>)> {
        let base = self.reserve(len, attrs, placement)?;
        match self.commit_alloc(base, len, mask) {
            Ok(frames) => Ok((base, frames)),
            Err(err) => {
                let _ = self.unmap(base, len);
                Err(err)
            }
        }
    }

    /// Reserve + commit of caller-owned frames (device memory, shared
    /// pages). The mapping is `PERSISTENT`: unmap does not free them.
    pub fn map_fixed_frames(
        &self,
        frames: &[PhysAddr],
        attrs: MemoryAttrs,
        placement: Placement,
    ) -> OsResult<VirtAddr> {
        if frames.is_empty() {
            return Err(OsError::InvalidParameters);
        }
        let len = (frames.len() * PAGE_SIZE) as u64;
        let base = self.reserve(len, attrs | MemoryAttrs::PERSISTENT, placement)?;
        match self.commit_fixed(base, frames) {
            Ok(()) => Ok(base),
            Err(err) => {
                let _ = self.unmap(base, len);
                Err(err)
            }
        }
    }

    /// Removes `len` bytes of mappings starting at `va`. Present frames
    /// are freed to the physical allocator unless the entry is
    /// `PERSISTENT`; reserved entries are simply cleared. Invalidates
    /// the TLB range on all cores and releases the range bookkeeping.
    pub fn unmap(&self, va: VirtAddr, len: u64) -> OsResult {
        if len == 0 {
            return Err(OsError::InvalidParameters);
        }
        let pages = page_count(len);
        let mut freed = Vec::new();

        for i in 0..pages {
            let page_va = va + i * PAGE_SIZE as u64;
            let Some(slot) = self.tables.entry(&self.pmem, page_va) else {
                continue;
            };
            let entry = PageEntry::from_raw(slot.swap(0, Ordering::AcqRel));
            if let Some(frame) = entry.frame() {
                if !entry.attrs().contains(MemoryAttrs::PERSISTENT) {
                    freed.push(frame);
                }
            }
        }

        if !freed.is_empty() {
            self.pmem.free(&freed);
        }
        tlb::shootdown(va, pages);
        self.unplace(va, len);
        Ok(())
    }

    /// Reads one page's mapping state without mutation.
    #[must_use]
    pub fn query(&self, va: VirtAddr) -> MappingState {
        let Some(slot) = self.tables.entry(&self.pmem, va) else {
            return MappingState::None;
        };
        let entry = PageEntry::from_raw(slot.load(Ordering::Acquire));
        if let Some(frame) = entry.frame() {
            MappingState::Committed(frame, entry.attrs())
        } else if entry.is_reserved_only() {
            MappingState::Reserved(entry.attrs())
        } else {
            MappingState::None
        }
    }

    /// Reads up to `count` pages' frames starting at `va`. Pages without
    /// a committed frame yield `None`.
    #[must_use]
    pub fn query_range(&self, va: VirtAddr, count: u64) -> Vec<Option<PhysAddr>> {
        (0..count)
            .map(|i| match self.query(va + i * PAGE_SIZE as u64) {
                MappingState::Committed(frame, _) => Some(frame),
                _ => None,
            })
            .collect()
    }

    /// Produces a second mapping of `[va, va+len)`'s committed frames in
    /// `dst` with `attrs`. The clone is `PERSISTENT` — the frames stay
    /// owned by the original mapping. Returns the new base.
    ///
    /// # Errors
    ///
    /// `DoesNotExist` if any source page in the range is not committed.
    pub fn clone_to(
        &self,
        dst: &AddressSpace,
        va: VirtAddr,
        len: u64,
        attrs: MemoryAttrs,
        placement: Placement,
    ) -> OsResult<VirtAddr> {
        let aligned = va.align_down(PAGE_SIZE as u64);
        let span = len + (va - aligned);
        let pages = page_count(span);

        let mut frames = Vec::with_capacity(pages as usize);
        for i in 0..pages {
            match self.query(aligned + i * PAGE_SIZE as u64) {
                MappingState::Committed(frame, _) => frames.push(frame),
                _ => return Err(OsError::DoesNotExist),
            }
        }
        dst.map_fixed_frames(&frames, attrs, placement)
    }

    // -----------------------------------------------------------------------
    // IO permission bitmap
    // -----------------------------------------------------------------------

    /// Grants or revokes user access to an IO port. The bitmap is
    /// allocated on first grant and handed to the arch on each switch
    /// to this space.
    pub fn io_permit(&self, port: u16, allow: bool) {
        let mut bitmap = self.io_bitmap.lock();
        let bytes = bitmap.get_or_insert_with(|| {
            alloc::vec![0xFFu8; IO_PORT_COUNT / 8].into_boxed_slice()
        });
        let (byte, bit) = (port as usize / 8, port as usize % 8);
        if allow {
            bytes[byte] &= !(1 << bit);
        } else {
            bytes[byte] |= 1 << bit;
        }
    }

    /// Whether user code in this space may access `port`. Denied until
    /// the first grant.
    #[must_use]
    pub fn io_permitted(&self, port: u16) -> bool {
        let bitmap = self.io_bitmap.lock();
        match bitmap.as_ref() {
            // Bit clear = allowed, matching the hardware encoding.
            Some(bytes) => bytes[port as usize / 8] & (1 << (port as usize % 8)) == 0,
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Resolves a placement to a base address, taking range bookkeeping.
    fn place(&self, len: u64, placement: Placement) -> OsResult<VirtAddr> {
        match placement {
            Placement::AnywhereGlobal => self.global_ranges.lock().allocate(len),
            Placement::AnywhereProcess => self.process_ranges.lock().allocate(len),
            Placement::Fixed(va) => {
                if !va.is_aligned(PAGE_SIZE as u64) {
                    return Err(OsError::InvalidParameters);
                }
                if self.layout.kernel_global.contains(va, len) {
                    self.global_ranges.lock().claim(va, len)?;
                } else if self.layout.process.contains(va, len) {
                    self.process_ranges.lock().claim(va, len)?;
                }
                // Outside both windows the page entries are the record.
                Ok(va)
            }
        }
    }

    /// Returns range bookkeeping for `[va, va+len)` if it lies in a
    /// managed window.
    fn unplace(&self, va: VirtAddr, len: u64) {
        if self.layout.kernel_global.contains(va, len) {
            let _ = self.global_ranges.lock().deallocate(va, len);
        } else if self.layout.process.contains(va, len) {
            let _ = self.process_ranges.lock().deallocate(va, len);
        }
    }

    /// Clears the first `pages` reserved entries of an aborted reserve.
    fn undo_reserve(&self, base: VirtAddr, pages: u64) {
        for i in 0..pages {
            if let Some(slot) = self.tables.entry(&self.pmem, base + i * PAGE_SIZE as u64) {
                slot.store(0, Ordering::Release);
            }
        }
    }

    /// Rolls back this call's own commits: entries return to reserved,
    /// `own_frames` go back to the allocator.
    fn undo_commit(&self, base: VirtAddr, pages: u64, own_frames: &[PhysAddr]) {
        for i in 0..pages {
            if let Some(slot) = self.tables.entry(&self.pmem, base + i * PAGE_SIZE as u64) {
                let entry = PageEntry::from_raw(slot.load(Ordering::Acquire));
                if entry.is_present() {
                    let reserved = PageEntry::reserved(entry.attrs()).raw();
                    slot.store(reserved, Ordering::Release);
                }
            }
        }
        if !own_frames.is_empty() {
            self.pmem.free(own_frames);
        }
    }

    /// Moves one reserved page to committed. `frame = None` allocates
    /// (and zeroes) a fresh frame below `mask`.
    fn commit_one(&self, va: VirtAddr, frame: Option<PhysAddr>, mask: u64) -> OsResult<PhysAddr> {
        let Some(slot) = self.tables.entry(&self.pmem, va) else {
            return Err(OsError::DoesNotExist);
        };
        let current = PageEntry::from_raw(slot.load(Ordering::Acquire));
        if current.is_present() {
            return Err(OsError::Exists);
        }
        if !current.is_reserved_only() {
            return Err(OsError::DoesNotExist);
        }

        let (target, owned) = match frame {
            Some(frame) => (
                PageEntry::committed(frame, current.attrs() | MemoryAttrs::PERSISTENT),
                None,
            ),
            None => {
                let fresh = self.pmem.alloc_one(mask)?;
                // SAFETY: Freshly allocated frame, not yet visible to anyone.
                unsafe {
                    core::ptr::write_bytes(
                        self.pmem.phys_to_virt(fresh).as_mut_ptr::<u8>(),
                        0,
                        PAGE_SIZE,
                    );
                }
                (PageEntry::committed(fresh, current.attrs()), Some(fresh))
            }
        };

        match slot.compare_exchange(
            current.raw(),
            target.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(target.frame().expect("committed entry has a frame")),
            Err(_) => {
                // A racing committer won this page.
                if let Some(fresh) = owned {
                    self.pmem.free(&[fresh]);
                }
                Err(OsError::Exists)
            }
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.kind == SpaceKind::User {
            self.tables.release_user_half(&self.pmem);
            self.tables.release_root(&self.pmem);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys::MASK_ANY;
    use crate::testutil::TestMemory;

    fn kernel_space(mem: &TestMemory) -> Arc<AddressSpace> {
        AddressSpace::new_kernel(mem.pmem().clone(), MemoryLayout::default_layout()).unwrap()
    }

    #[test]
    fn reserve_then_query_reserved() {
        let mem = TestMemory::new(256);
        let space = kernel_space(&mem);

        let attrs = MemoryAttrs::GLOBAL | MemoryAttrs::READONLY;
        let base = space
            .reserve(2 * PAGE_SIZE as u64, attrs, Placement::AnywhereGlobal)
            .unwrap();
        assert_eq!(space.query(base), MappingState::Reserved(attrs));
        assert_eq!(
            space.query(base + PAGE_SIZE as u64),
            MappingState::Reserved(attrs)
        );
        assert_eq!(
            space.query(base + 2 * PAGE_SIZE as u64),
            MappingState::None
        );
    }

    #[test]
    fn commit_attaches_zeroed_frames() {
        let mem = TestMemory::new(256);
        let space = kernel_space(&mem);

        let base = space
            .reserve(PAGE_SIZE as u64, MemoryAttrs::GLOBAL, Placement::AnywhereGlobal)
            .unwrap();
        let frames = space.commit_alloc(base, PAGE_SIZE as u64, MASK_ANY).unwrap();
        assert_eq!(frames.len(), 1);

        match space.query(base) {
            MappingState::Committed(frame, attrs) => {
                assert_eq!(frame, frames[0]);
                assert!(attrs.contains(MemoryAttrs::GLOBAL));
            }
            other => panic!("expected committed, got {other:?}"),
        }

        // The frame contents were zeroed.
        let ptr = mem.pmem().phys_to_virt(frames[0]).as_ptr::<u8>();
        // SAFETY: The frame belongs to the test arena.
        let bytes = unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn second_commit_observes_exists() {
        let mem = TestMemory::new(256);
        let space = kernel_space(&mem);

        let base = space
            .reserve(PAGE_SIZE as u64, MemoryAttrs::GLOBAL, Placement::AnywhereGlobal)
            .unwrap();
        let first = space.commit_alloc(base, PAGE_SIZE as u64, MASK_ANY).unwrap();
        let free_after_first = mem.pmem().pages_free();

        // No overwrite: the original frame survives, the loser's frame
        // is returned to the allocator.
        assert_eq!(
            space.commit_alloc(base, PAGE_SIZE as u64, MASK_ANY),
            Err(OsError::Exists)
        );
        assert_eq!(mem.pmem().pages_free(), free_after_first);
        assert_eq!(
            space.query(base),
            MappingState::Committed(first[0], MemoryAttrs::GLOBAL)
        );
    }

    #[test]
    fn commit_without_reserve_is_does_not_exist() {
        let mem = TestMemory::new(256);
        let space = kernel_space(&mem);
        assert_eq!(
            space.commit_alloc(VirtAddr::new(0x8000_0050_0000), PAGE_SIZE as u64, MASK_ANY),
            Err(OsError::DoesNotExist)
        );
    }

    #[test]
    fn map_unmap_restores_frame_accounting() {
        let mem = TestMemory::new(256);
        let space = kernel_space(&mem);
        let baseline = mem.pmem().pages_free();

        let (base, frames) = space
            .map_alloc(
                4 * PAGE_SIZE as u64,
                MASK_ANY,
                MemoryAttrs::GLOBAL,
                Placement::AnywhereGlobal,
            )
            .unwrap();
        assert_eq!(frames.len(), 4);

        space.unmap(base, 4 * PAGE_SIZE as u64).unwrap();
        assert_eq!(space.query(base), MappingState::None);
        // All four data frames returned; the kernel window's tables
        // already existed, so the accounting is back at baseline.
        assert_eq!(mem.pmem().pages_free(), baseline);
    }

    #[test]
    fn persistent_mapping_keeps_frames_on_unmap() {
        let mem = TestMemory::new(256);
        let space = kernel_space(&mem);

        let frames = mem.pmem().alloc(2, MASK_ANY).unwrap();
        let base = space
            .map_fixed_frames(&frames, MemoryAttrs::GLOBAL, Placement::AnywhereGlobal)
            .unwrap();
        let free_mapped = mem.pmem().pages_free();

        space.unmap(base, 2 * PAGE_SIZE as u64).unwrap();
        // The frames were not freed; they still belong to the caller.
        assert_eq!(mem.pmem().pages_free(), free_mapped);
        mem.pmem().free(&frames);
    }

    #[test]
    fn clone_to_shares_frames() {
        let mem = TestMemory::new(256);
        let kernel = kernel_space(&mem);
        let user = AddressSpace::new_user(&kernel).unwrap();

        let (src, frames) = user
            .map_alloc(
                2 * PAGE_SIZE as u64,
                MASK_ANY,
                MemoryAttrs::USERSPACE,
                Placement::AnywhereProcess,
            )
            .unwrap();

        let dst = user
            .clone_to(
                &kernel,
                src,
                2 * PAGE_SIZE as u64,
                MemoryAttrs::GLOBAL | MemoryAttrs::READONLY,
                Placement::AnywhereGlobal,
            )
            .unwrap();

        assert_eq!(
            kernel.query_range(dst, 2),
            vec![Some(frames[0]), Some(frames[1])]
        );

        // Tearing down the clone leaves the original committed.
        let free_before = mem.pmem().pages_free();
        kernel.unmap(dst, 2 * PAGE_SIZE as u64).unwrap();
        assert_eq!(mem.pmem().pages_free(), free_before);
        assert_eq!(user.query_range(src, 2), vec![Some(frames[0]), Some(frames[1])]);
    }

    #[test]
    fn clone_of_uncommitted_range_fails() {
        let mem = TestMemory::new(256);
        let kernel = kernel_space(&mem);
        let user = AddressSpace::new_user(&kernel).unwrap();

        let src = user
            .reserve(PAGE_SIZE as u64, MemoryAttrs::USERSPACE, Placement::AnywhereProcess)
            .unwrap();
        assert_eq!(
            user.clone_to(
                &kernel,
                src,
                PAGE_SIZE as u64,
                MemoryAttrs::GLOBAL,
                Placement::AnywhereGlobal
            ),
            Err(OsError::DoesNotExist)
        );
    }

    #[test]
    fn global_mappings_visible_across_spaces() {
        let mem = TestMemory::new(256);
        let kernel = kernel_space(&mem);
        let user = AddressSpace::new_user(&kernel).unwrap();

        let (base, frames) = kernel
            .map_alloc(
                PAGE_SIZE as u64,
                MASK_ANY,
                MemoryAttrs::GLOBAL,
                Placement::AnywhereGlobal,
            )
            .unwrap();

        // The user space walks into the shared kernel tables.
        assert_eq!(
            user.query(base),
            MappingState::Committed(frames[0], MemoryAttrs::GLOBAL)
        );
    }

    #[test]
    fn user_space_drop_returns_frames() {
        let mem = TestMemory::new(256);
        let kernel = kernel_space(&mem);
        let baseline = mem.pmem().pages_free();

        {
            let user = AddressSpace::new_user(&kernel).unwrap();
            user.map_alloc(
                4 * PAGE_SIZE as u64,
                MASK_ANY,
                MemoryAttrs::USERSPACE,
                Placement::AnywhereProcess,
            )
            .unwrap();
        }
        // Root, user tables and data frames all came back.
        assert_eq!(mem.pmem().pages_free(), baseline);
    }

    #[test]
    fn fixed_placement_conflict() {
        let mem = TestMemory::new(256);
        let space = kernel_space(&mem);
        let va = VirtAddr::new(0x40_0000);

        space
            .reserve(PAGE_SIZE as u64, MemoryAttrs::USERSPACE, Placement::Fixed(va))
            .unwrap();
        assert_eq!(
            space.reserve(PAGE_SIZE as u64, MemoryAttrs::USERSPACE, Placement::Fixed(va)),
            Err(OsError::Exists)
        );
    }

    #[test]
    fn io_bitmap_default_deny_then_grant() {
        let mem = TestMemory::new(256);
        let space = kernel_space(&mem);

        assert!(!space.io_permitted(0x60));
        space.io_permit(0x60, true);
        assert!(space.io_permitted(0x60));
        assert!(!space.io_permitted(0x64));
        space.io_permit(0x60, false);
        assert!(!space.io_permitted(0x60));
    }
}
