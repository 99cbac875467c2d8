//! Physical memory allocator.
//!
//! Frames are partitioned into pools by *memory mask*: an upper-bound
//! physical address identifying a DMA class (e.g. "below 16 MiB",
//! "below 4 GiB"). Each pool keeps its free frames on a LIFO stack whose
//! backing store is pages of the managed memory itself: a frame pushed
//! onto a full stack becomes the next stack page, and an emptied stack
//! page is handed out as the next frame. No external allocation, ever.
//!
//! Stack links are *physical* addresses; the pages are reached through
//! the direct-map translation held by [`PhysicalMemory`]. When the VMM
//! switches away from the boot identity mapping, [`PhysicalMemory::relocate`]
//! moves that translation exactly once — the stacks themselves never
//! move.

use alloc::vec::Vec;

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::status::{OsError, OsResult};
use quark_core::sync::SpinLock;
use quark_core::{kdebug, kwarn};

use crate::{PAGE_SIZE, PhysMemoryRegion};

/// Maximum number of memory masks a platform can declare.
pub const MAX_MEMORY_MASKS: usize = 5;

/// No DMA constraint: any frame satisfies the caller.
pub const MASK_ANY: u64 = u64::MAX;

/// Stack page layout: `prev` link and entry count, then packed entries.
#[repr(C)]
struct StackPageHeader {
    /// Physical address of the previous stack page, 0 if none.
    prev: u64,
    /// Number of entries currently stored in this page.
    len: u64,
}

const HEADER_SIZE: usize = core::mem::size_of::<StackPageHeader>();
const ENTRIES_PER_PAGE: usize = (PAGE_SIZE - HEADER_SIZE) / core::mem::size_of::<u64>();

/// Mutable view of one mask pool, guarded by the per-mask lock.
struct PoolState {
    /// Physical address of the top stack page, 0 when the pool is empty.
    top: u64,
    /// Frames available from this pool (entries plus the pages holding them).
    count: u64,
}

struct MaskPool {
    /// Upper bound (exclusive) on frame addresses in this pool.
    limit: u64,
    state: SpinLock<PoolState>,
}

/// The physical memory allocator.
pub struct PhysicalMemory {
    /// Pools ordered by ascending limit.
    pools: Vec<MaskPool>,
    /// Direct-map offset: `virt = phys + offset`.
    offset: core::sync::atomic::AtomicU64,
    /// Guards the one-shot [`relocate`](Self::relocate).
    relocated: core::sync::atomic::AtomicBool,
    /// Total frames handed to the allocator at construction.
    total: u64,
    /// Double-free ledger, debug builds only.
    #[cfg(debug_assertions)]
    ledger: SpinLock<alloc::collections::BTreeSet<u64>>,
}

impl PhysicalMemory {
    /// Builds the allocator from the platform's mask set and the boot
    /// memory map. `offset` is the current direct-map displacement
    /// (`virt = phys + offset`); during early boot that is 0 (identity).
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameters` if `masks` is empty, unsorted, or
    /// oversized, and `OutOfMemory` if the map contains no usable frame.
    ///
    /// # Safety
    ///
    /// `regions` must accurately describe memory that is unused and
    /// reachable through `offset` for the allocator's entire lifetime.
    pub unsafe fn new(
        masks: &[u64],
        regions: &[PhysMemoryRegion],
        offset: u64,
    ) -> OsResult<Self> {
        if masks.is_empty() || masks.len() > MAX_MEMORY_MASKS {
            return Err(OsError::InvalidParameters);
        }
        if !masks.is_sorted() {
            return Err(OsError::InvalidParameters);
        }

        let mut pools = Vec::with_capacity(masks.len());
        for &limit in masks {
            pools.push(MaskPool {
                limit,
                state: SpinLock::new(PoolState { top: 0, count: 0 }),
            });
        }

        let pmem = Self {
            pools,
            offset: core::sync::atomic::AtomicU64::new(offset),
            relocated: core::sync::atomic::AtomicBool::new(false),
            total: 0,
            #[cfg(debug_assertions)]
            ledger: SpinLock::new(alloc::collections::BTreeSet::new()),
        };

        let mut total = 0u64;
        for region in regions.iter().filter(|r| r.usable) {
            let first = region.start.align_up(PAGE_SIZE as u64);
            let end = region.start + region.size;
            let mut frame = first;
            while frame + (PAGE_SIZE as u64) <= end {
                pmem.push_frame(frame.as_u64());
                total += 1;
                frame += PAGE_SIZE as u64;
            }
        }

        if total == 0 {
            return Err(OsError::OutOfMemory);
        }

        kdebug!("physical memory: {} frames across {} masks", total, masks.len());
        Ok(Self { total, ..pmem })
    }

    /// Translates a physical address through the direct map.
    #[inline]
    #[must_use]
    pub fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        let offset = self.offset.load(core::sync::atomic::Ordering::Acquire);
        VirtAddr::new(phys.as_u64().wrapping_add(offset))
    }

    /// Moves the direct-map translation after the VMM leaves the boot
    /// identity mapping. May be called exactly once.
    ///
    /// # Panics
    ///
    /// Panics on a second call: the stacks hold physical links and a
    /// second relocation would mean two live translations.
    pub fn relocate(&self, new_offset: u64) {
        let was = self
            .relocated
            .swap(true, core::sync::atomic::Ordering::AcqRel);
        assert!(!was, "physical memory translation relocated twice");
        self.offset
            .store(new_offset, core::sync::atomic::Ordering::Release);
    }

    /// Allocates `count` frames whose addresses all lie below
    /// `constraint`. Pools are tried from the highest satisfying mask
    /// downward. All-or-nothing: a partial harvest is rolled back and
    /// `OutOfMemory` returned.
    pub fn alloc(&self, count: usize, constraint: u64) -> OsResult<Vec<PhysAddr>> {
        if count == 0 {
            return Err(OsError::InvalidParameters);
        }

        let mut frames = Vec::with_capacity(count);
        for pool in self.pools.iter().rev() {
            if pool.limit > constraint {
                continue;
            }
            let mut state = pool.state.lock();
            while frames.len() < count {
                match self.pop_locked(&mut state) {
                    Some(frame) => frames.push(PhysAddr::new(frame)),
                    None => break,
                }
            }
            if frames.len() == count {
                break;
            }
        }

        #[cfg(debug_assertions)]
        {
            let mut ledger = self.ledger.lock();
            for frame in &frames {
                ledger.remove(&frame.as_u64());
            }
        }

        if frames.len() < count {
            kwarn!(
                "frame allocation failed: wanted {}, found {} below {:#x}",
                count,
                frames.len(),
                constraint
            );
            self.free(&frames);
            return Err(OsError::OutOfMemory);
        }
        Ok(frames)
    }

    /// Allocates one frame below `constraint`.
    pub fn alloc_one(&self, constraint: u64) -> OsResult<PhysAddr> {
        Ok(self.alloc(1, constraint)?[0])
    }

    /// Allocates `count` physically contiguous frames below `constraint`.
    ///
    /// The stacks hold no adjacency information, so this harvests the
    /// satisfying pools, searches the harvest for a run, and returns the
    /// rest. Only used for buffers that genuinely need contiguity (legacy
    /// DMA); everything else goes through [`alloc`](Self::alloc).
    pub fn alloc_contiguous(&self, count: usize, constraint: u64) -> OsResult<Vec<PhysAddr>> {
        if count == 0 {
            return Err(OsError::InvalidParameters);
        }
        if count == 1 {
            return self.alloc(1, constraint);
        }

        // Harvest everything we may use.
        let mut harvest: Vec<u64> = Vec::new();
        for pool in self.pools.iter().rev() {
            if pool.limit > constraint {
                continue;
            }
            let mut state = pool.state.lock();
            while let Some(frame) = self.pop_locked(&mut state) {
                harvest.push(frame);
            }
        }

        harvest.sort_unstable();

        #[cfg(debug_assertions)]
        {
            let mut ledger = self.ledger.lock();
            for frame in &harvest {
                ledger.remove(frame);
            }
        }

        // Find the first run of `count` adjacent frames.
        let mut run_start = 0usize;
        let mut found = None;
        for i in 1..=harvest.len() {
            let adjacent =
                i < harvest.len() && harvest[i] == harvest[i - 1] + PAGE_SIZE as u64;
            if !adjacent {
                if i - run_start >= count {
                    found = Some(run_start);
                    break;
                }
                run_start = i;
            }
        }

        let result = found.map(|start| {
            harvest
                .drain(start..start + count)
                .map(PhysAddr::new)
                .collect::<Vec<_>>()
        });

        // Return the remainder of the harvest.
        for &frame in &harvest {
            self.push_frame(frame);
        }

        match result {
            Some(frames) => {
                #[cfg(debug_assertions)]
                {
                    let mut ledger = self.ledger.lock();
                    for frame in &frames {
                        ledger.remove(&frame.as_u64());
                    }
                }
                Ok(frames)
            }
            None => Err(OsError::OutOfMemory),
        }
    }

    /// Returns frames to their pools. Each frame goes to the smallest
    /// mask whose limit covers its address.
    pub fn free(&self, frames: &[PhysAddr]) {
        #[cfg(debug_assertions)]
        {
            let mut ledger = self.ledger.lock();
            for frame in frames {
                debug_assert!(
                    ledger.insert(frame.as_u64()),
                    "double free of frame {:#x}",
                    frame.as_u64()
                );
            }
        }
        for frame in frames {
            self.push_frame(frame.as_u64());
        }
    }

    /// Number of frames currently available.
    #[must_use]
    pub fn pages_free(&self) -> u64 {
        self.pools.iter().map(|p| p.state.lock().count).sum()
    }

    /// Number of frames handed to the allocator at construction.
    #[must_use]
    pub fn pages_total(&self) -> u64 {
        self.total
    }

    // -----------------------------------------------------------------------
    // Stack mechanics
    // -----------------------------------------------------------------------

    fn header(&self, page: u64) -> *mut StackPageHeader {
        self.phys_to_virt(PhysAddr::new(page)).as_mut_ptr()
    }

    fn entries(&self, page: u64) -> *mut u64 {
        // Entries start right after the header.
        (self.phys_to_virt(PhysAddr::new(page)).as_u64() as usize + HEADER_SIZE) as *mut u64
    }

    /// Pushes one frame onto the pool covering its address.
    fn push_frame(&self, frame: u64) {
        debug_assert_eq!(frame % PAGE_SIZE as u64, 0);
        let pool = self
            .pools
            .iter()
            .find(|p| frame < p.limit)
            .expect("frame beyond the largest memory mask");

        let mut state = pool.state.lock();
        let top = state.top;

        // SAFETY: Stack pages are frames this allocator owns, reachable
        // through the direct map for the allocator's lifetime (constructor
        // contract). The pool lock serializes all access to this stack.
        unsafe {
            if top != 0 && (*self.header(top)).len < ENTRIES_PER_PAGE as u64 {
                let header = self.header(top);
                let len = (*header).len;
                *self.entries(top).add(len as usize) = frame;
                (*header).len = len + 1;
            } else {
                // Stack page absent or full: the freed frame becomes the
                // new stack page.
                let header = self.header(frame);
                (*header).prev = top;
                (*header).len = 0;
                state.top = frame;
            }
        }
        state.count += 1;
    }

    /// Pops one frame, preferring stored entries over the page itself.
    fn pop_locked(&self, state: &mut PoolState) -> Option<u64> {
        let top = state.top;
        if top == 0 {
            return None;
        }

        // SAFETY: Same as push_frame — owned pages under the pool lock.
        let frame = unsafe {
            let header = self.header(top);
            let len = (*header).len;
            if len > 0 {
                (*header).len = len - 1;
                *self.entries(top).add((len - 1) as usize)
            } else {
                // The page is out of entries; hand out the page itself.
                state.top = (*header).prev;
                top
            }
        };
        state.count -= 1;
        Some(frame)
    }
}
