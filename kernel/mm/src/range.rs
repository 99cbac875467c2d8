//! Virtual address range allocation.
//!
//! [`RangeAllocator`] hands out page-aligned ranges within a
//! [`VirtRegion`]: first-fit from a sorted free list, falling back to
//! bumping a watermark. Deallocation coalesces with both neighbors (the
//! conservative three-way merge) and retracts the watermark when the
//! freed range abuts it. The free list is a fixed-capacity array so the
//! allocator itself never allocates.

use core::fmt;

use planck_noalloc::vec::ArrayVec;

use quark_core::addr::VirtAddr;
use quark_core::status::{OsError, OsResult};

use crate::PAGE_MASK;

/// Page-align `size` upward.
#[inline]
const fn page_align_up(size: u64) -> u64 {
    (size + PAGE_MASK as u64) & !(PAGE_MASK as u64)
}

/// A contiguous virtual address region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtRegion {
    base: VirtAddr,
    size: u64,
}

impl VirtRegion {
    /// Creates a region. Base and size must be page-aligned.
    #[must_use]
    pub const fn new(base: VirtAddr, size: u64) -> Self {
        Self { base, size }
    }

    /// First address of the region.
    #[must_use]
    pub const fn base(self) -> VirtAddr {
        self.base
    }

    /// Size of the region in bytes.
    #[must_use]
    pub const fn size(self) -> u64 {
        self.size
    }

    /// One past the last address.
    #[must_use]
    pub const fn end(self) -> u64 {
        self.base.as_u64() + self.size
    }

    /// Whether `[addr, addr+len)` lies inside the region.
    #[must_use]
    pub const fn contains(self, addr: VirtAddr, len: u64) -> bool {
        addr.as_u64() >= self.base.as_u64() && addr.as_u64() + len <= self.end()
    }
}

/// A free range within the managed region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeRange {
    /// Base address (page-aligned).
    base: u64,
    /// Size in bytes (page-aligned, > 0).
    size: u64,
}

/// A range allocator with deallocation and neighbor coalescing.
pub struct RangeAllocator<const N: usize> {
    region: VirtRegion,
    /// Free ranges sorted by base. Adjacent entries are always merged.
    free_list: ArrayVec<FreeRange, N>,
    /// Next address the bump path would hand out.
    watermark: u64,
}

impl<const N: usize> fmt::Debug for RangeAllocator<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeAllocator")
            .field("region", &self.region)
            .field("watermark", &self.watermark)
            .field("free_ranges", &self.free_list.len())
            .finish()
    }
}

impl<const N: usize> RangeAllocator<N> {
    /// Creates an allocator covering `region`, entirely unallocated.
    #[must_use]
    pub const fn new(region: VirtRegion) -> Self {
        Self {
            watermark: region.base().as_u64(),
            free_list: ArrayVec::new(),
            region,
        }
    }

    /// The region this allocator manages.
    #[must_use]
    pub const fn region(&self) -> VirtRegion {
        self.region
    }

    /// Allocates `size` bytes (rounded up to pages). First-fit from the
    /// free list, then the watermark.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` when the region is exhausted.
    pub fn allocate(&mut self, size: u64) -> OsResult<VirtAddr> {
        let aligned = page_align_up(size);
        if aligned == 0 {
            return Err(OsError::InvalidParameters);
        }

        // First-fit scan of the free list.
        for i in 0..self.free_list.len() {
            let entry = self.free_list[i];
            if entry.size >= aligned {
                if entry.size == aligned {
                    self.free_list.remove(i);
                } else {
                    self.free_list[i] = FreeRange {
                        base: entry.base + aligned,
                        size: entry.size - aligned,
                    };
                }
                return Ok(VirtAddr::new(entry.base));
            }
        }

        // Bump path.
        let end = self.watermark + aligned;
        if end > self.region.end() {
            return Err(OsError::OutOfMemory);
        }
        let base = self.watermark;
        self.watermark = end;
        Ok(VirtAddr::new(base))
    }

    /// Claims a specific range (Fixed placement). The range must lie in
    /// the region and be wholly unallocated.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` for an out-of-region or unaligned request,
    /// `Exists` if any part of the range is already handed out,
    /// `OutOfMemory` if recording the claim would overflow the free list.
    pub fn claim(&mut self, addr: VirtAddr, size: u64) -> OsResult<()> {
        let aligned = page_align_up(size);
        let base = addr.as_u64();
        if aligned == 0 || base & PAGE_MASK as u64 != 0 || !self.region.contains(addr, aligned) {
            return Err(OsError::InvalidParameters);
        }
        let end = base + aligned;

        if end <= self.watermark {
            // Must be covered by exactly one free range.
            for i in 0..self.free_list.len() {
                let entry = self.free_list[i];
                if entry.base <= base && end <= entry.base + entry.size {
                    // Split the covering range around the claim.
                    let head = FreeRange {
                        base: entry.base,
                        size: base - entry.base,
                    };
                    let tail = FreeRange {
                        base: end,
                        size: entry.base + entry.size - end,
                    };
                    match (head.size > 0, tail.size > 0) {
                        (false, false) => {
                            self.free_list.remove(i);
                        }
                        (true, false) => self.free_list[i] = head,
                        (false, true) => self.free_list[i] = tail,
                        (true, true) => {
                            if self.free_list.is_full() {
                                return Err(OsError::OutOfMemory);
                            }
                            self.free_list[i] = head;
                            self.free_list.insert(i + 1, tail);
                        }
                    }
                    return Ok(());
                }
            }
            return Err(OsError::Exists);
        }

        if base < self.watermark {
            // Straddles the watermark: the low part is allocated.
            return Err(OsError::Exists);
        }

        // Beyond the watermark: free the gap (if any), bump past the claim.
        let gap = base - self.watermark;
        let old_watermark = self.watermark;
        self.watermark = end;
        if gap > 0 {
            if let Err(err) = self.insert_free(old_watermark, gap) {
                self.watermark = old_watermark;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Returns a previously allocated range.
    ///
    /// `addr` and `size` must match an earlier [`allocate`](Self::allocate)
    /// or [`claim`](Self::claim) (page-rounding is re-applied).
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the free list is at capacity and the range
    /// cannot be coalesced with a neighbor.
    ///
    /// # Panics
    ///
    /// Debug-panics on ranges outside the region, beyond the watermark,
    /// or overlapping existing free ranges (double-free detection).
    pub fn deallocate(&mut self, addr: VirtAddr, size: u64) -> OsResult<()> {
        let base = addr.as_u64();
        let aligned = page_align_up(size);
        if aligned == 0 {
            return Ok(());
        }
        let end = base + aligned;

        debug_assert!(
            self.region.contains(addr, aligned),
            "deallocate: range outside the region"
        );
        debug_assert!(
            end <= self.watermark,
            "deallocate: range beyond the watermark (never allocated)"
        );

        // Fast path: retract the watermark when the range abuts it.
        if end == self.watermark {
            self.watermark = base;
            self.retract_watermark();
            return Ok(());
        }

        self.insert_free(base, aligned)?;
        self.retract_watermark();
        Ok(())
    }

    /// Bytes between the region base and the watermark.
    #[must_use]
    pub fn watermark_used(&self) -> u64 {
        self.watermark - self.region.base().as_u64()
    }

    /// Entries currently on the free list.
    #[must_use]
    pub fn free_list_len(&self) -> usize {
        self.free_list.len()
    }

    /// Total bytes on the free list.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.free_list.iter().map(|r| r.size).sum()
    }

    /// Inserts `[base, base+size)` into the sorted free list, merging
    /// with the predecessor and/or successor. The three-way case
    /// (predecessor + freed + successor) collapses to a single entry.
    fn insert_free(&mut self, base: u64, size: u64) -> OsResult<()> {
        let end = base + size;
        let idx = self.insertion_index(base);

        debug_assert!(
            idx == 0 || {
                let prev = self.free_list[idx - 1];
                prev.base + prev.size <= base
            },
            "deallocate: overlaps predecessor (double free?)"
        );
        debug_assert!(
            idx >= self.free_list.len() || self.free_list[idx].base >= end,
            "deallocate: overlaps successor (double free?)"
        );

        let merge_prev = idx > 0 && {
            let prev = self.free_list[idx - 1];
            prev.base + prev.size == base
        };
        let merge_next = idx < self.free_list.len() && self.free_list[idx].base == end;

        match (merge_prev, merge_next) {
            (true, true) => {
                let succ = self.free_list.remove(idx);
                self.free_list[idx - 1].size += size + succ.size;
            }
            (true, false) => {
                self.free_list[idx - 1].size += size;
            }
            (false, true) => {
                self.free_list[idx].base = base;
                self.free_list[idx].size += size;
            }
            (false, false) => {
                if self.free_list.is_full() {
                    return Err(OsError::OutOfMemory);
                }
                self.free_list.insert(idx, FreeRange { base, size });
            }
        }
        Ok(())
    }

    /// First index whose entry starts above `addr`.
    fn insertion_index(&self, addr: u64) -> usize {
        match self
            .free_list
            .as_slice()
            .binary_search_by_key(&addr, |r| r.base)
        {
            Ok(i) => i,  // exact match would mean a double free
            Err(i) => i, // insertion point
        }
    }

    /// Retracts the watermark while the trailing free entry abuts it.
    fn retract_watermark(&mut self) {
        while let Some(last) = self.free_list.last() {
            if last.base + last.size == self.watermark {
                self.watermark = last.base;
                let _ = self.free_list.pop();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc<const N: usize>(base: u64, size: u64) -> RangeAllocator<N> {
        RangeAllocator::new(VirtRegion::new(VirtAddr::new(base), size))
    }

    #[test]
    fn sequential_bump() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        assert_eq!(ra.allocate(0x1000).unwrap().as_u64(), 0x1000);
        assert_eq!(ra.allocate(0x1000).unwrap().as_u64(), 0x2000);
        assert_eq!(ra.watermark_used(), 0x2000);
    }

    #[test]
    fn size_rounds_up_to_pages() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        ra.allocate(1).unwrap();
        assert_eq!(ra.watermark_used(), 0x1000);
    }

    #[test]
    fn zero_size_rejected() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        assert_eq!(ra.allocate(0), Err(OsError::InvalidParameters));
    }

    #[test]
    fn exhaustion() {
        let mut ra = alloc::<16>(0x1000, 0x2000);
        ra.allocate(0x1000).unwrap();
        ra.allocate(0x1000).unwrap();
        assert_eq!(ra.allocate(0x1000), Err(OsError::OutOfMemory));
    }

    #[test]
    fn dealloc_retracts_watermark() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        let a = ra.allocate(0x1000).unwrap();
        let b = ra.allocate(0x1000).unwrap();

        ra.deallocate(b, 0x1000).unwrap();
        assert_eq!(ra.watermark_used(), 0x1000);
        ra.deallocate(a, 0x1000).unwrap();
        assert_eq!(ra.watermark_used(), 0);
        assert_eq!(ra.free_list_len(), 0);
    }

    #[test]
    fn freed_range_reused_first_fit() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        let a = ra.allocate(0x1000).unwrap();
        let _b = ra.allocate(0x1000).unwrap();
        let _c = ra.allocate(0x1000).unwrap();

        ra.deallocate(a, 0x1000).unwrap();
        assert_eq!(ra.free_list_len(), 1);

        let d = ra.allocate(0x1000).unwrap();
        assert_eq!(d, a);
        assert_eq!(ra.free_list_len(), 0);
    }

    #[test]
    fn three_way_merge() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        let a = ra.allocate(0x1000).unwrap();
        let b = ra.allocate(0x1000).unwrap();
        let c = ra.allocate(0x1000).unwrap();
        let _d = ra.allocate(0x1000).unwrap();

        ra.deallocate(a, 0x1000).unwrap();
        ra.deallocate(c, 0x1000).unwrap();
        assert_eq!(ra.free_list_len(), 2);

        // Freeing b joins predecessor and successor into one entry.
        ra.deallocate(b, 0x1000).unwrap();
        assert_eq!(ra.free_list_len(), 1);
        assert_eq!(ra.free_bytes(), 0x3000);
    }

    #[test]
    fn watermark_retraction_chain() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        let _a = ra.allocate(0x1000).unwrap();
        let b = ra.allocate(0x1000).unwrap();
        let c = ra.allocate(0x1000).unwrap();

        // b enters the free list; freeing c retracts through both.
        ra.deallocate(b, 0x1000).unwrap();
        ra.deallocate(c, 0x1000).unwrap();
        assert_eq!(ra.watermark_used(), 0x1000);
        assert_eq!(ra.free_list_len(), 0);
    }

    #[test]
    fn free_list_capacity_overflow() {
        let mut ra = alloc::<2>(0x1000, 0x10000);
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(ra.allocate(0x1000).unwrap());
        }
        ra.deallocate(held[0], 0x1000).unwrap();
        ra.deallocate(held[2], 0x1000).unwrap();
        assert_eq!(ra.deallocate(held[4], 0x1000), Err(OsError::OutOfMemory));
    }

    #[test]
    fn split_partial_fit() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        let a = ra.allocate(0x3000).unwrap();
        let _b = ra.allocate(0x1000).unwrap();

        ra.deallocate(a, 0x3000).unwrap();
        let c = ra.allocate(0x1000).unwrap();
        assert_eq!(c, a);
        assert_eq!(ra.free_bytes(), 0x2000);
    }

    #[test]
    fn claim_beyond_watermark_creates_gap() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        ra.claim(VirtAddr::new(0x4000), 0x1000).unwrap();
        assert_eq!(ra.free_bytes(), 0x3000);

        // The gap is reusable.
        assert_eq!(ra.allocate(0x3000).unwrap().as_u64(), 0x1000);
        // And the claimed page is not handed out.
        assert_eq!(ra.allocate(0x1000).unwrap().as_u64(), 0x5000);
    }

    #[test]
    fn claim_allocated_range_fails() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        let a = ra.allocate(0x1000).unwrap();
        assert_eq!(ra.claim(a, 0x1000), Err(OsError::Exists));
    }

    #[test]
    fn claim_inside_free_range_splits_it() {
        let mut ra = alloc::<16>(0x1000, 0x10000);
        let a = ra.allocate(0x3000).unwrap();
        let _b = ra.allocate(0x1000).unwrap();
        ra.deallocate(a, 0x3000).unwrap();

        // Claim the middle page of the freed run.
        ra.claim(VirtAddr::new(0x2000), 0x1000).unwrap();
        assert_eq!(ra.free_list_len(), 2);
        assert_eq!(ra.free_bytes(), 0x2000);
    }

    #[test]
    fn claim_outside_region_rejected() {
        let mut ra = alloc::<16>(0x1000, 0x2000);
        assert_eq!(
            ra.claim(VirtAddr::new(0x10_0000), 0x1000),
            Err(OsError::InvalidParameters)
        );
    }

    #[test]
    fn full_cycle() {
        let mut ra = alloc::<16>(0x1000, 0x4000);
        let addrs: Vec<_> = (0..4).map(|_| ra.allocate(0x1000).unwrap()).collect();
        assert_eq!(ra.allocate(0x1000), Err(OsError::OutOfMemory));

        for addr in addrs.iter().rev() {
            ra.deallocate(*addr, 0x1000).unwrap();
        }
        assert_eq!(ra.watermark_used(), 0);
        for _ in 0..4 {
            ra.allocate(0x1000).unwrap();
        }
        assert_eq!(ra.allocate(0x1000), Err(OsError::OutOfMemory));
    }
}
