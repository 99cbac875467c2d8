//! Memory region broker.
//!
//! A memory region is a handle-identified shared buffer: a physical page
//! list, a permanent kernel view spanning the full capacity, and any
//! number of per-process user views. Capacity is fixed at creation;
//! length only grows, up to capacity. Pages may be attached eagerly, on
//! resize, or on demand for sparse use — a page slot of zero means
//! "no frame yet", and such gaps read as zeroes until filled.
//!
//! All mutating operations serialize on the per-region mutex. The
//! region's frames are owned by its kernel view: destroying the region
//! unmaps that view, which returns the frames (adopted buffers keep
//! theirs — their view is persistent).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use quark_core::addr::{PhysAddr, VirtAddr};
use quark_core::handle::HandleTable;
use quark_core::id::Handle;
use quark_core::ktrace;
use quark_core::status::{OsError, OsResult};
use quark_core::sync::Mutex;

use crate::attrs::MemoryAttrs;
use crate::space::{AddressSpace, MappingState, Placement};
use crate::{PAGE_SIZE, page_count};

/// One run of physically contiguous bytes, for DMA programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// First physical byte of the run.
    pub address: PhysAddr,
    /// Length of the run in bytes.
    pub length: u64,
}

/// Result of [`RegionBroker::create`].
#[derive(Debug, Clone, Copy)]
pub struct RegionCreated {
    /// Handle identifying the region.
    pub handle: Handle,
    /// Kernel view of the buffer.
    pub kernel_addr: VirtAddr,
    /// Caller's user view, when one was requested.
    pub user_addr: Option<VirtAddr>,
}

struct RegionState {
    /// Bytes currently valid. Monotonically grows up to capacity.
    length: u64,
    /// One slot per capacity page; `PhysAddr::ZERO` marks an unfilled gap.
    pages: Vec<PhysAddr>,
}

/// A shared buffer. See the module docs.
pub struct MemoryRegion {
    kernel_space: Arc<AddressSpace>,
    capacity: u64,
    page_mask: u64,
    flags: MemoryAttrs,
    /// Page-aligned base of the kernel view.
    kernel_base: VirtAddr,
    /// Sub-page displacement of the buffer within its first page
    /// (non-zero only for adopted buffers).
    offset: u64,
    state: Mutex<RegionState>,
}

impl MemoryRegion {
    fn pages_total(&self) -> u64 {
        page_count(self.capacity + self.offset)
    }

    /// Fills page slots `[from, to)` that are still gaps: a fresh zeroed
    /// frame is committed into the kernel view, and into the user view
    /// when one is given.
    fn fill_gaps(
        &self,
        state: &mut RegionState,
        from: u64,
        to: u64,
        user: Option<(&AddressSpace, VirtAddr)>,
    ) -> OsResult {
        for i in from..to {
            let page_off = i * PAGE_SIZE as u64;
            if state.pages[i as usize] != PhysAddr::ZERO {
                continue;
            }
            let frames = self.kernel_space.commit_alloc(
                self.kernel_base + page_off,
                PAGE_SIZE as u64,
                self.page_mask,
            )?;
            state.pages[i as usize] = frames[0];
            if let Some((space, user_base)) = user {
                space.commit_fixed(user_base + page_off, &frames)?;
            }
        }
        Ok(())
    }

    /// Commits the already-filled pages `[0, upto)` into a user view
    /// where that view has no present entry yet.
    fn mirror_into(
        &self,
        state: &RegionState,
        space: &AddressSpace,
        user_base: VirtAddr,
        upto: u64,
    ) -> OsResult {
        for i in 0..upto {
            let frame = state.pages[i as usize];
            if frame == PhysAddr::ZERO {
                continue;
            }
            let page_va = user_base + i * PAGE_SIZE as u64;
            if let MappingState::Committed(..) = space.query(page_va) {
                continue;
            }
            space.commit_fixed(page_va, &[frame])?;
        }
        Ok(())
    }

    /// Builds a user view: a reservation over the full capacity plus
    /// committed entries for the current length. Returns the page-aligned
    /// view base.
    fn build_user_view(
        &self,
        state: &RegionState,
        space: &AddressSpace,
        access: MemoryAttrs,
    ) -> OsResult<VirtAddr> {
        let attrs = self.flags | access | MemoryAttrs::USERSPACE | MemoryAttrs::PERSISTENT;
        let total = self.pages_total() * PAGE_SIZE as u64;
        let base = space.reserve(total, attrs, Placement::AnywhereProcess)?;

        let valid = page_count(state.length + self.offset);
        if let Err(err) = self.mirror_into(state, space, base, valid) {
            let _ = space.unmap(base, total);
            return Err(err);
        }
        Ok(base)
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // The kernel view owns the frames: unmapping frees the ones this
        // region allocated (adopted frames sit behind a persistent view
        // and stay with their original owner).
        let total = self.pages_total() * PAGE_SIZE as u64;
        let _ = self.kernel_space.unmap(self.kernel_base, total);
    }
}

/// The broker: a handle arena of [`MemoryRegion`]s.
pub struct RegionBroker {
    table: HandleTable<MemoryRegion>,
}

impl RegionBroker {
    /// Creates an empty broker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            table: HandleTable::new(),
        }
    }

    /// Creates a region of `capacity` bytes with `length` bytes valid.
    ///
    /// With `MemoryAttrs::COMMIT` the pages backing `length` are
    /// attached immediately; otherwise every page starts as a gap and is
    /// filled by `resize`, `commit` or writes. A user view in `user` is
    /// built when given.
    pub fn create(
        &self,
        kernel_space: &Arc<AddressSpace>,
        user: Option<&AddressSpace>,
        length: u64,
        capacity: u64,
        flags: MemoryAttrs,
        page_mask: u64,
    ) -> OsResult<RegionCreated> {
        if capacity == 0 || length > capacity {
            return Err(OsError::InvalidParameters);
        }

        let pages = page_count(capacity);
        let kernel_base = kernel_space.reserve(
            pages * PAGE_SIZE as u64,
            (flags & !MemoryAttrs::USERSPACE) | MemoryAttrs::GLOBAL,
            Placement::AnywhereGlobal,
        )?;

        let region = MemoryRegion {
            kernel_space: kernel_space.clone(),
            capacity,
            page_mask,
            flags,
            kernel_base,
            offset: 0,
            state: Mutex::new(RegionState {
                length,
                pages: vec![PhysAddr::ZERO; pages as usize],
            }),
        };

        if flags.contains(MemoryAttrs::COMMIT) && length > 0 {
            let mut state = region.state.lock();
            region.fill_gaps(&mut state, 0, page_count(length), None)?;
        }

        let user_addr = match user {
            Some(space) => {
                let state = region.state.lock();
                Some(region.build_user_view(&state, space, MemoryAttrs::empty())?)
            }
            None => None,
        };

        let handle = self.table.insert(region)?;
        ktrace!("region {} created: {}/{} bytes", handle, length, capacity);
        Ok(RegionCreated {
            handle,
            kernel_addr: kernel_base,
            user_addr,
        })
    }

    /// Adopts an already-mapped buffer: the pages backing
    /// `[user_addr, user_addr+size)` in `src` become the region's page
    /// list, and a kernel view is installed over them. The buffer's
    /// frames remain owned by the original mapping.
    pub fn create_existing(
        &self,
        kernel_space: &Arc<AddressSpace>,
        src: &AddressSpace,
        user_addr: VirtAddr,
        size: u64,
        flags: MemoryAttrs,
    ) -> OsResult<Handle> {
        if size == 0 {
            return Err(OsError::InvalidParameters);
        }

        let offset = user_addr.as_u64() % PAGE_SIZE as u64;
        let span = size + offset;
        let pages = page_count(span);
        let aligned = user_addr.align_down(PAGE_SIZE as u64);

        let mut frames = Vec::with_capacity(pages as usize);
        for (i, frame) in src.query_range(aligned, pages).into_iter().enumerate() {
            match frame {
                Some(frame) => frames.push(frame),
                None => {
                    ktrace!("adopt: page {} of {} not committed", i, user_addr);
                    return Err(OsError::DoesNotExist);
                }
            }
        }

        let kernel_base = kernel_space.map_fixed_frames(
            &frames,
            (flags & !MemoryAttrs::USERSPACE) | MemoryAttrs::GLOBAL,
            Placement::AnywhereGlobal,
        )?;

        // Length and capacity are buffer bytes; the sub-page offset is
        // carried separately and re-applied when views are handed out.
        let region = MemoryRegion {
            kernel_space: kernel_space.clone(),
            capacity: size,
            page_mask: u64::MAX,
            flags,
            kernel_base,
            offset,
            state: Mutex::new(RegionState {
                length: size,
                pages: frames,
            }),
        };
        self.table.insert(region)
    }

    /// References the region for the calling process and reports its
    /// current length.
    pub fn attach(&self, handle: Handle) -> OsResult<u64> {
        let region = self.table.acquire(handle)?;
        let length = region.state.lock().length;
        Ok(length)
    }

    /// Drops one reference. The region is destroyed when the last
    /// reference goes away. Returns whether this was the last one.
    pub fn detach(&self, handle: Handle) -> OsResult<bool> {
        self.table.release(handle)
    }

    /// Builds a user view over the region in `space`. Returns the view
    /// address (buffer start, including any adopted sub-page offset) and
    /// the current length.
    pub fn inherit(
        &self,
        handle: Handle,
        space: &AddressSpace,
        access: MemoryAttrs,
    ) -> OsResult<(VirtAddr, u64)> {
        let region = self.table.get(handle)?;
        let state = region.state.lock();
        let base = region.build_user_view(&state, space, access)?;
        Ok((base + region.offset, state.length))
    }

    /// Tears down a user view previously built by
    /// [`inherit`](Self::inherit) (or returned from `create`).
    pub fn unherit(&self, handle: Handle, space: &AddressSpace, user_addr: VirtAddr) -> OsResult {
        let region = self.table.get(handle)?;
        let base = user_addr.align_down(PAGE_SIZE as u64);
        space.unmap(base, region.pages_total() * PAGE_SIZE as u64)
    }

    /// Grows the region to `new_length` bytes, filling any gaps below
    /// the current length first and committing the caller's view at
    /// `user_addr` alongside the kernel view.
    ///
    /// # Errors
    ///
    /// `InvalidParameters` beyond capacity; `NotSupported` for shrink
    /// (and for growth that stays within the current page count).
    pub fn resize(
        &self,
        handle: Handle,
        space: &AddressSpace,
        user_addr: VirtAddr,
        new_length: u64,
    ) -> OsResult {
        let region = self.table.get(handle)?;
        if new_length > region.capacity {
            return Err(OsError::InvalidParameters);
        }

        let mut state = region.state.lock();
        let current_pages = page_count(state.length + region.offset);
        let new_pages = page_count(new_length + region.offset);
        if current_pages >= new_pages {
            return Err(OsError::NotSupported);
        }

        let user_base = user_addr.align_down(PAGE_SIZE as u64);
        // A scattered region becomes fully buffered on resize: fill the
        // gaps below the old length, then extend.
        region.fill_gaps(&mut state, 0, current_pages, Some((space, user_base)))?;
        region.fill_gaps(&mut state, current_pages, new_pages, Some((space, user_base)))?;
        state.length = new_length;
        Ok(())
    }

    /// Brings a reader's view at `user_addr` up to date after the writer
    /// grew the region: pages the view already maps are left alone, new
    /// ones are committed. Returns the current length.
    pub fn refresh(
        &self,
        handle: Handle,
        space: &AddressSpace,
        user_addr: VirtAddr,
        previous_length: u64,
    ) -> OsResult<u64> {
        let region = self.table.get(handle)?;
        let state = region.state.lock();
        let new_length = state.length;

        let user_base = user_addr.align_down(PAGE_SIZE as u64);
        let known = page_count(previous_length + region.offset);
        let valid = page_count(new_length + region.offset);

        // Fill view holes below what the reader already knew, then map
        // the growth.
        region.mirror_into(&state, space, user_base, known.max(valid))?;
        Ok(new_length)
    }

    /// On-demand commit for sparse regions: ensures pages covering
    /// `[at, at+len)` are backed, in the kernel view and in the caller's
    /// view. `user_base` is the view address returned by `inherit`.
    pub fn commit(
        &self,
        handle: Handle,
        space: &AddressSpace,
        user_base: VirtAddr,
        at: VirtAddr,
        len: u64,
    ) -> OsResult {
        if at < user_base || len == 0 {
            return Err(OsError::InvalidParameters);
        }
        let region = self.table.get(handle)?;
        let rel = at - user_base + region.offset;
        let first = rel / PAGE_SIZE as u64;
        let last = page_count(rel + len);
        if last > region.pages_total() {
            return Err(OsError::InvalidParameters);
        }

        let mut state = region.state.lock();
        let aligned_base = user_base.align_down(PAGE_SIZE as u64);
        region.fill_gaps(&mut state, first, last, Some((space, aligned_base)))
    }

    /// Copies out of the region at `offset`, clamped to the current
    /// length. Gap pages read as zeroes. Returns the bytes copied.
    pub fn read(&self, handle: Handle, offset: u64, buf: &mut [u8]) -> OsResult<usize> {
        if buf.is_empty() {
            return Err(OsError::InvalidParameters);
        }
        let region = self.table.get(handle)?;
        let state = region.state.lock();
        if offset >= state.length {
            return Err(OsError::InvalidParameters);
        }

        let count = buf.len().min((state.length - offset) as usize);
        let mut copied = 0usize;
        while copied < count {
            let pos = region.offset + offset + copied as u64;
            let page = (pos / PAGE_SIZE as u64) as usize;
            let within = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - within).min(count - copied);

            let frame = state.pages[page];
            if frame == PhysAddr::ZERO {
                // An unfilled gap: defined to read as zeroes.
                buf[copied..copied + chunk].fill(0);
            } else {
                let src = region
                    .kernel_space
                    .pmem()
                    .phys_to_virt(frame + within as u64)
                    .as_ptr::<u8>();
                // SAFETY: `frame` is a live region page; volatile access
                // honors device-backed buffers.
                unsafe { volatile_copy_from(src, &mut buf[copied..copied + chunk]) };
            }
            copied += chunk;
        }
        Ok(count)
    }

    /// Copies into the region at `offset`, clamped to the current
    /// length. Gap pages are committed on demand. Returns the bytes
    /// copied.
    pub fn write(&self, handle: Handle, offset: u64, buf: &[u8]) -> OsResult<usize> {
        if buf.is_empty() {
            return Err(OsError::InvalidParameters);
        }
        let region = self.table.get(handle)?;
        let mut state = region.state.lock();
        if offset >= state.length {
            return Err(OsError::InvalidParameters);
        }

        let count = buf.len().min((state.length - offset) as usize);
        let first = (region.offset + offset) / PAGE_SIZE as u64;
        let last = page_count(region.offset + offset + count as u64);
        region.fill_gaps(&mut state, first, last, None)?;

        let mut copied = 0usize;
        while copied < count {
            let pos = region.offset + offset + copied as u64;
            let page = (pos / PAGE_SIZE as u64) as usize;
            let within = (pos % PAGE_SIZE as u64) as usize;
            let chunk = (PAGE_SIZE - within).min(count - copied);

            let dst = region
                .kernel_space
                .pmem()
                .phys_to_virt(state.pages[page] + within as u64)
                .as_mut_ptr::<u8>();
            // SAFETY: The page was just ensured present; volatile access
            // honors device-backed buffers.
            unsafe { volatile_copy_into(dst, &buf[copied..copied + chunk]) };
            copied += chunk;
        }
        Ok(count)
    }

    /// Exports the page list as a coalesced scatter-gather list:
    /// physically adjacent pages merge into one entry, and the first
    /// entry is shortened by the adopted sub-page offset.
    pub fn get_sg(&self, handle: Handle) -> OsResult<Vec<SgEntry>> {
        let region = self.table.get(handle)?;
        let state = region.state.lock();

        let mut list: Vec<SgEntry> = Vec::new();
        for &page in &state.pages {
            match list.last_mut() {
                Some(last)
                    if last.address + last.length == page
                        || (last.address == PhysAddr::ZERO && page == PhysAddr::ZERO) =>
                {
                    last.length += PAGE_SIZE as u64;
                }
                _ => list.push(SgEntry {
                    address: page,
                    length: PAGE_SIZE as u64,
                }),
            }
        }

        if let Some(first) = list.first_mut() {
            first.address = first.address + region.offset;
            first.length -= region.offset;
        }
        Ok(list)
    }

    /// The permanent kernel view, for fast-path interrupt handlers that
    /// must reach the buffer without a space switch.
    pub fn kernel_mapping(&self, handle: Handle) -> OsResult<VirtAddr> {
        let region = self.table.get(handle)?;
        Ok(region.kernel_base + region.offset)
    }

    /// Current length of the region.
    pub fn length(&self, handle: Handle) -> OsResult<u64> {
        let region = self.table.get(handle)?;
        let length = region.state.lock().length;
        Ok(length)
    }

    /// Live regions in the broker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether the broker has no live regions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for RegionBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte-wise volatile copy out of a buffer page.
///
/// # Safety
///
/// `src..src+dst.len()` must be readable.
unsafe fn volatile_copy_from(src: *const u8, dst: &mut [u8]) {
    for (i, byte) in dst.iter_mut().enumerate() {
        // SAFETY: Caller guarantees the range is readable.
        *byte = unsafe { src.add(i).read_volatile() };
    }
}

/// Byte-wise volatile copy into a buffer page.
///
/// # Safety
///
/// `dst..dst+src.len()` must be writable.
unsafe fn volatile_copy_into(dst: *mut u8, src: &[u8]) {
    for (i, byte) in src.iter().enumerate() {
        // SAFETY: Caller guarantees the range is writable.
        unsafe { dst.add(i).write_volatile(*byte) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phys::MASK_ANY;
    use crate::space::MemoryLayout;
    use crate::testutil::TestMemory;

    const PS: u64 = PAGE_SIZE as u64;

    struct Env {
        mem: TestMemory,
        kernel: Arc<AddressSpace>,
        broker: RegionBroker,
    }

    fn env(pages: usize) -> Env {
        let mem = TestMemory::new(pages);
        let kernel =
            AddressSpace::new_kernel(mem.pmem().clone(), MemoryLayout::default_layout()).unwrap();
        Env {
            mem,
            kernel,
            broker: RegionBroker::new(),
        }
    }

    fn eager(env: &Env, length: u64, capacity: u64) -> RegionCreated {
        env.broker
            .create(
                &env.kernel,
                None,
                length,
                capacity,
                MemoryAttrs::COMMIT,
                MASK_ANY,
            )
            .unwrap()
    }

    #[test]
    fn create_eager_attaches_length_pages() {
        let env = env(256);
        let baseline = env.mem.pmem().pages_free();

        let created = eager(&env, PS, 4 * PS);
        // One data page for the committed length; capacity is reserved
        // but unbacked.
        assert!(baseline - env.mem.pmem().pages_free() <= 1 + 3);
        assert_eq!(env.broker.length(created.handle).unwrap(), PS);
        assert_eq!(env.broker.len(), 1);
    }

    #[test]
    fn read_write_roundtrip() {
        let env = env(256);
        let created = eager(&env, 2 * PS, 2 * PS);

        let payload = [0xA5u8; 64];
        assert_eq!(
            env.broker.write(created.handle, 100, &payload).unwrap(),
            64
        );
        let mut out = [0u8; 64];
        assert_eq!(env.broker.read(created.handle, 100, &mut out).unwrap(), 64);
        assert_eq!(out, payload);
    }

    #[test]
    fn read_write_clamped_to_length() {
        let env = env(256);
        let created = eager(&env, PS, 4 * PS);

        let buf = [1u8; 256];
        // Offset within length, but the tail is clamped.
        let wrote = env.broker.write(created.handle, PS - 100, &buf).unwrap();
        assert_eq!(wrote, 100);

        // Offset beyond length is rejected outright.
        assert_eq!(
            env.broker.write(created.handle, 2 * PS, &buf),
            Err(OsError::InvalidParameters)
        );
    }

    #[test]
    fn write_beyond_length_then_resize_then_succeeds() {
        // Scenario: capacity 4 pages, length 1. A write at page 2 fails;
        // after growing to 3 pages it succeeds, and a reader observes
        // the new length via refresh without re-inheriting.
        let env = env(256);
        let created = env
            .broker
            .create(
                &env.kernel,
                None,
                PS,
                4 * PS,
                MemoryAttrs::COMMIT,
                MASK_ANY,
            )
            .unwrap();
        let handle = created.handle;

        let writer = AddressSpace::new_user(&env.kernel).unwrap();
        let reader = AddressSpace::new_user(&env.kernel).unwrap();

        let (writer_va, len) = env
            .broker
            .inherit(handle, &writer, MemoryAttrs::empty())
            .unwrap();
        assert_eq!(len, PS);
        let (reader_va, _) = env
            .broker
            .inherit(handle, &reader, MemoryAttrs::READONLY)
            .unwrap();

        assert_eq!(
            env.broker.write(handle, 2 * PS, b"A"),
            Err(OsError::InvalidParameters)
        );

        env.broker.resize(handle, &writer, writer_va, 3 * PS).unwrap();
        assert_eq!(env.broker.write(handle, 2 * PS, b"A").unwrap(), 1);

        let new_len = env.broker.refresh(handle, &reader, reader_va, PS).unwrap();
        assert_eq!(new_len, 3 * PS);

        // The reader's view now maps all three pages.
        let aligned = reader_va.align_down(PS);
        assert!(reader.query_range(aligned, 3).iter().all(Option::is_some));
    }

    #[test]
    fn resize_shrink_not_supported() {
        let env = env(256);
        let created = eager(&env, 3 * PS, 4 * PS);
        let user = AddressSpace::new_user(&env.kernel).unwrap();
        let (va, _) = env
            .broker
            .inherit(created.handle, &user, MemoryAttrs::empty())
            .unwrap();

        assert_eq!(
            env.broker.resize(created.handle, &user, va, PS),
            Err(OsError::NotSupported)
        );
    }

    #[test]
    fn resize_beyond_capacity_invalid() {
        let env = env(256);
        let created = eager(&env, PS, 4 * PS);
        let user = AddressSpace::new_user(&env.kernel).unwrap();
        let (va, _) = env
            .broker
            .inherit(created.handle, &user, MemoryAttrs::empty())
            .unwrap();

        assert_eq!(
            env.broker.resize(created.handle, &user, va, 5 * PS),
            Err(OsError::InvalidParameters)
        );
    }

    #[test]
    fn inherit_unherit_destroy_restores_accounting() {
        let env = env(256);
        let baseline = env.mem.pmem().pages_free();

        let created = eager(&env, 2 * PS, 2 * PS);
        let user = AddressSpace::new_user(&env.kernel).unwrap();
        let (va, len) = env
            .broker
            .inherit(created.handle, &user, MemoryAttrs::empty())
            .unwrap();
        assert_eq!(len, 2 * PS);

        env.broker.unherit(created.handle, &user, va).unwrap();
        assert!(env.broker.detach(created.handle).unwrap());
        drop(user);

        assert_eq!(env.mem.pmem().pages_free(), baseline);
        assert!(env.broker.is_empty());
    }

    #[test]
    fn commit_on_demand_fills_requested_pages_only() {
        let env = env(256);
        let created = env
            .broker
            .create(
                &env.kernel,
                None,
                4 * PS,
                4 * PS,
                MemoryAttrs::empty(),
                MASK_ANY,
            )
            .unwrap();
        let user = AddressSpace::new_user(&env.kernel).unwrap();
        let (va, _) = env
            .broker
            .inherit(created.handle, &user, MemoryAttrs::empty())
            .unwrap();

        env.broker
            .commit(created.handle, &user, va, va + 2 * PS, PS)
            .unwrap();

        let aligned = va.align_down(PS);
        let views = user.query_range(aligned, 4);
        assert!(views[0].is_none());
        assert!(views[1].is_none());
        assert!(views[2].is_some());
        assert!(views[3].is_none());
    }

    #[test]
    fn gap_pages_read_as_zero() {
        let env = env(256);
        let created = env
            .broker
            .create(
                &env.kernel,
                None,
                2 * PS,
                2 * PS,
                MemoryAttrs::empty(),
                MASK_ANY,
            )
            .unwrap();

        let mut out = [0xFFu8; 32];
        assert_eq!(env.broker.read(created.handle, PS, &mut out).unwrap(), 32);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn sg_list_coalesces_adjacent_pages() {
        // Scenario: pages [P, P+sz, P+2sz, Q, Q+sz] yield exactly two
        // entries (P, 3sz) and (Q, 2sz).
        let env = env(256);

        // Two separated physical runs, mapped back to back virtually.
        let p = env.mem.phys_base() + 0x40000;
        let q = env.mem.phys_base() + 0x80000;
        let frames = vec![p, p + PS, p + 2 * PS, q, q + PS];

        let user = AddressSpace::new_user(&env.kernel).unwrap();
        let va = user
            .map_fixed_frames(&frames, MemoryAttrs::USERSPACE, Placement::AnywhereProcess)
            .unwrap();

        let handle = env
            .broker
            .create_existing(&env.kernel, &user, va, 5 * PS, MemoryAttrs::empty())
            .unwrap();

        let sg = env.broker.get_sg(handle).unwrap();
        assert_eq!(sg.len(), 2);
        assert_eq!(sg[0], SgEntry { address: p, length: 3 * PS });
        assert_eq!(sg[1], SgEntry { address: q, length: 2 * PS });
    }

    #[test]
    fn adopted_buffer_keeps_sub_page_offset() {
        let env = env(256);
        let user = AddressSpace::new_user(&env.kernel).unwrap();
        let (va, frames) = user
            .map_alloc(2 * PS, MASK_ANY, MemoryAttrs::USERSPACE, Placement::AnywhereProcess)
            .unwrap();

        let buffer = va + 0x100;
        let handle = env
            .broker
            .create_existing(&env.kernel, &user, buffer, PS, MemoryAttrs::empty())
            .unwrap();

        let sg = env.broker.get_sg(handle).unwrap();
        assert_eq!(sg[0].address, frames[0] + 0x100);
        assert_eq!(sg[0].length, PS - 0x100);

        let mapping = env.broker.kernel_mapping(handle).unwrap();
        assert_eq!(mapping.as_u64() % PS, 0x100);
    }

    #[test]
    fn adopted_buffer_frames_survive_region_destroy() {
        let env = env(256);
        let user = AddressSpace::new_user(&env.kernel).unwrap();
        let (va, frames) = user
            .map_alloc(PS, MASK_ANY, MemoryAttrs::USERSPACE, Placement::AnywhereProcess)
            .unwrap();

        let handle = env
            .broker
            .create_existing(&env.kernel, &user, va, PS, MemoryAttrs::empty())
            .unwrap();
        assert!(env.broker.detach(handle).unwrap());

        // The adopting region is gone; the original mapping still works.
        assert_eq!(user.query_range(va, 1), vec![Some(frames[0])]);
    }

    #[test]
    fn attach_detach_refcounting() {
        let env = env(256);
        let created = eager(&env, PS, PS);

        assert_eq!(env.broker.attach(created.handle).unwrap(), PS);
        assert!(!env.broker.detach(created.handle).unwrap());
        assert!(env.broker.detach(created.handle).unwrap());
        assert_eq!(
            env.broker.length(created.handle),
            Err(OsError::DoesNotExist)
        );
    }

    #[test]
    fn kernel_mapping_is_stable() {
        let env = env(256);
        let created = eager(&env, PS, 4 * PS);
        let first = env.broker.kernel_mapping(created.handle).unwrap();
        let user = AddressSpace::new_user(&env.kernel).unwrap();
        let (va, _) = env
            .broker
            .inherit(created.handle, &user, MemoryAttrs::empty())
            .unwrap();
        env.broker.resize(created.handle, &user, va, 4 * PS).unwrap();
        assert_eq!(env.broker.kernel_mapping(created.handle).unwrap(), first);
    }
}
