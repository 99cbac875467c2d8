//! Memory management for the Quark kernel.
//!
//! Three layers, leaves first:
//!
//! - [`phys`] — the physical memory allocator: per-mask LIFO frame
//!   stacks that respect DMA address constraints.
//! - [`space`] (with [`table`], [`attrs`], [`range`]) — the virtual
//!   memory manager: address-space objects over software-walked page
//!   tables with per-entry compare-and-swap, a reserve/commit model,
//!   and virtual range allocators for kernel-global and per-process
//!   placements.
//! - [`region`] — the memory region broker: handle-identified shared
//!   buffers with a permanent kernel view, per-process user views,
//!   grow/refresh/commit-on-demand, and scatter-gather export.
//!
//! Physical memory is reached through each component's direct-map
//! translation (see [`phys::PhysicalMemory::phys_to_virt`]), which on
//! the host is backed by a plain allocation — all of this crate's logic
//! runs under `cargo test`.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

#[cfg(all(feature = "testing", not(test)))]
extern crate std;

pub mod attrs;
pub mod phys;
pub mod range;
pub mod region;
pub mod space;
pub mod table;
pub mod tlb;

#[cfg(any(test, feature = "testing"))]
pub mod testutil;

/// Page size used by all supported platforms.
pub const PAGE_SIZE: usize = 4096;

/// Mask for offsets within a page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// A run of physical memory reported by the boot loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysMemoryRegion {
    /// First byte of the run.
    pub start: quark_core::addr::PhysAddr,
    /// Length of the run in bytes.
    pub size: u64,
    /// Whether the run is free for allocation.
    pub usable: bool,
}

/// Divides `value` by `divisor`, rounding up.
#[inline]
#[must_use]
pub const fn div_up(value: u64, divisor: u64) -> u64 {
    value.div_ceil(divisor)
}

/// Number of whole pages covering `bytes`.
#[inline]
#[must_use]
pub const fn page_count(bytes: u64) -> u64 {
    div_up(bytes, PAGE_SIZE as u64)
}
