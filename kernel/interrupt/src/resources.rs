//! Driver interrupt resources and their kernel clones.
//!
//! A driver module registering a fast handler hands over a resource
//! table: IO port ranges, memory ranges in its own space, and one
//! optional kernel handle (typically a memory region). Because the fast
//! handler runs in kernel space on whatever context was interrupted,
//! every memory entry is cloned into the kernel space at registration —
//! the handler page itself read-only and executable — and the clones
//! are what the handler receives.

use alloc::sync::Arc;

use quark_core::addr::VirtAddr;
use quark_core::id::Handle;
use quark_core::status::{OsError, OsResult};
use quark_core::{kdebug, kerror};
use quark_mm::attrs::MemoryAttrs;
use quark_mm::space::{AddressSpace, Placement};
use quark_mm::{PAGE_SIZE, page_count};

use crate::InterruptHandler;

/// IO port range entries per registration.
pub const MAX_IO_RESOURCES: usize = 2;
/// Memory range entries per registration.
pub const MAX_MEMORY_RESOURCES: usize = 2;

/// One IO port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoResource {
    /// First port of the range.
    pub base: u16,
    /// Number of ports.
    pub length: u16,
}

/// One memory range, addressed in the owner's space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryResource {
    /// Start address (any alignment).
    pub address: VirtAddr,
    /// Length in bytes.
    pub length: u64,
    /// Whether the range must be mapped uncached (device registers).
    pub nocache: bool,
}

/// The resource table a driver submits with its registration.
#[derive(Debug, Clone, Copy)]
pub struct InterruptResources {
    /// The fast handler.
    pub handler: InterruptHandler,
    /// Opaque context word passed to the handler.
    pub context: u64,
    /// Address of the handler's code page in the owner's space, for
    /// user-mode modules. Kernel registrations leave this `None`.
    pub handler_address: Option<VirtAddr>,
    /// IO port ranges the handler touches.
    pub io: [Option<IoResource>; MAX_IO_RESOURCES],
    /// Memory ranges the handler touches.
    pub memory: [Option<MemoryResource>; MAX_MEMORY_RESOURCES],
    /// A kernel handle the handler may use (e.g. a memory region).
    pub handle_resource: Handle,
}

impl InterruptResources {
    /// A kernel-mode resource table: just the handler and its context.
    #[must_use]
    pub fn kernel(handler: InterruptHandler, context: u64) -> Self {
        Self {
            handler,
            context,
            handler_address: None,
            io: [None; MAX_IO_RESOURCES],
            memory: [None; MAX_MEMORY_RESOURCES],
            handle_resource: Handle::INVALID,
        }
    }
}

/// The kernel-side table handed to the fast handler: IO shadows,
/// kernel-space clones of the memory ranges, the handle, and the
/// kernel alias of the handler page.
pub struct KernelResources {
    /// The handler entry point.
    pub handler: InterruptHandler,
    /// Opaque context word.
    pub context: u64,
    /// Validated shadow copies of the IO ranges.
    pub io: [Option<IoResource>; MAX_IO_RESOURCES],
    /// Kernel-space aliases of the memory ranges.
    pub memory: [Option<MemoryResource>; MAX_MEMORY_RESOURCES],
    /// The pass-through kernel handle.
    pub handle_resource: Handle,
    /// Kernel alias of the handler's code page.
    handler_alias: Option<VirtAddr>,
    /// Clones to tear down on release, as `(base, bytes)`.
    mappings: alloc::vec::Vec<(VirtAddr, u64)>,
    kernel_space: Option<Arc<AddressSpace>>,
}

impl KernelResources {
    /// A kernel registration's resource table: nothing to clone.
    #[must_use]
    pub fn kernel(handler: InterruptHandler, context: u64, handle_resource: Handle) -> Self {
        Self {
            handler,
            context,
            io: [None; MAX_IO_RESOURCES],
            memory: [None; MAX_MEMORY_RESOURCES],
            handle_resource,
            handler_alias: None,
            mappings: alloc::vec::Vec::new(),
            kernel_space: None,
        }
    }

    /// Kernel alias of the handler page, when one was cloned.
    #[must_use]
    pub fn handler_alias(&self) -> Option<VirtAddr> {
        self.handler_alias
    }
}

impl Drop for KernelResources {
    fn drop(&mut self) {
        let Some(kernel_space) = &self.kernel_space else {
            return;
        };
        for (base, bytes) in self.mappings.drain(..) {
            if kernel_space.unmap(base, bytes).is_err() {
                kerror!("failed to release interrupt resource clone at {}", base);
            }
        }
    }
}

/// Clones a driver's resource table into the kernel space.
///
/// The handler page is cloned read-only and executable; data ranges
/// keep their cache attribute. Partially built clones are released on
/// failure (via drop of the half-built table).
pub fn resolve_resources(
    owner: &AddressSpace,
    kernel_space: &Arc<AddressSpace>,
    source: &InterruptResources,
) -> OsResult<KernelResources> {
    let mut resolved = KernelResources {
        handler: source.handler,
        context: source.context,
        io: [None; MAX_IO_RESOURCES],
        memory: [None; MAX_MEMORY_RESOURCES],
        handle_resource: source.handle_resource,
        handler_alias: None,
        mappings: alloc::vec::Vec::new(),
        kernel_space: Some(kernel_space.clone()),
    };

    // The handler's code page, read-only and executable.
    let handler_va = source.handler_address.ok_or(OsError::InvalidParameters)?;
    let (alias, bytes) = clone_range(
        owner,
        kernel_space,
        handler_va,
        PAGE_SIZE as u64,
        MemoryAttrs::COMMIT
            | MemoryAttrs::PERSISTENT
            | MemoryAttrs::READONLY
            | MemoryAttrs::EXECUTABLE,
    )?;
    resolved.handler_alias = Some(alias);
    resolved
        .mappings
        .push((alias.align_down(PAGE_SIZE as u64), bytes));
    kdebug!("fast handler remapped to {} from {}", alias, handler_va);

    // IO ranges become validated kernel shadows.
    for (slot, io) in resolved.io.iter_mut().zip(source.io.iter()) {
        if let Some(io) = io {
            if io.length == 0 || u32::from(io.base) + u32::from(io.length) > 0x10000 {
                return Err(OsError::InvalidParameters);
            }
            *slot = Some(*io);
        }
    }

    // Memory ranges are cloned page-by-page into the kernel space.
    for (slot, entry) in resolved.memory.iter_mut().zip(source.memory.iter()) {
        let Some(entry) = entry else { continue };
        let mut attrs = MemoryAttrs::COMMIT | MemoryAttrs::PERSISTENT;
        if entry.nocache {
            attrs |= MemoryAttrs::NOCACHE;
        }
        let (alias, bytes) = clone_range(owner, kernel_space, entry.address, entry.length, attrs)?;
        *slot = Some(MemoryResource {
            address: alias,
            length: entry.length,
            nocache: entry.nocache,
        });
        resolved
            .mappings
            .push((alias.align_down(PAGE_SIZE as u64), bytes));
    }

    Ok(resolved)
}

/// Clones `[va, va+len)` from `owner` into the kernel space, preserving
/// the sub-page offset. Returns the aliased address and the page-rounded
/// byte count of the mapping.
fn clone_range(
    owner: &AddressSpace,
    kernel_space: &Arc<AddressSpace>,
    va: VirtAddr,
    len: u64,
    attrs: MemoryAttrs,
) -> OsResult<(VirtAddr, u64)> {
    let offset = va.as_u64() % PAGE_SIZE as u64;
    let base = owner.clone_to(kernel_space, va, len, attrs, Placement::AnywhereGlobal)?;
    let bytes = page_count(len + offset) * PAGE_SIZE as u64;
    Ok((base + offset, bytes))
}
