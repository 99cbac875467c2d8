//! The kernel API surface.
//!
//! These are the operations the syscall layer and in-kernel services
//! call: thread lifecycle, memory spaces and mappings, memory regions,
//! and interrupt registration. Each call resolves its handles against
//! the [`Machine`] context and forwards to the owning subsystem — the
//! semantics live there, this module only carries the surface.

use alloc::sync::Arc;
use alloc::vec::Vec;

use quark_core::addr::VirtAddr;
use quark_core::id::Handle;
use quark_core::status::{OsError, OsResult};
use quark_interrupt::{DeviceInterrupt, InterruptDescriptor, InterruptFlags, InterruptId};
use quark_mm::attrs::MemoryAttrs;
use quark_mm::region::{RegionCreated, SgEntry};
use quark_mm::space::{AddressSpace, MappingState, Placement};
use quark_sched::ThreadFlags;

use crate::machine::Machine;

// ---------------------------------------------------------------------------
// Thread API
// ---------------------------------------------------------------------------

/// Creates a thread. `memory_space` of `INVALID` means the kernel
/// space.
pub fn create_thread(
    machine: &Machine,
    name: &str,
    entry: u64,
    argument: u64,
    flags: ThreadFlags,
    memory_space: Handle,
) -> OsResult<Handle> {
    if memory_space != Handle::INVALID {
        // The handle must resolve now; the thread stores it weakly.
        machine.space(memory_space)?;
    }
    machine
        .threading()
        .create(name, entry, argument, flags, memory_space)
}

/// Marks a thread for termination, optionally cascading to children.
pub fn terminate_thread(
    machine: &Machine,
    handle: Handle,
    exit_code: i32,
    terminate_children: bool,
) -> OsResult {
    machine
        .threading()
        .terminate(handle, exit_code, terminate_children)
}

/// Waits for a thread and returns its exit code.
pub fn join_thread(machine: &Machine, handle: Handle) -> OsResult<i32> {
    machine.threading().join(handle)
}

/// Severs a thread from its creator.
pub fn detach_thread(machine: &Machine, handle: Handle) -> OsResult {
    machine.threading().detach(handle)
}

/// Sleeps the calling thread for `ms` milliseconds.
pub fn sleep(machine: &Machine, ms: u64) -> OsResult {
    machine.threading().sleep(ms)
}

// ---------------------------------------------------------------------------
// Memory API
// ---------------------------------------------------------------------------

/// Creates a user memory space sharing the kernel half.
pub fn create_memory_space(machine: &Machine) -> OsResult<Handle> {
    let space = AddressSpace::new_user(machine.kernel_space())?;
    machine.spaces().insert(space)
}

/// Drops one reference on a memory space; the space is destroyed (its
/// user half torn down) when threads and handles are gone.
pub fn release_memory_space(machine: &Machine, handle: Handle) -> OsResult<bool> {
    machine.spaces().release(handle)
}

/// Resolves a space handle, treating `INVALID` as the kernel space.
fn resolve_space(machine: &Machine, handle: Handle) -> OsResult<Arc<AddressSpace>> {
    if handle == Handle::INVALID {
        Ok(machine.kernel_space().clone())
    } else {
        machine.space(handle)
    }
}

/// Reserves a virtual range. See
/// [`AddressSpace::reserve`](quark_mm::space::AddressSpace::reserve).
pub fn reserve(
    machine: &Machine,
    space: Handle,
    length: u64,
    attrs: MemoryAttrs,
    placement: Placement,
) -> OsResult<VirtAddr> {
    resolve_space(machine, space)?.reserve(length, attrs, placement)
}

/// Commits a reserved range with fresh frames below `mask`.
pub fn commit(
    machine: &Machine,
    space: Handle,
    address: VirtAddr,
    length: u64,
    mask: u64,
) -> OsResult<Vec<quark_core::addr::PhysAddr>> {
    resolve_space(machine, space)?.commit_alloc(address, length, mask)
}

/// Reserve-and-commit in one call. Returns the mapped base.
pub fn map(
    machine: &Machine,
    space: Handle,
    length: u64,
    mask: u64,
    attrs: MemoryAttrs,
    placement: Placement,
) -> OsResult<VirtAddr> {
    let space = resolve_space(machine, space)?;
    let (base, _frames) = space.map_alloc(length, mask, attrs, placement)?;
    Ok(base)
}

/// Removes mappings.
pub fn unmap(machine: &Machine, space: Handle, address: VirtAddr, length: u64) -> OsResult {
    resolve_space(machine, space)?.unmap(address, length)
}

/// Reads one page's mapping state.
pub fn query(machine: &Machine, space: Handle, address: VirtAddr) -> OsResult<MappingState> {
    Ok(resolve_space(machine, space)?.query(address))
}

// ---------------------------------------------------------------------------
// Memory region API
// ---------------------------------------------------------------------------

/// Creates a region; the caller's space gets a view when `space` is
/// given.
pub fn region_create(
    machine: &Machine,
    space: Option<Handle>,
    length: u64,
    capacity: u64,
    flags: MemoryAttrs,
    page_mask: u64,
) -> OsResult<RegionCreated> {
    let user = match space {
        Some(handle) => Some(resolve_space(machine, handle)?),
        None => None,
    };
    machine.regions().create(
        machine.kernel_space(),
        user.as_deref(),
        length,
        capacity,
        flags,
        page_mask,
    )
}

/// Adopts an existing buffer of the caller's space as a region.
pub fn region_create_existing(
    machine: &Machine,
    space: Handle,
    address: VirtAddr,
    size: u64,
    flags: MemoryAttrs,
) -> OsResult<Handle> {
    let space = resolve_space(machine, space)?;
    machine
        .regions()
        .create_existing(machine.kernel_space(), &space, address, size, flags)
}

/// References a region and reports its length.
pub fn region_attach(machine: &Machine, handle: Handle) -> OsResult<u64> {
    machine.regions().attach(handle)
}

/// Maps a region into the caller's space.
pub fn region_inherit(
    machine: &Machine,
    handle: Handle,
    space: Handle,
    access: MemoryAttrs,
) -> OsResult<(VirtAddr, u64)> {
    let space = resolve_space(machine, space)?;
    machine.regions().inherit(handle, &space, access)
}

/// Removes the caller's view of a region.
pub fn region_unherit(
    machine: &Machine,
    handle: Handle,
    space: Handle,
    address: VirtAddr,
) -> OsResult {
    let space = resolve_space(machine, space)?;
    machine.regions().unherit(handle, &space, address)
}

/// Grows a region. Shrink is `NotSupported`.
pub fn region_resize(
    machine: &Machine,
    handle: Handle,
    space: Handle,
    address: VirtAddr,
    new_length: u64,
) -> OsResult {
    let space = resolve_space(machine, space)?;
    machine.regions().resize(handle, &space, address, new_length)
}

/// Catches a reader's view up with a grown region.
pub fn region_refresh(
    machine: &Machine,
    handle: Handle,
    space: Handle,
    address: VirtAddr,
    previous_length: u64,
) -> OsResult<u64> {
    let space = resolve_space(machine, space)?;
    machine
        .regions()
        .refresh(handle, &space, address, previous_length)
}

/// On-demand commit for a sparse region.
pub fn region_commit(
    machine: &Machine,
    handle: Handle,
    space: Handle,
    view_base: VirtAddr,
    at: VirtAddr,
    length: u64,
) -> OsResult {
    let space = resolve_space(machine, space)?;
    machine
        .regions()
        .commit(handle, &space, view_base, at, length)
}

/// Copies out of a region.
pub fn region_read(
    machine: &Machine,
    handle: Handle,
    offset: u64,
    buffer: &mut [u8],
) -> OsResult<usize> {
    machine.regions().read(handle, offset, buffer)
}

/// Copies into a region.
pub fn region_write(
    machine: &Machine,
    handle: Handle,
    offset: u64,
    buffer: &[u8],
) -> OsResult<usize> {
    machine.regions().write(handle, offset, buffer)
}

/// Exports a region's coalesced scatter-gather list.
pub fn region_get_sg(machine: &Machine, handle: Handle) -> OsResult<Vec<SgEntry>> {
    machine.regions().get_sg(handle)
}

/// The permanent kernel view of a region.
pub fn region_kernel_mapping(machine: &Machine, handle: Handle) -> OsResult<VirtAddr> {
    machine.regions().kernel_mapping(handle)
}

/// Releases one region reference.
pub fn region_detach(machine: &Machine, handle: Handle) -> OsResult<bool> {
    machine.regions().detach(handle)
}

// ---------------------------------------------------------------------------
// Interrupt API
// ---------------------------------------------------------------------------

/// Registers an interrupt for the calling driver or kernel service.
/// Driver registrations (`KERNEL` absent) name the module and its
/// space, which the resource clones are taken from.
pub fn interrupt_register(
    machine: &Machine,
    device: &DeviceInterrupt,
    flags: InterruptFlags,
    module: Option<(Handle, Handle)>,
) -> OsResult<InterruptId> {
    let owner = machine.threading().current().unwrap_or(Handle::INVALID);
    match module {
        Some((module, space_handle)) => {
            let space = resolve_space(machine, space_handle)?;
            machine
                .interrupts()
                .register(device, flags, owner, Some((module, &space)))
        }
        None => {
            if !flags.contains(InterruptFlags::KERNEL) {
                return Err(OsError::InvalidParameters);
            }
            machine.interrupts().register(device, flags, owner, None)
        }
    }
}

/// Removes an interrupt registration.
pub fn interrupt_unregister(machine: &Machine, id: InterruptId) -> OsResult {
    machine.interrupts().unregister(id)
}

/// Looks up an interrupt registration.
pub fn interrupt_get(machine: &Machine, id: InterruptId) -> OsResult<Arc<InterruptDescriptor>> {
    machine.interrupts().get(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::tests::BootArena;
    use crate::boot::bsp_init;
    use quark_core::id::IrqLine;
    use quark_interrupt::{InterruptResources, InterruptStatus, KernelResources};
    use quark_mm::PAGE_SIZE;
    use quark_mm::phys::MASK_ANY;

    const PS: u64 = PAGE_SIZE as u64;

    fn machine(arena: &BootArena) -> Arc<Machine> {
        bsp_init(&arena.vboot(), 1).unwrap()
    }

    fn claiming(_r: &KernelResources, _c: u64) -> InterruptStatus {
        InterruptStatus::Handled
    }

    #[test]
    fn thread_lifecycle_through_the_api() {
        let arena = BootArena::new(512);
        let machine = machine(&arena);

        let handle = create_thread(
            &machine,
            "svc",
            0x1000,
            0,
            ThreadFlags::empty(),
            Handle::INVALID,
        )
        .unwrap();

        terminate_thread(&machine, handle, 3, false).unwrap();
        assert_eq!(join_thread(&machine, handle).unwrap(), 3);
    }

    #[test]
    fn memory_space_and_mapping_roundtrip() {
        let arena = BootArena::new(512);
        let machine = machine(&arena);

        let space = create_memory_space(&machine).unwrap();
        let base = map(
            &machine,
            space,
            2 * PS,
            MASK_ANY,
            MemoryAttrs::USERSPACE,
            Placement::AnywhereProcess,
        )
        .unwrap();

        assert!(matches!(
            query(&machine, space, base).unwrap(),
            MappingState::Committed(..)
        ));
        unmap(&machine, space, base, 2 * PS).unwrap();
        assert_eq!(query(&machine, space, base).unwrap(), MappingState::None);
        release_memory_space(&machine, space).unwrap();
    }

    #[test]
    fn region_grow_and_refresh_through_the_api() {
        let arena = BootArena::new(512);
        let machine = machine(&arena);

        let created = region_create(
            &machine,
            None,
            PS,
            4 * PS,
            MemoryAttrs::COMMIT,
            MASK_ANY,
        )
        .unwrap();

        let writer = create_memory_space(&machine).unwrap();
        let reader = create_memory_space(&machine).unwrap();
        let (wva, len) = region_inherit(&machine, created.handle, writer, MemoryAttrs::empty())
            .unwrap();
        assert_eq!(len, PS);
        let (rva, _) =
            region_inherit(&machine, created.handle, reader, MemoryAttrs::READONLY).unwrap();

        region_resize(&machine, created.handle, writer, wva, 3 * PS).unwrap();
        assert_eq!(
            region_refresh(&machine, created.handle, reader, rva, PS).unwrap(),
            3 * PS
        );

        assert_eq!(region_write(&machine, created.handle, 2 * PS, b"A").unwrap(), 1);
        let mut buf = [0u8; 1];
        region_read(&machine, created.handle, 2 * PS, &mut buf).unwrap();
        assert_eq!(&buf, b"A");
    }

    #[test]
    fn interrupt_register_through_the_api() {
        let arena = BootArena::new(512);
        let machine = machine(&arena);

        let device = DeviceInterrupt {
            line: IrqLine::new(5),
            pin: 0,
            acpi_conform: false,
            resources: InterruptResources::kernel(claiming, 0),
        };
        let id = interrupt_register(&machine, &device, InterruptFlags::KERNEL, None).unwrap();
        assert!(interrupt_get(&machine, id).is_ok());
        assert!(machine.interrupts().dispatch(id.table_index()).handled);
        interrupt_unregister(&machine, id).unwrap();
        assert_eq!(interrupt_get(&machine, id).err(), Some(OsError::DoesNotExist));
    }

    #[test]
    fn driver_registration_without_module_is_invalid() {
        let arena = BootArena::new(512);
        let machine = machine(&arena);
        let device = DeviceInterrupt {
            line: IrqLine::new(5),
            pin: 0,
            acpi_conform: false,
            resources: InterruptResources::kernel(claiming, 0),
        };
        assert_eq!(
            interrupt_register(&machine, &device, InterruptFlags::empty(), None).err(),
            Some(OsError::InvalidParameters)
        );
    }
}
