//! The interrupt table: registration, sharing, penalties.
//!
//! One entry per vector, each holding a chain of registrations. A chain
//! is exclusive or shared as its first installer decided; an exclusive
//! request against a populated chain fails, as does joining an
//! exclusive chain. Penalties count registrations per entry and feed
//! the least-loaded routing decision.
//!
//! Mutation takes the single table lock (IRQ-disabled). Dispatch never
//! holds it while running handlers: it snapshots the chain under the
//! lock and walks the snapshot.

use alloc::sync::Arc;
use alloc::vec::Vec;

use quark_core::id::{Handle, IrqLine};
use quark_core::status::{OsError, OsResult};
use quark_core::sync::{IrqSpinLock, SpinLock};
use quark_core::{kdebug, kerror};
use quark_mm::space::AddressSpace;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::resources::{InterruptResources, KernelResources, resolve_resources};
use crate::routing::{IrqRouting, least_loaded, resolve_acpi};
use crate::{InterruptId, MAX_INTERRUPTS};

bitflags::bitflags! {
    /// Registration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptFlags: u32 {
        /// The handler runs in kernel mode; no resource cloning.
        const KERNEL = 1 << 0;
        /// The caller demands sole ownership of the vector.
        const EXCLUSIVE = 1 << 1;
    }
}

/// What a driver (or the kernel) submits to register an interrupt.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInterrupt {
    /// The interrupt line at the controller.
    pub line: IrqLine,
    /// The pin, for ACPI-routed PCI sources.
    pub pin: u8,
    /// Whether `(line, pin)` must be resolved through the ACPI oracle.
    pub acpi_conform: bool,
    /// Handler and resources.
    pub resources: InterruptResources,
}

/// The platform interrupt controller, as the table needs it.
pub trait InterruptController {
    /// Routes and unmasks (or masks) the descriptor's source.
    fn configure(&self, descriptor: &InterruptDescriptor, enable: bool) -> OsResult;
    /// Current task priority.
    fn get_priority(&self) -> u32;
    /// Sets the task priority.
    fn set_priority(&self, priority: u32);
    /// Signals end-of-interrupt for `(source, table_index)`.
    fn acknowledge(&self, source: Option<IrqLine>, table_index: usize);
}

/// One registration in a vector's chain.
pub struct InterruptDescriptor {
    id: InterruptId,
    source: IrqLine,
    table_index: usize,
    flags: InterruptFlags,
    /// Registering module, `INVALID` for kernel registrations.
    module: Handle,
    /// Registering thread.
    owner: Handle,
    resources: KernelResources,
}

impl InterruptDescriptor {
    /// The registration's identifier.
    #[must_use]
    pub fn id(&self) -> InterruptId {
        self.id
    }

    /// The source line.
    #[must_use]
    pub fn source(&self) -> IrqLine {
        self.source
    }

    /// The vector this registration is chained at.
    #[must_use]
    pub fn table_index(&self) -> usize {
        self.table_index
    }

    /// Registration flags.
    #[must_use]
    pub fn flags(&self) -> InterruptFlags {
        self.flags
    }

    /// The registering module (`INVALID` for the kernel).
    #[must_use]
    pub fn module(&self) -> Handle {
        self.module
    }

    /// The registering thread.
    #[must_use]
    pub fn owner(&self) -> Handle {
        self.owner
    }

    /// The kernel-side resource table the fast handler receives.
    #[must_use]
    pub fn resources(&self) -> &KernelResources {
        &self.resources
    }
}

pub(crate) struct TableEntry {
    pub(crate) chain: Vec<Arc<InterruptDescriptor>>,
    pub(crate) sharable: bool,
    pub(crate) penalty: i32,
    /// Deliveries nobody in the chain claimed.
    pub(crate) unhandled: u64,
}

impl TableEntry {
    const fn new() -> Self {
        Self {
            chain: Vec::new(),
            sharable: true,
            penalty: 0,
            unhandled: 0,
        }
    }
}

/// The interrupt subsystem: table, id generation, and the hooks into
/// the controller, the routing oracle and the kernel address space.
pub struct Interrupts {
    pub(crate) entries: IrqSpinLock<[TableEntry; MAX_INTERRUPTS]>,
    serial: AtomicU16,
    controller: SpinLock<Option<Arc<dyn InterruptController + Send + Sync>>>,
    routing: SpinLock<Option<Arc<dyn IrqRouting + Send + Sync>>>,
    kernel_space: SpinLock<Option<Arc<AddressSpace>>>,
}

impl Interrupts {
    /// Creates an empty subsystem. The controller, oracle and kernel
    /// space are wired in during boot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: IrqSpinLock::new([const { TableEntry::new() }; MAX_INTERRUPTS]),
            serial: AtomicU16::new(1),
            controller: SpinLock::new(None),
            routing: SpinLock::new(None),
            kernel_space: SpinLock::new(None),
        }
    }

    /// Installs the platform controller.
    pub fn set_controller(&self, controller: Arc<dyn InterruptController + Send + Sync>) {
        *self.controller.lock() = Some(controller);
    }

    /// Installs the ACPI routing oracle.
    pub fn set_routing(&self, routing: Arc<dyn IrqRouting + Send + Sync>) {
        *self.routing.lock() = Some(routing);
    }

    /// Installs the kernel address space used for resource clones.
    pub fn set_kernel_space(&self, space: Arc<AddressSpace>) {
        *self.kernel_space.lock() = Some(space);
    }

    pub(crate) fn controller(&self) -> Option<Arc<dyn InterruptController + Send + Sync>> {
        self.controller.lock().clone()
    }

    /// Registers an interrupt.
    ///
    /// Resolves the vector (directly from the line, or through the
    /// oracle for ACPI-conformant sources), clones user resources into
    /// the kernel space, enforces the sharing rules, prepends to the
    /// chain and bumps the penalty. The first installer also programs
    /// the controller.
    ///
    /// `owner_space` carries the registering module: `Some((module,
    /// space))` for driver registrations, `None` for kernel ones
    /// (`KERNEL` flag implied).
    pub fn register(
        &self,
        device: &DeviceInterrupt,
        flags: InterruptFlags,
        owner: Handle,
        owner_space: Option<(Handle, &AddressSpace)>,
    ) -> OsResult<InterruptId> {
        let table_index = self.resolve_index(device)?;
        if table_index >= MAX_INTERRUPTS {
            return Err(OsError::InvalidParameters);
        }

        // Sharing rules first — cheap to check, and failing them must
        // not leave cloned resources behind.
        {
            let entries = self.entries.lock();
            let entry = &entries[table_index];
            if !entry.chain.is_empty() {
                if flags.contains(InterruptFlags::EXCLUSIVE) {
                    kerror!("vector {} already populated, exclusive denied", table_index);
                    return Err(OsError::Exists);
                }
                if !entry.sharable {
                    kerror!("vector {} is exclusively owned", table_index);
                    return Err(OsError::Busy);
                }
            }
        }

        // Driver registrations get kernel clones of their resources.
        let resources = match owner_space {
            Some((module, space)) if !flags.contains(InterruptFlags::KERNEL) => {
                let kernel_space = self
                    .kernel_space
                    .lock()
                    .clone()
                    .ok_or(OsError::NotSupported)?;
                let resolved = resolve_resources(space, &kernel_space, &device.resources)?;
                (module, resolved)
            }
            _ => (
                Handle::INVALID,
                KernelResources::kernel(
                    device.resources.handler,
                    device.resources.context,
                    device.resources.handle_resource,
                ),
            ),
        };
        let (module, resources) = resources;

        let serial = self.serial.fetch_add(1, Ordering::AcqRel);
        let descriptor = Arc::new(InterruptDescriptor {
            id: InterruptId::new(serial, table_index),
            source: device.line,
            table_index,
            flags,
            module,
            owner,
            resources,
        });

        let first_installer;
        {
            let mut entries = self.entries.lock();
            let entry = &mut entries[table_index];
            // Re-check: another registration may have raced us.
            if !entry.chain.is_empty() {
                if flags.contains(InterruptFlags::EXCLUSIVE) {
                    return Err(OsError::Exists);
                }
                if !entry.sharable {
                    return Err(OsError::Busy);
                }
            }
            first_installer = entry.chain.is_empty();
            entry.chain.insert(0, descriptor.clone());
            if first_installer {
                entry.sharable = !flags.contains(InterruptFlags::EXCLUSIVE);
                entry.penalty = 1;
            } else {
                entry.penalty += 1;
            }
        }

        if first_installer {
            if let Some(controller) = self.controller() {
                if let Err(err) = controller.configure(&descriptor, true) {
                    kerror!("failed to enable {}: {}", descriptor.source, err);
                }
            }
        }

        kdebug!(
            "interrupt {} registered at vector {} (line {})",
            descriptor.id,
            table_index,
            device.line
        );
        Ok(descriptor.id)
    }

    /// Removes a registration. The penalty drops with it; the last
    /// registration of a vector also masks the source at the
    /// controller. The descriptor's resource clones are released when
    /// the last reference to it goes away.
    pub fn unregister(&self, id: InterruptId) -> OsResult {
        let table_index = id.table_index();
        if table_index >= MAX_INTERRUPTS {
            return Err(OsError::InvalidParameters);
        }

        let removed;
        let now_empty;
        {
            let mut entries = self.entries.lock();
            let entry = &mut entries[table_index];
            let pos = entry
                .chain
                .iter()
                .position(|d| d.id == id)
                .ok_or(OsError::DoesNotExist)?;
            removed = entry.chain.remove(pos);
            entry.penalty -= 1;
            now_empty = entry.chain.is_empty();
            if now_empty {
                entry.sharable = true;
            }
        }

        if now_empty {
            if let Some(controller) = self.controller() {
                if let Err(err) = controller.configure(&removed, false) {
                    kerror!("failed to mask {}: {}", removed.source, err);
                }
            }
        }
        Ok(())
    }

    /// Looks up a registration by id.
    pub fn get(&self, id: InterruptId) -> OsResult<Arc<InterruptDescriptor>> {
        let table_index = id.table_index();
        if table_index >= MAX_INTERRUPTS {
            return Err(OsError::InvalidParameters);
        }
        let entries = self.entries.lock();
        entries[table_index]
            .chain
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or(OsError::DoesNotExist)
    }

    /// The registration penalty of a table entry, or `None` when the
    /// entry is exclusively owned (unusable for routing).
    #[must_use]
    pub fn penalty(&self, index: usize) -> Option<i32> {
        if index >= MAX_INTERRUPTS {
            return None;
        }
        let entries = self.entries.lock();
        let entry = &entries[index];
        if !entry.sharable && entry.penalty > 0 {
            return None;
        }
        Some(entry.penalty)
    }

    /// Chain length at a vector (diagnostics and tests).
    #[must_use]
    pub fn chain_len(&self, index: usize) -> usize {
        self.entries.lock()[index].chain.len()
    }

    /// Unclaimed deliveries at a vector.
    #[must_use]
    pub fn unhandled_count(&self, index: usize) -> u64 {
        self.entries.lock()[index].unhandled
    }

    /// Picks the least loaded of `candidates` by penalty.
    #[must_use]
    pub fn least_loaded(&self, candidates: &[IrqLine]) -> Option<IrqLine> {
        least_loaded(candidates, |irq| self.penalty(irq.as_usize()))
    }

    /// Resolves the table index for a source.
    fn resolve_index(&self, device: &DeviceInterrupt) -> OsResult<usize> {
        if !device.acpi_conform {
            return Ok(device.line.as_usize());
        }
        let routing = self.routing.lock().clone().ok_or(OsError::NotSupported)?;
        let line = resolve_acpi(routing.as_ref(), device.line, device.pin, |irq| {
            self.penalty(irq.as_usize())
        })?;
        Ok(line.as_usize())
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InterruptStatus, KernelResources};
    use std::sync::Mutex as StdMutex;

    fn noop(_resources: &KernelResources, _context: u64) -> InterruptStatus {
        InterruptStatus::Handled
    }

    fn kernel_device(line: u32) -> DeviceInterrupt {
        DeviceInterrupt {
            line: IrqLine::new(line),
            pin: 0,
            acpi_conform: false,
            resources: InterruptResources::kernel(noop, 0),
        }
    }

    fn register_kernel(
        interrupts: &Interrupts,
        line: u32,
        flags: InterruptFlags,
    ) -> OsResult<InterruptId> {
        interrupts.register(
            &kernel_device(line),
            flags | InterruptFlags::KERNEL,
            Handle::INVALID,
            None,
        )
    }

    #[test]
    fn register_and_get() {
        let interrupts = Interrupts::new();
        let id = register_kernel(&interrupts, 5, InterruptFlags::empty()).unwrap();
        let descriptor = interrupts.get(id).unwrap();
        assert_eq!(descriptor.source(), IrqLine::new(5));
        assert_eq!(descriptor.table_index(), 5);
        assert_eq!(interrupts.chain_len(5), 1);
        assert_eq!(interrupts.penalty(5), Some(1));
    }

    #[test]
    fn sharing_rules() {
        // Scenario: A (shared) then B (shared) succeed on source 11;
        // C (exclusive) fails with Exists; A and B stay reachable.
        let interrupts = Interrupts::new();
        let a = register_kernel(&interrupts, 11, InterruptFlags::empty()).unwrap();
        let b = register_kernel(&interrupts, 11, InterruptFlags::empty()).unwrap();

        let c = register_kernel(&interrupts, 11, InterruptFlags::EXCLUSIVE);
        assert_eq!(c, Err(OsError::Exists));

        assert_eq!(interrupts.chain_len(11), 2);
        assert!(interrupts.get(a).is_ok());
        assert!(interrupts.get(b).is_ok());
        assert_eq!(interrupts.penalty(11), Some(2));
    }

    #[test]
    fn exclusive_chain_rejects_joiners() {
        let interrupts = Interrupts::new();
        register_kernel(&interrupts, 7, InterruptFlags::EXCLUSIVE).unwrap();
        assert_eq!(
            register_kernel(&interrupts, 7, InterruptFlags::empty()),
            Err(OsError::Busy)
        );
        // An exclusively owned entry is unusable for routing.
        assert_eq!(interrupts.penalty(7), None);
    }

    #[test]
    fn register_unregister_roundtrip() {
        let interrupts = Interrupts::new();
        let before_penalty = interrupts.penalty(9);
        let before_len = interrupts.chain_len(9);

        let id = register_kernel(&interrupts, 9, InterruptFlags::empty()).unwrap();
        interrupts.unregister(id).unwrap();

        assert_eq!(interrupts.penalty(9), before_penalty);
        assert_eq!(interrupts.chain_len(9), before_len);
        assert!(matches!(interrupts.get(id), Err(OsError::DoesNotExist)));
        // Unregistering again reports the absence.
        assert_eq!(interrupts.unregister(id), Err(OsError::DoesNotExist));
    }

    #[test]
    fn chain_prepends_new_registrations() {
        let interrupts = Interrupts::new();
        let first = register_kernel(&interrupts, 4, InterruptFlags::empty()).unwrap();
        let second = register_kernel(&interrupts, 4, InterruptFlags::empty()).unwrap();

        let entries = interrupts.entries.lock();
        assert_eq!(entries[4].chain[0].id(), second);
        assert_eq!(entries[4].chain[1].id(), first);
    }

    #[test]
    fn exclusive_becomes_available_after_unregister() {
        let interrupts = Interrupts::new();
        let id = register_kernel(&interrupts, 3, InterruptFlags::EXCLUSIVE).unwrap();
        assert_eq!(interrupts.penalty(3), None);

        interrupts.unregister(id).unwrap();
        assert_eq!(interrupts.penalty(3), Some(0));
        register_kernel(&interrupts, 3, InterruptFlags::empty()).unwrap();
    }

    #[test]
    fn least_loaded_reflects_registrations() {
        // Scenario: candidates {10, 11, 12} with penalties {3, 1, 2};
        // 11 is selected, and registering on it bumps the penalty to 2.
        let interrupts = Interrupts::new();
        for _ in 0..3 {
            register_kernel(&interrupts, 10, InterruptFlags::empty()).unwrap();
        }
        register_kernel(&interrupts, 11, InterruptFlags::empty()).unwrap();
        for _ in 0..2 {
            register_kernel(&interrupts, 12, InterruptFlags::empty()).unwrap();
        }

        let candidates = [IrqLine::new(10), IrqLine::new(11), IrqLine::new(12)];
        let chosen = interrupts.least_loaded(&candidates).unwrap();
        assert_eq!(chosen, IrqLine::new(11));

        register_kernel(&interrupts, chosen.as_u32(), InterruptFlags::empty()).unwrap();
        assert_eq!(interrupts.penalty(11), Some(2));
    }

    // -----------------------------------------------------------------------
    // Controller interaction
    // -----------------------------------------------------------------------

    struct MockController {
        log: StdMutex<Vec<(u32, bool)>>,
    }

    impl InterruptController for MockController {
        fn configure(&self, descriptor: &InterruptDescriptor, enable: bool) -> OsResult {
            self.log
                .lock()
                .unwrap()
                .push((descriptor.source().as_u32(), enable));
            Ok(())
        }
        fn get_priority(&self) -> u32 {
            0
        }
        fn set_priority(&self, _priority: u32) {}
        fn acknowledge(&self, _source: Option<IrqLine>, _table_index: usize) {}
    }

    #[test]
    fn controller_programs_first_and_last_only() {
        let interrupts = Interrupts::new();
        let controller = Arc::new(MockController {
            log: StdMutex::new(Vec::new()),
        });
        interrupts.set_controller(controller.clone());

        let a = register_kernel(&interrupts, 6, InterruptFlags::empty()).unwrap();
        let b = register_kernel(&interrupts, 6, InterruptFlags::empty()).unwrap();
        assert_eq!(*controller.log.lock().unwrap(), vec![(6, true)]);

        interrupts.unregister(b).unwrap();
        assert_eq!(controller.log.lock().unwrap().len(), 1);
        interrupts.unregister(a).unwrap();
        assert_eq!(*controller.log.lock().unwrap(), vec![(6, true), (6, false)]);
    }

    // -----------------------------------------------------------------------
    // ACPI routing
    // -----------------------------------------------------------------------

    struct MockRouting {
        current: Option<IrqLine>,
        possible: Vec<IrqLine>,
        programmed: StdMutex<Option<IrqLine>>,
    }

    impl IrqRouting for MockRouting {
        fn possible_irqs(&self, _line: IrqLine, _pin: u8) -> Vec<IrqLine> {
            self.possible.clone()
        }
        fn current_irq(&self, _line: IrqLine, _pin: u8) -> Option<IrqLine> {
            self.current
        }
        fn set_irq(&self, _line: IrqLine, _pin: u8, irq: IrqLine) -> OsResult {
            *self.programmed.lock().unwrap() = Some(irq);
            Ok(())
        }
    }

    #[test]
    fn acpi_source_uses_current_line_when_programmed() {
        let interrupts = Interrupts::new();
        interrupts.set_routing(Arc::new(MockRouting {
            current: Some(IrqLine::new(9)),
            possible: vec![IrqLine::new(9), IrqLine::new(10)],
            programmed: StdMutex::new(None),
        }));

        let device = DeviceInterrupt {
            acpi_conform: true,
            ..kernel_device(0)
        };
        let id = interrupts
            .register(&device, InterruptFlags::KERNEL, Handle::INVALID, None)
            .unwrap();
        assert_eq!(id.table_index(), 9);
    }

    #[test]
    fn acpi_source_picks_least_loaded_and_writes_back() {
        let interrupts = Interrupts::new();
        // Pre-load line 10 so 11 is the lighter choice.
        register_kernel(&interrupts, 10, InterruptFlags::empty()).unwrap();

        let routing = Arc::new(MockRouting {
            current: None,
            possible: vec![IrqLine::new(10), IrqLine::new(11)],
            programmed: StdMutex::new(None),
        });
        interrupts.set_routing(routing.clone());

        let device = DeviceInterrupt {
            acpi_conform: true,
            ..kernel_device(0)
        };
        let id = interrupts
            .register(&device, InterruptFlags::KERNEL, Handle::INVALID, None)
            .unwrap();
        assert_eq!(id.table_index(), 11);
        assert_eq!(*routing.programmed.lock().unwrap(), Some(IrqLine::new(11)));
        assert_eq!(interrupts.penalty(11), Some(1));
    }
}
