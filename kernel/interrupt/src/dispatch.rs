//! Interrupt dispatch.
//!
//! `dispatch` is called by the architecture's vector stubs with the
//! table index of the delivered interrupt. It raises the task priority
//! to the vector, tracks per-core nesting (so nested deliveries restore
//! the right priority on the way out), walks the chain until a handler
//! claims the interrupt, and acknowledges at the controller with the
//! claiming source. A delivery nobody claims is counted and logged —
//! spurious interrupts are not fatal.
//!
//! Handlers run without the table lock: the chain is snapshotted under
//! the lock and walked afterwards, so a handler may itself register or
//! unregister interrupts.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use quark_core::cpu_local::{CpuLocal, MAX_CPUS};
use quark_core::id::IrqLine;
use quark_core::kwarn;

use crate::table::{InterruptDescriptor, Interrupts};
use crate::{InterruptStatus, MAX_INTERRUPTS};

/// Per-core dispatch state.
struct CoreIrqState {
    nesting: AtomicU32,
    saved_priority: AtomicU32,
    active: AtomicBool,
}

impl CoreIrqState {
    const fn new() -> Self {
        Self {
            nesting: AtomicU32::new(0),
            saved_priority: AtomicU32::new(0),
            active: AtomicBool::new(false),
        }
    }
}

static CORE_STATE: CpuLocal<CoreIrqState> =
    CpuLocal::new([const { CoreIrqState::new() }; MAX_CPUS]);

/// Whether the executing core is inside interrupt dispatch.
#[must_use]
pub fn is_interrupt_active() -> bool {
    CORE_STATE.get().active.load(Ordering::Acquire)
}

/// Current interrupt nesting depth on the executing core.
#[must_use]
pub fn nesting_depth() -> u32 {
    CORE_STATE.get().nesting.load(Ordering::Acquire)
}

/// Result of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Whether any chain entry claimed the interrupt.
    pub handled: bool,
    /// The claiming registration's source line.
    pub source: Option<IrqLine>,
}

impl Interrupts {
    /// Dispatches the interrupt delivered at `table_index`.
    ///
    /// The architecture stub saves the interrupted context before the
    /// call and resumes whatever context the scheduler selects after
    /// it; this function only walks the chain and talks to the
    /// controller.
    pub fn dispatch(&self, table_index: usize) -> DispatchOutcome {
        if table_index >= MAX_INTERRUPTS {
            return DispatchOutcome {
                handled: false,
                source: None,
            };
        }

        let controller = self.controller();
        let state = CORE_STATE.get();

        let entry_priority = controller.as_ref().map_or(0, |c| c.get_priority());
        if let Some(controller) = &controller {
            controller.set_priority(table_index as u32);
        }
        if state.nesting.fetch_add(1, Ordering::AcqRel) == 0 {
            state.active.store(true, Ordering::Release);
            state
                .saved_priority
                .store(entry_priority, Ordering::Release);
        }

        // Snapshot the chain; handlers run without the table lock.
        let chain: Vec<Arc<InterruptDescriptor>> = {
            let entries = self.entries.lock();
            entries[table_index].chain.clone()
        };

        let mut source = None;
        for descriptor in &chain {
            let resources = descriptor.resources();
            if (resources.handler)(resources, resources.context) == InterruptStatus::Handled {
                source = Some(descriptor.source());
                break;
            }
        }

        if source.is_none() && !chain.is_empty() {
            let mut entries = self.entries.lock();
            entries[table_index].unhandled += 1;
            kwarn!(
                "spurious interrupt at vector {} ({} deliveries unclaimed)",
                table_index,
                entries[table_index].unhandled
            );
        }

        if let Some(controller) = &controller {
            controller.acknowledge(source, table_index);
        }

        if state.nesting.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(controller) = &controller {
                controller.set_priority(state.saved_priority.load(Ordering::Acquire));
            }
            state.active.store(false, Ordering::Release);
        } else if let Some(controller) = &controller {
            controller.set_priority(entry_priority);
        }

        DispatchOutcome {
            handled: source.is_some(),
            source,
        }
    }
}
