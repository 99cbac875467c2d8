//! Interrupt delivery and registration for the Quark kernel.
//!
//! A single table maps every vector to a chain of registrations. A
//! registration names its source line, its handler, and — for driver
//! modules — a resource table whose entries are cloned into the kernel
//! space at registration time, so the fast handler can run on the
//! interrupted context without a space switch.
//!
//! The pieces the hardware and firmware provide are traits:
//! [`InterruptController`] (mask/route/EOI/priority, the APIC on
//! supported platforms) and [`IrqRouting`] (the ACPI oracle answering
//! `_PRS`/`_CRS`/`_SRS` questions). Both are mocked in host tests.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod dispatch;
pub mod resources;
pub mod routing;
pub mod table;

pub use dispatch::{DispatchOutcome, is_interrupt_active};
pub use resources::{
    InterruptResources, IoResource, KernelResources, MAX_IO_RESOURCES, MAX_MEMORY_RESOURCES,
    MemoryResource,
};
pub use routing::IrqRouting;
pub use table::{
    DeviceInterrupt, InterruptController, InterruptDescriptor, InterruptFlags, Interrupts,
};

use core::fmt;

/// Number of interrupt table entries (vectors).
pub const MAX_INTERRUPTS: usize = 256;

/// Outcome of one chain entry's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptStatus {
    /// The device was not the source; keep walking the chain.
    NotHandled,
    /// The interrupt is serviced; stop the walk.
    Handled,
}

/// A fast interrupt handler: runs on the interrupted context, in kernel
/// space, with the pre-cloned kernel resource table.
pub type InterruptHandler = fn(&KernelResources, u64) -> InterruptStatus;

/// Identifier of one registration: the vector in the low half, a serial
/// in the high half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct InterruptId(u32);

impl InterruptId {
    pub(crate) fn new(serial: u16, table_index: usize) -> Self {
        Self((u32::from(serial) << 16) | table_index as u32)
    }

    /// The table index (vector) this registration lives at.
    #[must_use]
    pub const fn table_index(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    /// The raw identifier value.
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InterruptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
