//! Platform-neutral mapping attributes and the page-table entry encoding.
//!
//! Higher layers speak [`MemoryAttrs`]; the software entry format below
//! is what an architecture backend translates to and from hardware bits.
//! An entry is in exactly one of three states:
//!
//! - **empty** — zero; the address is not part of any mapping.
//! - **reserved** — `RESERVED` set, `PRESENT` clear, no frame; the
//!   virtual range is claimed but nothing backs it.
//! - **committed** — `PRESENT` set, frame attached.

use quark_core::addr::PhysAddr;

bitflags::bitflags! {
    /// Platform-neutral mapping attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAttrs: u64 {
        /// Attach frames immediately (as opposed to reserve-only).
        const COMMIT     = 1 << 0;
        /// Accessible from user mode.
        const USERSPACE  = 1 << 1;
        /// Writes are faults.
        const READONLY   = 1 << 2;
        /// Caching disabled (device memory).
        const NOCACHE    = 1 << 3;
        /// The backing frame is not freed when the mapping is removed.
        const PERSISTENT = 1 << 4;
        /// Executable.
        const EXECUTABLE = 1 << 5;
        /// Survives address-space switches (kernel mappings).
        const GLOBAL     = 1 << 6;
        /// Written to since commit.
        const DIRTY      = 1 << 7;
    }
}

/// Raw bit positions within an entry word.
const PRESENT_BIT: u64 = 1 << 0;
const RESERVED_BIT: u64 = 1 << 1;
/// Attribute bits occupy 2..=9; frame bits 12..=51.
const ATTR_SHIFT: u32 = 2;
const ATTR_MASK: u64 = 0xFF << ATTR_SHIFT;
const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One 64-bit page-table entry in the software format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// The empty entry.
    pub const EMPTY: Self = Self(0);

    /// Creates an entry from its raw word.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw word.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Builds a reserved (claimed, unbacked) entry.
    #[must_use]
    pub fn reserved(attrs: MemoryAttrs) -> Self {
        let packed = (attrs.bits() << ATTR_SHIFT) & ATTR_MASK;
        Self(RESERVED_BIT | packed)
    }

    /// Builds a committed entry pointing at `frame`.
    #[must_use]
    pub fn committed(frame: PhysAddr, attrs: MemoryAttrs) -> Self {
        debug_assert!(frame.is_aligned(crate::PAGE_SIZE as u64));
        let packed = (attrs.bits() << ATTR_SHIFT) & ATTR_MASK;
        Self(PRESENT_BIT | RESERVED_BIT | packed | (frame.as_u64() & FRAME_MASK))
    }

    /// Builds a non-leaf entry pointing at the next-level table.
    #[must_use]
    pub fn table(frame: PhysAddr) -> Self {
        Self(PRESENT_BIT | (frame.as_u64() & FRAME_MASK))
    }

    /// `true` for the all-zero entry.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `true` if a frame is attached.
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PRESENT_BIT != 0
    }

    /// `true` if the entry is reserved but unbacked.
    #[must_use]
    pub const fn is_reserved_only(self) -> bool {
        self.0 & RESERVED_BIT != 0 && self.0 & PRESENT_BIT == 0
    }

    /// Attributes stored in the entry.
    #[must_use]
    pub fn attrs(self) -> MemoryAttrs {
        MemoryAttrs::from_bits_truncate((self.0 & ATTR_MASK) >> ATTR_SHIFT)
    }

    /// Attached frame, if present.
    #[must_use]
    pub fn frame(self) -> Option<PhysAddr> {
        if self.is_present() {
            Some(PhysAddr::new(self.0 & FRAME_MASK))
        } else {
            None
        }
    }

    /// Next-level table address for non-leaf entries.
    #[must_use]
    pub fn table_addr(self) -> Option<PhysAddr> {
        if self.is_present() {
            Some(PhysAddr::new(self.0 & FRAME_MASK))
        } else {
            None
        }
    }
}
