//! IRQ routing through the ACPI oracle.
//!
//! The ACPI interpreter is an external collaborator: it answers which
//! interrupt lines a PCI link can use (`_PRS`), which one it currently
//! uses (`_CRS`), and accepts a selection (`_SRS`). This module only
//! consumes those answers — when no current line is programmed, the
//! least loaded candidate (by registration penalty) is chosen and
//! written back.

use alloc::vec::Vec;

use quark_core::id::IrqLine;
use quark_core::status::{OsError, OsResult};
use quark_core::{kdebug, kwarn};

/// The ACPI oracle for interrupt link routing.
pub trait IrqRouting {
    /// Possible lines for `(line, pin)`, from `_PRS`.
    fn possible_irqs(&self, line: IrqLine, pin: u8) -> Vec<IrqLine>;
    /// The currently programmed line, from `_CRS`.
    fn current_irq(&self, line: IrqLine, pin: u8) -> Option<IrqLine>;
    /// Programs `irq` for the link, via `_SRS`.
    fn set_irq(&self, line: IrqLine, pin: u8, irq: IrqLine) -> OsResult;
}

/// Resolves the table index for an ACPI-conformant source: the current
/// line when one is programmed, otherwise the least loaded candidate
/// (per `penalty_of`), which is then written back through `_SRS`.
pub(crate) fn resolve_acpi(
    routing: &dyn IrqRouting,
    line: IrqLine,
    pin: u8,
    penalty_of: impl Fn(IrqLine) -> Option<i32>,
) -> OsResult<IrqLine> {
    if let Some(current) = routing.current_irq(line, pin) {
        kdebug!("{} pin {} already routed to {}", line, pin, current);
        return Ok(current);
    }

    let candidates = routing.possible_irqs(line, pin);
    let chosen = least_loaded(&candidates, penalty_of).ok_or_else(|| {
        kwarn!("{} pin {} has no usable candidate line", line, pin);
        OsError::DoesNotExist
    })?;

    routing.set_irq(line, pin, chosen)?;
    kdebug!("{} pin {} routed to {}", line, pin, chosen);
    Ok(chosen)
}

/// Picks the candidate with the smallest penalty. Candidates whose
/// penalty is unavailable (exclusively owned lines) are skipped.
pub fn least_loaded(
    candidates: &[IrqLine],
    penalty_of: impl Fn(IrqLine) -> Option<i32>,
) -> Option<IrqLine> {
    let mut best = None;
    for &candidate in candidates {
        let Some(penalty) = penalty_of(candidate) else {
            continue;
        };
        match best {
            Some((_, best_penalty)) if penalty >= best_penalty => {}
            _ => best = Some((candidate, penalty)),
        }
    }
    best.map(|(irq, _)| irq)
}
