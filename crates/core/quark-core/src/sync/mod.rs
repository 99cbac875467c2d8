//! Synchronization primitives.
//!
//! [`SpinLock`] is the plain TTAS lock for data never touched from
//! interrupt context. [`IrqSpinLock`] additionally disables interrupts
//! while held and is the only lock allowed inside interrupt handlers.
//! [`Mutex`] may block (it yields through a registered hook while
//! contended) and guards data whose critical sections are too long to
//! spin through, such as memory regions.

mod irq_spinlock;
mod mutex;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use mutex::{Mutex, MutexGuard, set_yield_fn};
pub use spinlock::{SpinLock, SpinLockGuard};
