//! Thread scheduling for the Quark kernel.
//!
//! One multilevel-feedback scheduler per core, with periodic boost to
//! prevent starvation. Every schedulable entity is a
//! [`SchedulerObject`](object::SchedulerObject) whose lifecycle is an
//! explicit state machine driven by compare-and-swap — there is no
//! transition outside the table in [`object`], and an illegal event is
//! reported, never applied.
//!
//! Blocking is built from two queues: the per-core *sleep queue* for
//! timed waits, advanced at every tick, and generic [`BlockQueue`]s for
//! synchronization objects. A blocked object can always be expedited
//! from any core; cross-core requeueing rides TXU messages.
//!
//! The crate is host-testable: the tick source, the resched hint and
//! the TXU transport are registered functions, and the tests drive
//! [`Scheduler::advance`] directly.
//!
//! [`BlockQueue`]: blockq::BlockQueue

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod blockq;
pub mod object;
pub mod scheduler;
pub mod thread;

pub use blockq::{BlockQueue, Semaphore};
pub use object::{ObjectFlags, ObjectState, SchedulerEvent, SchedulerObject, TimeoutReason};
pub use scheduler::{Scheduler, SchedulerSet, set_resched_fn};
pub use thread::{Thread, ThreadFlags, Threading};

/// Number of run-queue levels per core.
pub const SCHEDULER_LEVELS: usize = 6;

/// Level reserved for the per-core idle object; regular objects are
/// never demoted into it and boost leaves it alone.
pub const IDLE_LEVEL: usize = SCHEDULER_LEVELS - 1;

/// Lowest level regular objects can be demoted to.
pub const LOWEST_LEVEL: usize = SCHEDULER_LEVELS - 2;

/// Base timeslice in milliseconds; each level adds two.
pub const TIMESLICE_INITIAL_MS: u64 = 10;

/// Activity period after which all non-top queues are boosted onto the
/// top queue.
pub const BOOST_PERIOD_MS: u64 = 3000;

/// Timeslice granted to an object sitting at `level`.
#[must_use]
pub const fn timeslice_for_level(level: usize) -> u64 {
    TIMESLICE_INITIAL_MS + 2 * level as u64
}
