//! Scheduler objects and their state machine.
//!
//! A [`SchedulerObject`] is the scheduler's view of a thread. Its state
//! advances only through [`SchedulerObject::apply`], which consults the
//! transition table and installs the target state with a compare-and-swap
//! — concurrent events serialize on the state word itself, and an event
//! with no entry in the table changes nothing.
//!
//! ```text
//! Initial  --Queue-->       Queueing
//! Queueing --QueueFinish--> Queued
//! Queued   --Execute-->     Running
//! Running  --Schedule-->    Queueing    (preempted or yielded)
//! Running  --Block-->       Blocking
//! Blocking --Queue-->       Running     (block cancelled in time)
//! Blocking --Schedule-->    Blocked
//! Blocked  --Queue-->       Queueing
//! ```

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use quark_core::id::{CpuId, Handle};
use quark_core::sync::SpinLock;

use crate::blockq::BlockQueue;
use crate::timeslice_for_level;

/// Object lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    /// Created, never queued.
    Initial = 0,
    /// On its way into a run queue (transition state).
    Queueing = 1,
    /// Sitting in a run queue.
    Queued = 2,
    /// Currently executing on its core.
    Running = 3,
    /// Leaving the CPU for a wait (transition state).
    Blocking = 4,
    /// Parked in the sleep queue or a block queue.
    Blocked = 5,
}

impl ObjectState {
    fn from_u8(val: u8) -> Self {
        match val {
            0 => Self::Initial,
            1 => Self::Queueing,
            2 => Self::Queued,
            3 => Self::Running,
            4 => Self::Blocking,
            _ => Self::Blocked,
        }
    }
}

/// Events that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Request execution (queue, wake, or cancel a pending block).
    Queue,
    /// The object landed in a run queue.
    QueueFinish,
    /// The object was picked to run.
    Execute,
    /// The object is being scheduled off the CPU.
    Schedule,
    /// The object starts a wait.
    Block,
}

/// The complete transition table. Anything absent is an illegal event.
const TRANSITIONS: &[(ObjectState, SchedulerEvent, ObjectState)] = &[
    (ObjectState::Initial, SchedulerEvent::Queue, ObjectState::Queueing),
    (ObjectState::Queueing, SchedulerEvent::QueueFinish, ObjectState::Queued),
    (ObjectState::Queued, SchedulerEvent::Execute, ObjectState::Running),
    (ObjectState::Running, SchedulerEvent::Schedule, ObjectState::Queueing),
    (ObjectState::Running, SchedulerEvent::Block, ObjectState::Blocking),
    (ObjectState::Blocking, SchedulerEvent::Queue, ObjectState::Running),
    (ObjectState::Blocking, SchedulerEvent::Schedule, ObjectState::Blocked),
    (ObjectState::Blocked, SchedulerEvent::Queue, ObjectState::Queueing),
];

fn transition(state: ObjectState, event: SchedulerEvent) -> Option<ObjectState> {
    TRANSITIONS
        .iter()
        .find(|(from, ev, _)| *from == state && *ev == event)
        .map(|(_, _, to)| *to)
}

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeoutReason {
    /// The wait completed normally.
    Ok = 0,
    /// The wait's deadline passed.
    Timeout = 1,
    /// Another thread expedited the waiter.
    Interrupted = 2,
}

impl TimeoutReason {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Timeout,
            2 => Self::Interrupted,
            _ => Self::Ok,
        }
    }
}

bitflags::bitflags! {
    /// Static properties of a scheduler object.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectFlags: u32 {
        /// The per-core idle object: bound, lowest level, never boosted.
        const IDLE  = 1 << 0;
        /// Pinned to its core; never migrates.
        const BOUND = 1 << 1;
    }
}

/// The scheduler's per-thread record.
pub struct SchedulerObject {
    /// Thread (or other payload) this object schedules.
    payload: Handle,
    state: AtomicU8,
    flags: ObjectFlags,
    /// Home core.
    core: AtomicU32,
    /// Current run-queue level.
    level: AtomicU32,
    /// Full timeslice at the current level, milliseconds.
    timeslice: AtomicU64,
    /// Remaining slice of the current execution.
    remaining: AtomicU64,
    /// Remaining sleep/block timeout; 0 means no deadline.
    time_left: AtomicU64,
    timeout_reason: AtomicU8,
    /// Tick at which the last wait was cut short.
    interrupted_at: AtomicU64,
    /// The block queue the object waits on, for wake-side removal.
    wait_queue: SpinLock<Option<Arc<BlockQueue>>>,
}

impl SchedulerObject {
    /// Creates an object for `payload` at top level on `core`.
    #[must_use]
    pub fn new(payload: Handle, flags: ObjectFlags, core: CpuId, level: usize) -> Arc<Self> {
        let slice = timeslice_for_level(level);
        Arc::new(Self {
            payload,
            state: AtomicU8::new(ObjectState::Initial as u8),
            flags,
            core: AtomicU32::new(core.as_u32()),
            level: AtomicU32::new(level as u32),
            timeslice: AtomicU64::new(slice),
            remaining: AtomicU64::new(slice),
            time_left: AtomicU64::new(0),
            timeout_reason: AtomicU8::new(TimeoutReason::Ok as u8),
            interrupted_at: AtomicU64::new(0),
            wait_queue: SpinLock::new(None),
        })
    }

    /// Applies `event`. Returns the state entered, or `None` if the
    /// event is illegal in the current state (nothing is mutated).
    pub fn apply(&self, event: SchedulerEvent) -> Option<ObjectState> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let target = transition(ObjectState::from_u8(current), event)?;
            match self.state.compare_exchange(
                current,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(target),
                Err(actual) => current = actual,
            }
        }
    }

    /// The payload handle this object schedules.
    #[must_use]
    pub fn payload(&self) -> Handle {
        self.payload
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ObjectState {
        ObjectState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Static flags.
    #[must_use]
    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    /// Home core.
    #[must_use]
    pub fn core(&self) -> CpuId {
        CpuId::new(self.core.load(Ordering::Acquire))
    }

    pub(crate) fn set_core(&self, core: CpuId) {
        self.core.store(core.as_u32(), Ordering::Release);
    }

    /// Current run-queue level.
    #[must_use]
    pub fn level(&self) -> usize {
        self.level.load(Ordering::Acquire) as usize
    }

    pub(crate) fn set_level(&self, level: usize) {
        self.level.store(level as u32, Ordering::Release);
    }

    /// Full timeslice at the current level.
    #[must_use]
    pub fn timeslice(&self) -> u64 {
        self.timeslice.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeslice(&self, ms: u64) {
        self.timeslice.store(ms, Ordering::Release);
    }

    /// Remaining slice of the current execution.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::Acquire)
    }

    pub(crate) fn set_remaining(&self, ms: u64) {
        self.remaining.store(ms, Ordering::Release);
    }

    /// Remaining wait deadline, 0 when none.
    #[must_use]
    pub fn time_left(&self) -> u64 {
        self.time_left.load(Ordering::Acquire)
    }

    pub(crate) fn set_time_left(&self, ms: u64) {
        self.time_left.store(ms, Ordering::Release);
    }

    /// Why the last wait ended.
    #[must_use]
    pub fn timeout_reason(&self) -> TimeoutReason {
        TimeoutReason::from_u8(self.timeout_reason.load(Ordering::Acquire))
    }

    pub(crate) fn set_timeout_reason(&self, reason: TimeoutReason) {
        self.timeout_reason.store(reason as u8, Ordering::Release);
    }

    /// Tick at which the last wait was cut short (0 = never).
    #[must_use]
    pub fn interrupted_at(&self) -> u64 {
        self.interrupted_at.load(Ordering::Acquire)
    }

    pub(crate) fn set_interrupted_at(&self, tick: u64) {
        self.interrupted_at.store(tick, Ordering::Release);
    }

    pub(crate) fn set_wait_queue(&self, queue: Option<Arc<BlockQueue>>) {
        *self.wait_queue.lock() = queue;
    }

    /// Detaches and returns the block queue this object waits on.
    pub(crate) fn take_wait_queue(&self) -> Option<Arc<BlockQueue>> {
        self.wait_queue.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj() -> Arc<SchedulerObject> {
        SchedulerObject::new(Handle::from_raw(1), ObjectFlags::empty(), CpuId::BSP, 0)
    }

    #[test]
    fn happy_path_through_the_table() {
        let o = obj();
        assert_eq!(o.state(), ObjectState::Initial);
        assert_eq!(o.apply(SchedulerEvent::Queue), Some(ObjectState::Queueing));
        assert_eq!(o.apply(SchedulerEvent::QueueFinish), Some(ObjectState::Queued));
        assert_eq!(o.apply(SchedulerEvent::Execute), Some(ObjectState::Running));
        assert_eq!(o.apply(SchedulerEvent::Schedule), Some(ObjectState::Queueing));
    }

    #[test]
    fn block_path() {
        let o = obj();
        o.apply(SchedulerEvent::Queue);
        o.apply(SchedulerEvent::QueueFinish);
        o.apply(SchedulerEvent::Execute);
        assert_eq!(o.apply(SchedulerEvent::Block), Some(ObjectState::Blocking));
        assert_eq!(o.apply(SchedulerEvent::Schedule), Some(ObjectState::Blocked));
        assert_eq!(o.apply(SchedulerEvent::Queue), Some(ObjectState::Queueing));
    }

    #[test]
    fn block_cancellation_returns_to_running() {
        let o = obj();
        o.apply(SchedulerEvent::Queue);
        o.apply(SchedulerEvent::QueueFinish);
        o.apply(SchedulerEvent::Execute);
        o.apply(SchedulerEvent::Block);
        // Woken before the core scheduled away: straight back to Running.
        assert_eq!(o.apply(SchedulerEvent::Queue), Some(ObjectState::Running));
    }

    #[test]
    fn illegal_events_do_not_mutate() {
        let o = obj();
        assert_eq!(o.apply(SchedulerEvent::Execute), None);
        assert_eq!(o.apply(SchedulerEvent::Block), None);
        assert_eq!(o.apply(SchedulerEvent::Schedule), None);
        assert_eq!(o.state(), ObjectState::Initial);

        o.apply(SchedulerEvent::Queue);
        assert_eq!(o.apply(SchedulerEvent::Queue), None);
        assert_eq!(o.state(), ObjectState::Queueing);
    }

    #[test]
    fn every_undefined_pair_is_rejected() {
        use ObjectState::*;
        use SchedulerEvent::*;

        let states = [Initial, Queueing, Queued, Running, Blocking, Blocked];
        let events = [Queue, QueueFinish, Execute, Schedule, Block];

        for state in states {
            for event in events {
                let defined = TRANSITIONS
                    .iter()
                    .any(|(from, ev, _)| *from == state && *ev == event);
                let o = obj();
                o.state.store(state as u8, Ordering::Release);
                let outcome = o.apply(event);
                assert_eq!(outcome.is_some(), defined, "{state:?} x {event:?}");
                if !defined {
                    assert_eq!(o.state(), state, "{state:?} x {event:?} mutated");
                }
            }
        }
    }

    #[test]
    fn concurrent_events_pick_exactly_one_winner() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        // Many threads race the same Blocked -> Queueing transition;
        // exactly one may win.
        for _ in 0..50 {
            let o = obj();
            o.apply(SchedulerEvent::Queue);
            o.apply(SchedulerEvent::QueueFinish);
            o.apply(SchedulerEvent::Execute);
            o.apply(SchedulerEvent::Block);
            o.apply(SchedulerEvent::Schedule);
            assert_eq!(o.state(), ObjectState::Blocked);

            let wins = AtomicUsize::new(0);
            thread::scope(|scope| {
                for _ in 0..4 {
                    scope.spawn(|| {
                        if o.apply(SchedulerEvent::Queue).is_some() {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });
            assert_eq!(wins.load(Ordering::SeqCst), 1);
            assert_eq!(o.state(), ObjectState::Queueing);
        }
    }

    #[test]
    fn timeslice_follows_level() {
        let o = SchedulerObject::new(Handle::from_raw(1), ObjectFlags::IDLE, CpuId::BSP, 4);
        assert_eq!(o.timeslice(), timeslice_for_level(4));
        assert_eq!(o.level(), 4);
    }
}
