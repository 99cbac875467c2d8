//! The per-core multilevel feedback scheduler.
//!
//! Each core owns a [`Scheduler`]: its run queues, its sleep queue and
//! its current object, all behind one IRQ-disabling lock. The
//! [`SchedulerSet`] groups the per-core schedulers and carries the
//! operations that may cross cores — homing a new object on the least
//! loaded core, queueing to a remote core through TXU, expediting a
//! blocked object from anywhere.
//!
//! `advance` is the single scheduling entry point, called from the
//! timer tick (preemptive) and from yields (voluntary). It requeues the
//! outgoing object, ages the sleep queue, pops the next object and
//! reports the next wakeup deadline.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering, fence};

use quark_core::cpu_local::current_cpu;
use quark_core::id::{CpuId, Handle};
use quark_core::status::{OsError, OsResult};
use quark_core::sync::IrqSpinLock;
use quark_core::{kwarn, tick, txu};

use crate::blockq::BlockQueue;
use crate::object::{ObjectFlags, ObjectState, SchedulerEvent, SchedulerObject, TimeoutReason};
use crate::{
    BOOST_PERIOD_MS, IDLE_LEVEL, LOWEST_LEVEL, SCHEDULER_LEVELS, timeslice_for_level,
};

/// "No deadline" marker used while folding the sleep queue.
const NO_DEADLINE: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Resched hint
// ---------------------------------------------------------------------------

static RESCHED_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the function that forces a scheduling pass on the current
/// core (the kernel's yield entry point). No-op until registered.
pub fn set_resched_fn(f: fn()) {
    RESCHED_FN.store(f as *mut (), Ordering::Release);
}

/// Requests a scheduling pass on the current core.
pub(crate) fn resched() {
    let ptr = RESCHED_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: The pointer was stored via `set_resched_fn` from a valid fn.
    let f: fn() = unsafe { core::mem::transmute(ptr) };
    f();
}

// ---------------------------------------------------------------------------
// Per-core scheduler
// ---------------------------------------------------------------------------

struct RunState {
    /// One FIFO per level; index 0 is the highest priority.
    queues: [VecDeque<Arc<SchedulerObject>>; SCHEDULER_LEVELS],
    /// Timed waiters, aged by `advance`.
    sleeping: Vec<Arc<SchedulerObject>>,
    /// The object whose thread the core is executing.
    current: Option<Arc<SchedulerObject>>,
}

/// One core's scheduler.
pub struct Scheduler {
    core: CpuId,
    enabled: AtomicBool,
    /// Sum of attached objects' timeslices; the homing metric.
    bandwidth: AtomicU64,
    /// Objects attached to this core.
    object_count: AtomicU64,
    /// Tick of the last boost, 0 when idle-reset.
    last_boost: AtomicU64,
    run: IrqSpinLock<RunState>,
}

impl Scheduler {
    fn new(core: CpuId) -> Self {
        Self {
            core,
            enabled: AtomicBool::new(false),
            bandwidth: AtomicU64::new(0),
            object_count: AtomicU64::new(0),
            last_boost: AtomicU64::new(0),
            run: IrqSpinLock::new(RunState {
                queues: [const { VecDeque::new() }; SCHEDULER_LEVELS],
                sleeping: Vec::new(),
                current: None,
            }),
        }
    }

    /// The core this scheduler belongs to.
    #[must_use]
    pub fn core(&self) -> CpuId {
        self.core
    }

    /// Current homing pressure: the sum of attached timeslices.
    #[must_use]
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth.load(Ordering::Acquire)
    }

    /// Number of objects attached to this core.
    #[must_use]
    pub fn object_count(&self) -> u64 {
        self.object_count.load(Ordering::Acquire)
    }

    /// Whether the scheduler accepts work.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Gates the scheduler off (bring-up and shutdown paths).
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Opens the scheduler for work; requests a pass if something is
    /// already queued.
    pub fn enable(&self) {
        if self.enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        let has_work = {
            let run = self.run.lock();
            run.queues.iter().any(|q| !q.is_empty())
        };
        if has_work {
            resched();
        }
    }

    /// The object currently executing on this core.
    #[must_use]
    pub fn current(&self) -> Option<Arc<SchedulerObject>> {
        self.run.lock().current.clone()
    }

    /// Discards the current object without requeueing it. Used when the
    /// thread behind it is being reaped.
    pub fn drop_current(&self) -> Option<Arc<SchedulerObject>> {
        self.run.lock().current.take()
    }

    /// Objects sitting in run queues (diagnostics and tests).
    #[must_use]
    pub fn queued_at(&self, level: usize) -> usize {
        self.run.lock().queues[level].len()
    }

    /// Objects in the sleep queue (diagnostics and tests).
    #[must_use]
    pub fn sleeping(&self) -> usize {
        self.run.lock().sleeping.len()
    }

    /// Adjusts an object's level-derived accounting when it settles at
    /// `level`. Pressure follows the timeslice change.
    fn settle_at_level(&self, obj: &SchedulerObject, level: usize) {
        if obj.level() != level {
            self.bandwidth.fetch_sub(obj.timeslice(), Ordering::AcqRel);
            obj.set_level(level);
            obj.set_timeslice(timeslice_for_level(level));
            self.bandwidth.fetch_add(obj.timeslice(), Ordering::AcqRel);
        }
    }

    /// Appends `obj` to its level's run queue. The object must be in
    /// `Queueing`; anything else means a corrupted object.
    fn finish_queue(&self, run: &mut RunState, obj: &Arc<SchedulerObject>) {
        if let Some(pos) = run.sleeping.iter().position(|s| Arc::ptr_eq(s, obj)) {
            run.sleeping.remove(pos);
        }

        let state = obj.apply(SchedulerEvent::QueueFinish);
        assert!(
            state == Some(ObjectState::Queued),
            "object was not in a queueable state"
        );
        let level = obj.level().min(SCHEDULER_LEVELS - 1);
        run.queues[level].push_back(obj.clone());
    }

    /// Ages the sleep queue by `passed_ms`, waking expired objects onto
    /// the run queues. Returns the nearest surviving deadline.
    fn update_sleep_queue(
        &self,
        run: &mut RunState,
        ignore: Option<&Arc<SchedulerObject>>,
        passed_ms: u64,
    ) -> u64 {
        let mut deadline = NO_DEADLINE;
        let mut expired = Vec::new();

        for (idx, obj) in run.sleeping.iter().enumerate() {
            let skip = ignore.is_some_and(|i| Arc::ptr_eq(i, obj));
            if !skip && obj.time_left() > 0 {
                let left = obj.time_left().saturating_sub(passed_ms);
                obj.set_time_left(left);
                if left == 0 {
                    expired.push(idx);
                    continue;
                }
            }
            if obj.time_left() > 0 {
                deadline = deadline.min(obj.time_left());
            }
        }

        // Wake expired objects, highest index first so removal is stable.
        for idx in expired.into_iter().rev() {
            let obj = run.sleeping.remove(idx);
            if obj.apply(SchedulerEvent::Queue).is_some() {
                if let Some(queue) = obj.take_wait_queue() {
                    queue.remove(&obj);
                }
                obj.set_timeout_reason(TimeoutReason::Timeout);
                obj.set_interrupted_at(tick::current_ms());

                let state = obj.apply(SchedulerEvent::QueueFinish);
                assert!(
                    state == Some(ObjectState::Queued),
                    "timed-out object was not queueable"
                );
                let level = obj.level().min(SCHEDULER_LEVELS - 1);
                run.queues[level].push_back(obj);
            } else {
                kwarn!("sleeping object in invalid state at timeout");
            }
        }
        deadline
    }

    /// Requeues the outgoing object: preempted runners go back to a run
    /// queue (demoted one level if their slice ran out below the
    /// lowest), blockers with a deadline join the sleep queue.
    fn requeue_outgoing(
        &self,
        run: &mut RunState,
        obj: &Arc<SchedulerObject>,
        preempted: bool,
    ) {
        let state = obj.apply(SchedulerEvent::Schedule);
        let Some(state) = state else {
            panic!("outgoing object was neither running nor blocking");
        };

        match state {
            ObjectState::Queueing => {
                if preempted
                    && !obj.flags().contains(ObjectFlags::IDLE)
                    && obj.level() < LOWEST_LEVEL
                {
                    self.settle_at_level(obj, obj.level() + 1);
                }
                self.finish_queue(run, obj);
            }
            ObjectState::Blocked => {
                if obj.time_left() > 0 {
                    run.sleeping.push(obj.clone());
                }
                // Without a deadline the object waits on its block queue
                // until woken or expedited.
            }
            _ => unreachable!("Schedule produced {state:?}"),
        }
    }

    /// Splices every boostable queue onto the top queue. The idle level
    /// keeps its occupants.
    fn boost(&self, run: &mut RunState) {
        let (top, rest) = run.queues.split_at_mut(1);
        for queue in rest.iter_mut().take(LOWEST_LEVEL) {
            top[0].append(queue);
        }
    }

    /// One scheduling pass on this core. `preempted` distinguishes the
    /// timer tick from a voluntary yield; `passed_ms` is the time since
    /// the previous pass.
    ///
    /// Returns the object to run (or `None` for idle) and the next
    /// deadline in milliseconds (0 = no deadline).
    pub fn advance(
        &self,
        preempted: bool,
        passed_ms: u64,
    ) -> (Option<Arc<SchedulerObject>>, u64) {
        let mut run = self.run.lock();
        let outgoing = run.current.take();

        // Fast path: the slice is not exhausted and nothing blocked —
        // keep the current object, only age the sleepers.
        if let Some(current) = &outgoing {
            if preempted
                && current.state() == ObjectState::Running
                && passed_ms < current.remaining()
            {
                current.set_remaining(current.remaining() - passed_ms);
                let sleep_deadline = self.update_sleep_queue(&mut run, None, passed_ms);
                let deadline = current.remaining().min(sleep_deadline);
                run.current = outgoing.clone();
                return (outgoing, normalize(deadline));
            }
        }

        if let Some(current) = &outgoing {
            self.requeue_outgoing(&mut run, current, preempted);
        }
        let mut deadline = self.update_sleep_queue(&mut run, outgoing.as_ref(), passed_ms);

        // Pop the highest-priority object.
        let mut next = None;
        for level in 0..SCHEDULER_LEVELS {
            if let Some(obj) = run.queues[level].pop_front() {
                // An object boosted to a higher queue settles there.
                self.settle_at_level(&obj, level);
                obj.set_remaining(obj.timeslice());
                let state = obj.apply(SchedulerEvent::Execute);
                debug_assert!(state == Some(ObjectState::Running));
                deadline = deadline.min(obj.timeslice());
                next = Some(obj);
                break;
            }
        }

        if let Some(obj) = &next {
            run.current = Some(obj.clone());
            let now = tick::current_ms();
            let last = self.last_boost.load(Ordering::Acquire);
            if last == 0 {
                self.last_boost.store(now.max(1), Ordering::Release);
            } else if now.saturating_sub(last) >= BOOST_PERIOD_MS {
                self.boost(&mut run);
                self.last_boost.store(now.max(1), Ordering::Release);
            }
        } else {
            // Nothing runnable: boosting has no meaning without activity.
            self.last_boost.store(0, Ordering::Release);
        }

        (next, normalize(deadline))
    }
}

fn normalize(deadline: u64) -> u64 {
    if deadline == NO_DEADLINE { 0 } else { deadline }
}

// ---------------------------------------------------------------------------
// The set of per-core schedulers
// ---------------------------------------------------------------------------

/// All per-core schedulers of the machine.
pub struct SchedulerSet {
    cores: Vec<Arc<Scheduler>>,
    /// Self-reference for the TXU handoff closures.
    me: Weak<SchedulerSet>,
}

impl SchedulerSet {
    /// Creates schedulers for `count` cores. Every scheduler starts
    /// disabled; each core — the BSP included — enables its own at the
    /// end of its bring-up. Objects created before any core is enabled
    /// home on the BSP.
    #[must_use]
    pub fn new(count: u32) -> Arc<Self> {
        let cores = (0..count)
            .map(|i| Arc::new(Scheduler::new(CpuId::new(i))))
            .collect::<Vec<_>>();
        Arc::new_cyclic(|me| Self {
            cores,
            me: me.clone(),
        })
    }

    /// The scheduler of `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    #[must_use]
    pub fn scheduler(&self, cpu: CpuId) -> &Arc<Scheduler> {
        &self.cores[cpu.as_usize()]
    }

    /// The executing core's scheduler.
    #[must_use]
    pub fn local(&self) -> &Arc<Scheduler> {
        self.scheduler(current_cpu())
    }

    /// Number of cores in the set.
    #[must_use]
    pub fn core_count(&self) -> u32 {
        self.cores.len() as u32
    }

    /// Creates a scheduler object for `payload`.
    ///
    /// Idle objects are bound to the creating core at the idle level and
    /// add no pressure. Everything else starts at the top level on the
    /// enabled core with the smallest bandwidth, and its timeslice is
    /// added to that core's pressure.
    #[must_use]
    pub fn create_object(&self, payload: Handle, flags: ObjectFlags) -> Arc<SchedulerObject> {
        if flags.contains(ObjectFlags::IDLE) {
            return SchedulerObject::new(
                payload,
                flags | ObjectFlags::BOUND,
                current_cpu(),
                IDLE_LEVEL,
            );
        }

        let home = self.least_loaded_core();
        let obj = SchedulerObject::new(payload, flags, home, 0);
        let scheduler = self.scheduler(home);
        scheduler.bandwidth.fetch_add(obj.timeslice(), Ordering::AcqRel);
        scheduler.object_count.fetch_add(1, Ordering::AcqRel);
        // Publish the pressure before the object becomes visible to
        // other cores' homing decisions.
        fence(Ordering::SeqCst);
        obj
    }

    /// Detaches a destroyed object's pressure from its home core.
    pub fn destroy_object(&self, obj: &Arc<SchedulerObject>) {
        if obj.flags().contains(ObjectFlags::IDLE) {
            return;
        }
        let scheduler = self.scheduler(obj.core());
        scheduler.bandwidth.fetch_sub(obj.timeslice(), Ordering::AcqRel);
        scheduler.object_count.fetch_sub(1, Ordering::AcqRel);
        fence(Ordering::SeqCst);
    }

    /// Requests execution of `obj` (initial queue or wake-up).
    ///
    /// # Errors
    ///
    /// `InvalidParameters` if the object cannot accept a queue event —
    /// the caller decides whether that is fatal.
    pub fn queue_object(&self, obj: &Arc<SchedulerObject>) -> OsResult {
        match obj.apply(SchedulerEvent::Queue) {
            None => {
                kwarn!("queue request for object in invalid state");
                Err(OsError::InvalidParameters)
            }
            // The block was cancelled before the core scheduled away;
            // the object simply keeps running.
            Some(ObjectState::Running) => Ok(()),
            Some(ObjectState::Queueing) => {
                self.queue_immediately(obj);
                Ok(())
            }
            Some(state) => unreachable!("Queue produced {state:?}"),
        }
    }

    /// Wakes a blocked object out of turn: removes it from its wait
    /// list and marks the wait `Interrupted`. Expediting an object that
    /// is not blocked is silently ignored (it already won the race).
    pub fn expedite(&self, obj: &Arc<SchedulerObject>) {
        let Some(state) = obj.apply(SchedulerEvent::Queue) else {
            return;
        };
        if let Some(queue) = obj.take_wait_queue() {
            queue.remove(obj);
        }
        obj.set_time_left(0);
        obj.set_timeout_reason(TimeoutReason::Interrupted);
        obj.set_interrupted_at(tick::current_ms());

        if state == ObjectState::Queueing {
            self.queue_immediately(obj);
        }
    }

    /// Prepares the executing object for a timed sleep of `ms`
    /// milliseconds and applies the block event. The caller must yield
    /// afterwards; the wait ends via timeout or expedite.
    ///
    /// Returns the object, or `None` when the core has no current
    /// object (early boot).
    pub fn sleep_begin(&self, ms: u64) -> Option<Arc<SchedulerObject>> {
        let obj = self.local().current()?;
        obj.set_time_left(ms.max(1));
        obj.set_timeout_reason(TimeoutReason::Ok);
        obj.set_interrupted_at(0);
        obj.set_wait_queue(None);
        let state = obj.apply(SchedulerEvent::Block);
        debug_assert!(state == Some(ObjectState::Blocking));
        Some(obj)
    }

    /// Parks the executing object on `queue` with `timeout` milliseconds
    /// (0 = no deadline) and applies the block event. The caller must
    /// yield afterwards.
    ///
    /// Returns the object, or `None` when the core has no current
    /// object.
    pub fn block(
        &self,
        queue: Option<&Arc<BlockQueue>>,
        timeout: u64,
    ) -> Option<Arc<SchedulerObject>> {
        let obj = self.local().current()?;
        obj.set_time_left(timeout);
        obj.set_timeout_reason(TimeoutReason::Ok);
        obj.set_interrupted_at(0);
        obj.set_wait_queue(queue.cloned());
        let state = obj.apply(SchedulerEvent::Block);
        debug_assert!(state == Some(ObjectState::Blocking));
        if let Some(queue) = queue {
            queue.push(obj.clone());
        }
        Some(obj)
    }

    /// Finishes a queue request on the object's home core — directly
    /// when that is the executing core, via TXU otherwise.
    fn queue_immediately(&self, obj: &Arc<SchedulerObject>) {
        let target = obj.core();
        if target == current_cpu() {
            let scheduler = self.scheduler(target);
            {
                let mut run = scheduler.run.lock();
                scheduler.finish_queue(&mut run, obj);
            }
            if scheduler.is_enabled() && scheduler.current().is_none() {
                resched();
            }
            return;
        }

        let Some(set) = self.me.upgrade() else {
            return;
        };
        let obj = obj.clone();
        let sent = txu::send(target, move || {
            let scheduler = set.scheduler(target);
            {
                let mut run = scheduler.run.lock();
                scheduler.finish_queue(&mut run, &obj);
            }
            // An idle target picks the work up right away.
            if scheduler.is_enabled() && scheduler.current().is_none() {
                resched();
            }
        });
        if sent.is_err() {
            kwarn!("queue handoff to offline {}", target);
        }
    }

    /// Picks the enabled core with the smallest bandwidth.
    fn least_loaded_core(&self) -> CpuId {
        fence(Ordering::SeqCst);
        let mut best = self.cores[0].core();
        let mut best_bw = self.cores[0].bandwidth();
        for scheduler in self.cores.iter().skip(1) {
            if !scheduler.is_enabled() {
                continue;
            }
            let bw = scheduler.bandwidth();
            if bw < best_bw {
                best = scheduler.core();
                best_bw = bw;
            }
        }
        best
    }
}
