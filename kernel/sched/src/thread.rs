//! Thread lifecycle.
//!
//! Threads are handle-identified records in an arena; the scheduler
//! only ever sees their [`SchedulerObject`]. Parent/child links are
//! stored as handles and re-resolved on use, so a vanished relative
//! surfaces as `DoesNotExist` instead of a dangling pointer.
//!
//! Termination is a two-step affair: `terminate` marks the thread
//! (idempotently), releases joiners and kicks the thread out of any
//! wait; the scheduler reaps it the next time it would be scheduled
//! off. Joiners observe the exit code through the thread's event
//! semaphore and their own reference on the record.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use quark_core::handle::HandleTable;
use quark_core::id::{CpuId, Handle};
use quark_core::status::{OsError, OsResult};
use quark_core::sync::SpinLock;
use quark_core::{kdebug, kwarn, tick};

use crate::blockq::Semaphore;
use crate::object::{ObjectFlags, SchedulerObject, TimeoutReason};
use crate::scheduler::{SchedulerSet, resched};

bitflags::bitflags! {
    /// Thread creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The per-core idle thread.
        const IDLE = 1 << 0;
        /// Runs user code in its own memory space.
        const USERSPACE = 1 << 1;
    }
}

/// A saved execution context. Filled in and consumed by the arch layer;
/// the portable code only moves it around.
#[derive(Debug, Clone, Copy, Default)]
pub struct Context {
    /// Instruction pointer.
    pub ip: u64,
    /// Stack pointer.
    pub sp: u64,
    /// First argument register.
    pub arg: u64,
}

/// The three contexts a thread can own.
#[derive(Debug, Default)]
pub struct ContextSet {
    /// Kernel-mode context.
    pub kernel: Option<Context>,
    /// User-mode context.
    pub user: Option<Context>,
    /// Signal trampoline context.
    pub signal: Option<Context>,
}

/// A kernel or user thread.
pub struct Thread {
    name: String,
    entry: u64,
    argument: u64,
    parent: SpinLock<Handle>,
    memory_space: Handle,
    flags: ThreadFlags,
    cleanup: AtomicBool,
    references: AtomicI32,
    retcode: AtomicI32,
    started_at: AtomicU64,
    contexts: SpinLock<ContextSet>,
    signals: SpinLock<VecDeque<u32>>,
    event: Semaphore,
    object: SpinLock<Option<Arc<SchedulerObject>>>,
    children: SpinLock<Vec<Handle>>,
}

impl Thread {
    /// The thread's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Entry point address.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Entry argument.
    #[must_use]
    pub fn argument(&self) -> u64 {
        self.argument
    }

    /// Creation flags.
    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        self.flags
    }

    /// Handle of the memory space the thread executes in.
    #[must_use]
    pub fn memory_space(&self) -> Handle {
        self.memory_space
    }

    /// Handle of the creating thread (re-resolve before use).
    #[must_use]
    pub fn parent(&self) -> Handle {
        *self.parent.lock()
    }

    /// Whether the thread is marked for termination.
    #[must_use]
    pub fn marked_for_cleanup(&self) -> bool {
        self.cleanup.load(Ordering::Acquire)
    }

    /// Number of joiners currently referencing the record.
    #[must_use]
    pub fn references(&self) -> i32 {
        self.references.load(Ordering::Acquire)
    }

    /// Exit code (valid once cleanup is set).
    #[must_use]
    pub fn retcode(&self) -> i32 {
        self.retcode.load(Ordering::Acquire)
    }

    /// Tick at which the thread was created.
    #[must_use]
    pub fn started_at(&self) -> u64 {
        self.started_at.load(Ordering::Acquire)
    }

    /// The scheduler's view of this thread.
    #[must_use]
    pub fn object(&self) -> Option<Arc<SchedulerObject>> {
        self.object.lock().clone()
    }

    /// Mutates the saved contexts (arch layer only).
    pub fn with_contexts<R>(&self, f: impl FnOnce(&mut ContextSet) -> R) -> R {
        f(&mut self.contexts.lock())
    }

    /// Posts a signal number to the thread's queue.
    pub fn post_signal(&self, signal: u32) {
        self.signals.lock().push_back(signal);
    }

    /// Takes the oldest pending signal.
    #[must_use]
    pub fn take_signal(&self) -> Option<u32> {
        self.signals.lock().pop_front()
    }
}

/// The thread manager: arena, idle threads and lifecycle operations.
pub struct Threading {
    table: HandleTable<Thread>,
    set: Arc<SchedulerSet>,
    /// Idle thread handle per core, in core order.
    idle: SpinLock<Vec<(CpuId, Handle)>>,
}

impl Threading {
    /// Creates a manager over `set`.
    #[must_use]
    pub fn new(set: Arc<SchedulerSet>) -> Arc<Self> {
        Arc::new(Self {
            table: HandleTable::new(),
            set,
            idle: SpinLock::new(Vec::new()),
        })
    }

    /// The scheduler set this manager drives.
    #[must_use]
    pub fn scheduler_set(&self) -> &Arc<SchedulerSet> {
        &self.set
    }

    /// Creates a thread and queues it for execution. Idle threads are
    /// bound to the creating core and recorded instead of queued
    /// normally.
    pub fn create(
        &self,
        name: &str,
        entry: u64,
        argument: u64,
        flags: ThreadFlags,
        memory_space: Handle,
    ) -> OsResult<Handle> {
        let parent = self.current().unwrap_or(Handle::INVALID);
        let thread = Thread {
            name: String::from(name),
            entry,
            argument,
            parent: SpinLock::new(parent),
            memory_space,
            flags,
            cleanup: AtomicBool::new(false),
            references: AtomicI32::new(0),
            retcode: AtomicI32::new(0),
            started_at: AtomicU64::new(tick::current_ms()),
            contexts: SpinLock::new(ContextSet::default()),
            signals: SpinLock::new(VecDeque::new()),
            event: Semaphore::new(0),
            object: SpinLock::new(None),
            children: SpinLock::new(Vec::new()),
        };
        let handle = self.table.insert(thread)?;

        // Record the child with its parent; a dead parent is fine.
        if parent != Handle::INVALID {
            if let Ok(parent_thread) = self.table.get(parent) {
                parent_thread.children.lock().push(handle);
            }
        }

        let object_flags = if flags.contains(ThreadFlags::IDLE) {
            ObjectFlags::IDLE
        } else {
            ObjectFlags::empty()
        };
        let object = self.set.create_object(handle, object_flags);
        *self.table.get(handle)?.object.lock() = Some(object.clone());

        if flags.contains(ThreadFlags::IDLE) {
            self.idle.lock().push((object.core(), handle));
        }
        self.set.queue_object(&object)?;

        kdebug!("thread '{}' created as {}", name, handle);
        Ok(handle)
    }

    /// The thread executing on this core.
    #[must_use]
    pub fn current(&self) -> Option<Handle> {
        self.set.local().current().map(|obj| obj.payload())
    }

    /// Whether this core currently runs its idle thread.
    #[must_use]
    pub fn is_current_idle(&self) -> bool {
        match self.current() {
            Some(handle) => self
                .table
                .get(handle)
                .is_ok_and(|t| t.flags.contains(ThreadFlags::IDLE)),
            None => true,
        }
    }

    /// Resolves a thread record.
    pub fn get(&self, handle: Handle) -> OsResult<Arc<Thread>> {
        self.table.get(handle)
    }

    /// The idle thread of `cpu`.
    pub fn idle_thread(&self, cpu: CpuId) -> OsResult<Handle> {
        self.idle
            .lock()
            .iter()
            .find(|(core, _)| *core == cpu)
            .map(|(_, handle)| *handle)
            .ok_or(OsError::DoesNotExist)
    }

    /// Marks a thread for termination. Idempotent: terminating twice is
    /// a no-op. Joiners are released immediately; the record is reaped
    /// when the scheduler takes the thread off a CPU for the last time.
    pub fn terminate(
        &self,
        handle: Handle,
        exit_code: i32,
        terminate_children: bool,
    ) -> OsResult {
        let thread = self.table.get(handle)?;
        if thread.flags.contains(ThreadFlags::IDLE) {
            return Err(OsError::InvalidParameters);
        }

        if thread.cleanup.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        thread.retcode.store(exit_code, Ordering::Release);

        if terminate_children {
            let children = thread.children.lock().clone();
            for child in children {
                // A child may already be gone; that is not an error.
                match self.terminate(child, exit_code, true) {
                    Ok(()) | Err(OsError::DoesNotExist) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let joiners = thread.references.load(Ordering::Acquire);
        thread.event.signal(&self.set, joiners + 1);

        // Kick the thread out of any wait so it can run into the reaper.
        if let Some(object) = thread.object() {
            if self.current() != Some(handle) {
                self.set.expedite(&object);
            }
        }
        Ok(())
    }

    /// Waits for a thread to terminate and returns its exit code.
    pub fn join(&self, handle: Handle) -> OsResult<i32> {
        if self.current() == Some(handle) {
            return Err(OsError::InvalidParameters);
        }
        let thread = self.table.get(handle)?;
        if thread.flags.contains(ThreadFlags::IDLE) {
            return Err(OsError::InvalidParameters);
        }

        thread.references.fetch_add(1, Ordering::AcqRel);
        while !thread.marked_for_cleanup() {
            match thread.event.wait(&self.set, 0) {
                Ok(()) | Err(OsError::Interrupted) => {}
                Err(err) => {
                    thread.references.fetch_sub(1, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }
        let code = thread.retcode();
        thread.references.fetch_sub(1, Ordering::AcqRel);
        Ok(code)
    }

    /// Severs the parent link: the thread is no longer reported as a
    /// child and outlives its creator silently.
    pub fn detach(&self, handle: Handle) -> OsResult {
        let thread = self.table.get(handle)?;
        let parent = core::mem::replace(&mut *thread.parent.lock(), Handle::INVALID);
        if parent != Handle::INVALID {
            if let Ok(parent_thread) = self.table.get(parent) {
                parent_thread.children.lock().retain(|c| *c != handle);
            }
        }
        Ok(())
    }

    /// Puts the executing thread to sleep for `ms` milliseconds.
    ///
    /// # Errors
    ///
    /// `Interrupted` when another thread expedited the sleeper; the
    /// interruption tick is available on the scheduler object.
    pub fn sleep(&self, ms: u64) -> OsResult {
        let Some(object) = self.set.sleep_begin(ms) else {
            // No scheduler context yet (early boot): nothing to sleep.
            return Ok(());
        };
        resched();
        match object.timeout_reason() {
            // The deadline passing is the normal way a sleep ends.
            TimeoutReason::Ok | TimeoutReason::Timeout => Ok(()),
            TimeoutReason::Interrupted => Err(OsError::Interrupted),
        }
    }

    /// One scheduling pass: requeues the outgoing thread, reaps
    /// terminated ones, and returns the next thread to run (falling
    /// back to the core's idle thread) plus the next deadline.
    pub fn advance(&self, preempted: bool, passed_ms: u64) -> (OsResult<Handle>, u64) {
        let scheduler = self.set.local();
        let mut preempted = preempted;
        let mut passed_ms = passed_ms;
        loop {
            let (next, deadline) = scheduler.advance(preempted, passed_ms);
            let Some(object) = next else {
                return (self.idle_thread(scheduler.core()), deadline);
            };

            let handle = object.payload();
            match self.table.get(handle) {
                Ok(thread) if thread.marked_for_cleanup() => {
                    self.reap(&object, handle);
                    // The slot this thread held is gone; pick again.
                    preempted = false;
                    passed_ms = 0;
                    continue;
                }
                Ok(_) => return (Ok(handle), deadline),
                Err(_) => {
                    kwarn!("scheduled object without a thread record");
                    self.reap(&object, handle);
                    preempted = false;
                    passed_ms = 0;
                    continue;
                }
            }
        }
    }

    /// Destroys a terminated thread's scheduling state and releases the
    /// arena's reference. Joiners holding the record keep it alive
    /// until they have read the exit code.
    fn reap(&self, object: &Arc<SchedulerObject>, handle: Handle) {
        self.set.local().drop_current();
        self.set.destroy_object(object);
        if let Ok(thread) = self.table.get(handle) {
            *thread.object.lock() = None;
        }
        let _ = self.table.release(handle);
        kdebug!("thread {} reaped", handle);
    }

    /// Live threads (diagnostics and tests).
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether no threads exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectState;

    fn manager() -> Arc<Threading> {
        Threading::new(SchedulerSet::new(1))
    }

    fn spawn(threading: &Threading, name: &str) -> Handle {
        threading
            .create(name, 0x1000, 0, ThreadFlags::empty(), Handle::INVALID)
            .unwrap()
    }

    #[test]
    fn create_queues_and_advance_runs() {
        let threading = manager();
        let handle = spawn(&threading, "worker");

        let (next, _) = threading.advance(false, 0);
        assert_eq!(next.unwrap(), handle);
        assert_eq!(threading.current(), Some(handle));

        let thread = threading.get(handle).unwrap();
        assert_eq!(thread.name(), "worker");
        assert_eq!(thread.entry(), 0x1000);
    }

    #[test]
    fn advance_falls_back_to_idle() {
        let threading = manager();
        let idle = threading
            .create("idle0", 0, 0, ThreadFlags::IDLE, Handle::INVALID)
            .unwrap();

        // Only the idle thread exists: the pass picks it.
        let (next, _) = threading.advance(false, 0);
        assert_eq!(next.unwrap(), idle);
        assert!(threading.is_current_idle());
    }

    #[test]
    fn busy_thread_preempts_idle() {
        let threading = manager();
        threading
            .create("idle0", 0, 0, ThreadFlags::IDLE, Handle::INVALID)
            .unwrap();
        let busy = spawn(&threading, "busy");

        let (next, _) = threading.advance(false, 0);
        assert_eq!(next.unwrap(), busy);
        assert!(!threading.is_current_idle());
    }

    #[test]
    fn terminate_is_idempotent() {
        let threading = manager();
        let handle = spawn(&threading, "t");

        threading.terminate(handle, 7, false).unwrap();
        threading.terminate(handle, 99, false).unwrap();
        // The first exit code wins.
        assert_eq!(threading.get(handle).unwrap().retcode(), 7);
    }

    #[test]
    fn terminated_thread_is_reaped_on_advance() {
        let threading = manager();
        let handle = spawn(&threading, "t");
        let (next, _) = threading.advance(false, 0);
        assert_eq!(next.unwrap(), handle);

        threading.terminate(handle, 0, false).unwrap();
        assert_eq!(threading.len(), 1);

        // The next pass reaps it and reports no runnable thread.
        let (next, _) = threading.advance(false, 0);
        assert_eq!(next, Err(OsError::DoesNotExist)); // no idle thread either
        assert_eq!(threading.len(), 0);
        assert!(matches!(threading.get(handle), Err(OsError::DoesNotExist)));
    }

    #[test]
    fn join_after_terminate_returns_exit_code() {
        let threading = manager();
        let handle = spawn(&threading, "t");
        threading.terminate(handle, 42, false).unwrap();
        assert_eq!(threading.join(handle).unwrap(), 42);
    }

    #[test]
    fn join_from_other_std_thread_unblocks_on_terminate() {
        let threading = manager();
        let handle = spawn(&threading, "t");

        let joiner = {
            let threading = threading.clone();
            std::thread::spawn(move || threading.join(handle))
        };
        // Give the joiner time to register.
        std::thread::sleep(std::time::Duration::from_millis(20));
        threading.terminate(handle, 5, false).unwrap();

        assert_eq!(joiner.join().unwrap().unwrap(), 5);
        assert_eq!(threading.get(handle).unwrap().references(), 0);
    }

    #[test]
    fn join_self_rejected() {
        let threading = manager();
        let handle = spawn(&threading, "t");
        threading.advance(false, 0).0.unwrap();
        assert_eq!(threading.join(handle), Err(OsError::InvalidParameters));
    }

    #[test]
    fn terminate_cascades_to_children() {
        let threading = manager();
        let parent = spawn(&threading, "parent");
        threading.advance(false, 0).0.unwrap();
        assert_eq!(threading.current(), Some(parent));

        // Created while the parent runs: the link is recorded.
        let child = spawn(&threading, "child");
        assert_eq!(threading.get(child).unwrap().parent(), parent);

        threading.terminate(parent, -1, true).unwrap();
        assert!(threading.get(child).unwrap().marked_for_cleanup());
        assert_eq!(threading.get(child).unwrap().retcode(), -1);
    }

    #[test]
    fn detach_severs_the_parent_link() {
        let threading = manager();
        let parent = spawn(&threading, "parent");
        threading.advance(false, 0).0.unwrap();
        let child = spawn(&threading, "child");

        threading.detach(child).unwrap();
        assert_eq!(threading.get(child).unwrap().parent(), Handle::INVALID);

        // Terminating the parent no longer reaches the child.
        threading.terminate(parent, 0, true).unwrap();
        assert!(!threading.get(child).unwrap().marked_for_cleanup());
    }

    #[test]
    fn terminate_wakes_a_sleeping_thread() {
        let threading = manager();
        let handle = spawn(&threading, "sleeper");
        threading.advance(false, 0).0.unwrap();

        // The thread goes to sleep and is scheduled off.
        threading.scheduler_set().sleep_begin(10_000).unwrap();
        threading.advance(false, 0).0.unwrap_err();
        let object = threading.get(handle).unwrap().object().unwrap();
        assert_eq!(object.state(), ObjectState::Blocked);

        // Termination expedites it; the next pass reaps.
        threading.terminate(handle, 0, false).unwrap();
        assert_eq!(object.state(), ObjectState::Queued);
        threading.advance(false, 0).0.unwrap_err();
        assert_eq!(threading.len(), 0);
    }

    #[test]
    fn idle_thread_cannot_be_terminated_or_joined() {
        let threading = manager();
        let idle = threading
            .create("idle0", 0, 0, ThreadFlags::IDLE, Handle::INVALID)
            .unwrap();
        assert_eq!(
            threading.terminate(idle, 0, false),
            Err(OsError::InvalidParameters)
        );
        assert_eq!(threading.join(idle), Err(OsError::InvalidParameters));
    }

    #[test]
    fn signals_queue_in_order() {
        let threading = manager();
        let handle = spawn(&threading, "t");
        let thread = threading.get(handle).unwrap();

        thread.post_signal(2);
        thread.post_signal(9);
        assert_eq!(thread.take_signal(), Some(2));
        assert_eq!(thread.take_signal(), Some(9));
        assert_eq!(thread.take_signal(), None);
    }
}
