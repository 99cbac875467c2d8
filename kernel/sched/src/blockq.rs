//! Block queues and the counting semaphore built on them.
//!
//! A [`BlockQueue`] is the generic wait list behind synchronization
//! primitives: a blocking object is appended before it yields, and
//! wakers either pop it (normal wake, [`BlockQueue::wake_one`]) or
//! expedite it in place (cancellation, [`SchedulerSet::expedite`]).
//! Normal wakes leave the waiter's timeout reason untouched; expedites
//! mark it `Interrupted`, timeouts mark it `Timeout`.
//!
//! [`SchedulerSet::expedite`]: crate::scheduler::SchedulerSet::expedite

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use quark_core::status::{OsError, OsResult};
use quark_core::sync::SpinLock;

use crate::object::{SchedulerObject, TimeoutReason};
use crate::scheduler::SchedulerSet;

/// A wait list for one synchronization object.
pub struct BlockQueue {
    waiters: SpinLock<VecDeque<Arc<SchedulerObject>>>,
}

impl BlockQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Appends a waiter. Called by the blocking path only.
    pub(crate) fn push(&self, obj: Arc<SchedulerObject>) {
        self.waiters.lock().push_back(obj);
    }

    /// Removes a specific waiter; `true` if it was present.
    pub(crate) fn remove(&self, obj: &Arc<SchedulerObject>) -> bool {
        let mut waiters = self.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| Arc::ptr_eq(w, obj)) {
            waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Wakes the oldest waiter, if any. The waiter's timeout reason is
    /// left as `Ok` — this is the normal completion path.
    pub fn wake_one(&self, set: &Arc<SchedulerSet>) -> bool {
        let obj = self.waiters.lock().pop_front();
        match obj {
            Some(obj) => {
                obj.set_wait_queue(None);
                set.queue_object(&obj).is_ok()
            }
            None => false,
        }
    }

    /// Wakes every waiter. Returns how many were woken.
    pub fn wake_all(&self, set: &Arc<SchedulerSet>) -> usize {
        let mut woken = 0;
        while self.wake_one(set) {
            woken += 1;
        }
        woken
    }

    /// Number of current waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether nobody waits.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A counting semaphore whose waiters park on a [`BlockQueue`].
pub struct Semaphore {
    permits: AtomicI32,
    queue: Arc<BlockQueue>,
}

impl Semaphore {
    /// Creates a semaphore with `permits` initial permits.
    #[must_use]
    pub fn new(permits: i32) -> Self {
        Self {
            permits: AtomicI32::new(permits),
            queue: Arc::new(BlockQueue::new()),
        }
    }

    /// Takes a permit without blocking; `false` if none are available.
    pub fn try_wait(&self) -> bool {
        let mut current = self.permits.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Takes a permit, blocking the calling thread until one is
    /// available or `timeout` milliseconds pass (0 = wait forever).
    ///
    /// # Errors
    ///
    /// `Timeout` when the deadline passed, `Interrupted` when the wait
    /// was expedited.
    pub fn wait(&self, set: &Arc<SchedulerSet>, timeout: u64) -> OsResult {
        loop {
            if self.try_wait() {
                return Ok(());
            }
            let Some(current) = set.block(Some(&self.queue), timeout) else {
                // No scheduler context (early boot): busy-wait.
                core::hint::spin_loop();
                continue;
            };
            crate::scheduler::resched();
            match current.timeout_reason() {
                TimeoutReason::Ok => {}
                TimeoutReason::Timeout => return Err(OsError::Timeout),
                TimeoutReason::Interrupted => return Err(OsError::Interrupted),
            }
        }
    }

    /// Releases `count` permits and wakes as many waiters.
    pub fn signal(&self, set: &Arc<SchedulerSet>, count: i32) {
        self.permits.fetch_add(count, Ordering::AcqRel);
        for _ in 0..count {
            if !self.queue.wake_one(set) {
                break;
            }
        }
    }

    /// Permits currently available.
    #[must_use]
    pub fn permits(&self) -> i32 {
        self.permits.load(Ordering::Acquire)
    }

    /// Waiters currently parked.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.queue.len()
    }
}
