//! TXU — cross-core message facility.
//!
//! Each CPU owns an inbox of deferred closures. A sender pushes work into
//! the target's inbox and pokes the target through a registered notifier
//! (an IPI on real hardware); the target drains its inbox from the IPI
//! handler or at the next scheduler tick. Used to hand scheduler objects
//! to their home core and to broadcast TLB shoot-downs.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::cpu_local::{CpuLocal, MAX_CPUS, cpu_count, current_cpu};
use crate::id::CpuId;
use crate::status::{OsError, OsResult};
use crate::sync::SpinLock;

/// A unit of deferred cross-core work.
type Message = Box<dyn FnOnce() + Send>;

struct Inbox {
    queue: SpinLock<VecDeque<Message>>,
}

impl Inbox {
    const fn new() -> Self {
        Self {
            queue: SpinLock::new(VecDeque::new()),
        }
    }
}

static INBOXES: CpuLocal<Inbox> = CpuLocal::new([const { Inbox::new() }; MAX_CPUS]);
static NOTIFY_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the transport used to poke a remote CPU (IPI send).
///
/// Without a registered notifier messages still queue; they are picked
/// up at the target's next [`process`] call. That is the host-test mode
/// and the early-boot mode.
pub fn set_notify_fn(f: fn(CpuId)) {
    NOTIFY_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn notify(target: CpuId) {
    let ptr = NOTIFY_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: The pointer was stored via `set_notify_fn` from a valid fn.
    let f: fn(CpuId) = unsafe { core::mem::transmute(ptr) };
    f(target);
}

/// Queues `work` on `target`'s inbox and pokes the target.
///
/// # Errors
///
/// Returns `InvalidParameters` if `target` is not an online CPU.
pub fn send(target: CpuId, work: impl FnOnce() + Send + 'static) -> OsResult {
    if target.as_u32() >= cpu_count() {
        return Err(OsError::InvalidParameters);
    }
    INBOXES
        .get_for(target)
        .queue
        .lock()
        .push_back(Box::new(work));
    if target != current_cpu() {
        notify(target);
    }
    Ok(())
}

/// Queues `work` on every online CPU except the caller's.
pub fn broadcast(work: impl Fn() + Clone + Send + 'static) {
    let me = current_cpu();
    for cpu in 0..cpu_count() {
        let target = CpuId::new(cpu);
        if target == me {
            continue;
        }
        // Online by construction of the loop bound.
        let _ = send(target, work.clone());
    }
}

/// Drains and runs the executing CPU's inbox. Returns how many messages
/// ran. Called from the IPI handler and from the scheduler tick.
pub fn process() -> usize {
    let inbox = INBOXES.get();
    let mut processed = 0;
    loop {
        // Pop one message at a time: the message body may itself send,
        // and must not run under the inbox lock.
        let Some(work) = inbox.queue.lock().pop_front() else {
            break;
        };
        work();
        processed += 1;
    }
    processed
}

/// Number of undelivered messages for `cpu`.
#[must_use]
pub fn pending(cpu: CpuId) -> usize {
    INBOXES.get_for(cpu).queue.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    // The inbox of CPU 0 is process-global; serialize the tests that use it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn send_to_self_and_process() {
        let _serial = TEST_LOCK.lock().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        send(CpuId::BSP, move || {
            r.fetch_add(1, AtomicOrdering::SeqCst);
        })
        .unwrap();
        assert!(pending(CpuId::BSP) >= 1);
        assert!(process() >= 1);
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn send_to_offline_cpu_fails() {
        let result = send(CpuId::new(63), || {});
        assert_eq!(result, Err(OsError::InvalidParameters));
    }

    #[test]
    fn message_may_send_followup() {
        let _serial = TEST_LOCK.lock().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        send(CpuId::BSP, move || {
            let r2 = r.clone();
            send(CpuId::BSP, move || {
                r2.fetch_add(10, AtomicOrdering::SeqCst);
            })
            .unwrap();
            r.fetch_add(1, AtomicOrdering::SeqCst);
        })
        .unwrap();
        process();
        // Both the message and its follow-up ran in the same drain.
        assert_eq!(ran.load(AtomicOrdering::SeqCst), 11);
    }
}
