//! TLB invalidation.
//!
//! The architecture registers its single-page invalidation primitive at
//! boot; before registration (and on the host) flushes are no-ops, which
//! is safe because no stale hardware entries can exist. Remote cores are
//! reached through a TXU broadcast.

use core::sync::atomic::{AtomicPtr, Ordering};

use quark_core::addr::VirtAddr;
use quark_core::txu;

use crate::PAGE_SIZE;

static FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the architecture's single-page TLB invalidation.
pub fn register_flush_fn(f: fn(VirtAddr)) {
    FLUSH_FN.store(f as *mut (), Ordering::Release);
}

/// Invalidates one page on the executing core.
#[inline]
pub fn flush_page(va: VirtAddr) {
    let ptr = FLUSH_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: The pointer was stored via `register_flush_fn` from a valid fn.
    let f: fn(VirtAddr) = unsafe { core::mem::transmute(ptr) };
    f(va);
}

/// Invalidates `pages` pages starting at `va` on every core: locally by
/// direct invalidation, remotely via TXU messages.
pub fn shootdown(va: VirtAddr, pages: u64) {
    for i in 0..pages {
        flush_page(va + i * PAGE_SIZE as u64);
    }
    let base = va.as_u64();
    txu::broadcast(move || {
        for i in 0..pages {
            flush_page(VirtAddr::new(base + i * PAGE_SIZE as u64));
        }
    });
}
