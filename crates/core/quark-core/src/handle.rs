//! Handle arena for kernel resources.
//!
//! Resources that cross the process boundary (memory regions, threads)
//! are identified by a [`Handle`] into a per-type arena. Each slot keeps
//! an explicit reference count; the slot is vacated and the resource
//! dropped when the count reaches zero. Parent links between resources
//! are stored as handles and re-resolved on use, so cyclic ownership
//! cannot occur and a destroyed peer surfaces as `DoesNotExist`.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::id::Handle;
use crate::status::{OsError, OsResult};
use crate::sync::SpinLock;

/// Maximum live handles per arena (slot index is packed into 16 bits).
const MAX_SLOTS: usize = u16::MAX as usize;

struct Slot<T> {
    /// Incremented on each reuse; packed into the handle for staleness checks.
    generation: u16,
    /// Explicit reference count. `0` means the slot is vacant.
    refs: u32,
    value: Option<Arc<T>>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u16>,
}

/// A handle-indexed arena of reference-counted resources.
pub struct HandleTable<T> {
    inner: SpinLock<Inner<T>>,
}

impl<T> HandleTable<T> {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Inserts a resource and returns its handle. The initial reference
    /// count is 1 (owned by the creator).
    ///
    /// # Errors
    ///
    /// Returns `OutOfMemory` if the arena is at capacity.
    pub fn insert(&self, value: T) -> OsResult<Handle> {
        let mut inner = self.inner.lock();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                if inner.slots.len() >= MAX_SLOTS {
                    return Err(OsError::OutOfMemory);
                }
                let index = inner.slots.len() as u16;
                inner.slots.push(Slot {
                    generation: 0,
                    refs: 0,
                    value: None,
                });
                index
            }
        };

        let slot = &mut inner.slots[index as usize];
        debug_assert!(slot.refs == 0 && slot.value.is_none());
        slot.refs = 1;
        slot.value = Some(Arc::new(value));
        Ok(pack(index, slot.generation))
    }

    /// Resolves a handle without changing its reference count.
    pub fn get(&self, handle: Handle) -> OsResult<Arc<T>> {
        let inner = self.inner.lock();
        let slot = resolve(&inner, handle)?;
        Ok(slot.value.as_ref().expect("live slot has a value").clone())
    }

    /// Resolves a handle and increments its reference count.
    pub fn acquire(&self, handle: Handle) -> OsResult<Arc<T>> {
        let mut inner = self.inner.lock();
        let index = check(&inner, handle)?;
        let slot = &mut inner.slots[index];
        slot.refs += 1;
        Ok(slot.value.as_ref().expect("live slot has a value").clone())
    }

    /// Decrements a handle's reference count. When the count reaches zero
    /// the slot is vacated and the arena's reference to the resource is
    /// dropped. Returns `true` if this release vacated the slot.
    pub fn release(&self, handle: Handle) -> OsResult<bool> {
        let dropped;
        {
            let mut inner = self.inner.lock();
            let index = check(&inner, handle)?;
            let slot = &mut inner.slots[index];
            slot.refs -= 1;
            if slot.refs > 0 {
                return Ok(false);
            }
            dropped = slot.value.take();
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(index as u16);
        }
        // Drop outside the lock: the resource's Drop may take other locks.
        drop(dropped);
        Ok(true)
    }

    /// Returns the current reference count of a handle.
    pub fn refs(&self, handle: Handle) -> OsResult<u32> {
        let inner = self.inner.lock();
        let slot = resolve(&inner, handle)?;
        Ok(slot.refs)
    }

    /// Number of live resources in the arena.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.len() - inner.free.len()
    }

    /// Returns `true` if no resources are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

const fn pack(index: u16, generation: u16) -> Handle {
    Handle::from_raw(((generation as u32) << 16) | index as u32)
}

const fn unpack(handle: Handle) -> (usize, u16) {
    let raw = handle.as_raw();
    ((raw & 0xFFFF) as usize, (raw >> 16) as u16)
}

fn check<T>(inner: &Inner<T>, handle: Handle) -> OsResult<usize> {
    let (index, generation) = unpack(handle);
    match inner.slots.get(index) {
        Some(slot) if slot.refs > 0 && slot.generation == generation => Ok(index),
        _ => Err(OsError::DoesNotExist),
    }
}

fn resolve<'a, T>(inner: &'a Inner<T>, handle: Handle) -> OsResult<&'a Slot<T>> {
    let index = check(inner, handle)?;
    Ok(&inner.slots[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn insert_and_get() {
        let table: HandleTable<u32> = HandleTable::new();
        let h = table.insert(42).unwrap();
        assert_eq!(*table.get(h).unwrap(), 42);
        assert_eq!(table.refs(h).unwrap(), 1);
    }

    #[test]
    fn acquire_release_counts() {
        let table: HandleTable<u32> = HandleTable::new();
        let h = table.insert(1).unwrap();
        table.acquire(h).unwrap();
        assert_eq!(table.refs(h).unwrap(), 2);
        assert!(!table.release(h).unwrap());
        assert!(table.release(h).unwrap());
        assert_eq!(table.get(h), Err(OsError::DoesNotExist));
    }

    #[test]
    fn stale_handle_rejected_after_reuse() {
        let table: HandleTable<u32> = HandleTable::new();
        let h1 = table.insert(1).unwrap();
        assert!(table.release(h1).unwrap());

        // Slot is reused; the old handle must not alias the new resource.
        let h2 = table.insert(2).unwrap();
        assert_eq!(table.get(h1), Err(OsError::DoesNotExist));
        assert_eq!(*table.get(h2).unwrap(), 2);
    }

    #[test]
    fn invalid_handle_rejected() {
        let table: HandleTable<u32> = HandleTable::new();
        assert_eq!(table.get(Handle::INVALID), Err(OsError::DoesNotExist));
    }

    #[test]
    fn drop_runs_on_final_release() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let table: HandleTable<Tracked> = HandleTable::new();
        let h = table.insert(Tracked).unwrap();
        table.acquire(h).unwrap();
        table.release(h).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        table.release(h).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn outstanding_arc_defers_drop() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Tracked;
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let table: HandleTable<Tracked> = HandleTable::new();
        let h = table.insert(Tracked).unwrap();
        let held = table.get(h).unwrap();
        table.release(h).unwrap();
        // The arena slot is gone but the caller's Arc keeps the value alive.
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        drop(held);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn len_tracks_live_resources() {
        let table: HandleTable<u32> = HandleTable::new();
        assert!(table.is_empty());
        let a = table.insert(1).unwrap();
        let _b = table.insert(2).unwrap();
        assert_eq!(table.len(), 2);
        table.release(a).unwrap();
        assert_eq!(table.len(), 1);
    }
}
