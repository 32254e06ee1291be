//! Initialized heaps, as seen by the process-wide fault handler and fork hook.

use super::Heap;
use crate::error::HeapError;
use crate::util::MAX_HEAPS;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: AtomicPtr<Heap> = AtomicPtr::new(ptr::null_mut());
static HEAPS: [AtomicPtr<Heap>; MAX_HEAPS] = [EMPTY; MAX_HEAPS];

pub(crate) fn register(heap: &Heap) -> Result<(), HeapError> {
    let target = heap as *const Heap as *mut Heap;
    for slot in &HEAPS {
        if slot
            .compare_exchange(ptr::null_mut(), target, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
    Err(HeapError::RegistryFull)
}

pub(crate) fn unregister(heap: &Heap) {
    let target = heap as *const Heap as *mut Heap;
    for slot in &HEAPS {
        if slot
            .compare_exchange(target, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Return the first `Some` produced by `f` over the registered heaps.
///
/// # Safety
/// A heap must not be dropped while it is registered; `Heap::shutdown`
/// unregisters before tearing anything down. A heap shut down concurrently
/// with this walk is still a hazard, so callers are limited to the fault
/// handler and the fork hook.
pub(crate) unsafe fn find_map<R>(mut f: impl FnMut(&Heap) -> Option<R>) -> Option<R> {
    for slot in &HEAPS {
        let heap = slot.load(Ordering::Acquire);
        if heap.is_null() {
            continue;
        }
        if let Some(result) = f(&*heap) {
            return Some(result);
        }
    }
    None
}
