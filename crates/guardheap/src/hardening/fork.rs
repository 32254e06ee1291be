//! Fork safety: pthread_atfork handler and generation counter.
//!
//! After fork(), heap locks may be held by threads that no longer exist in
//! the child, and every area's region handle still names the parent. The
//! child handler resets the locks of every registered heap and re-resolves
//! the handles.

use crate::heap::registry;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Incremented in the child after each fork.
static FORK_GENERATION: AtomicU64 = AtomicU64::new(0);

static REGISTERED: AtomicBool = AtomicBool::new(false);

/// Number of forks this process has gone through as the child.
#[inline(always)]
pub fn fork_generation() -> u64 {
    FORK_GENERATION.load(Ordering::Relaxed)
}

/// # Safety
/// Called by the C runtime in the child after fork(), when only the forking
/// thread exists.
unsafe extern "C" fn atfork_child() {
    registry::find_map(|heap| {
        heap.reinit_after_fork();
        None::<()>
    });
    FORK_GENERATION.fetch_add(1, Ordering::Release);
}

/// Register the child handler once per process.
pub fn register_atfork() {
    if REGISTERED.swap(true, Ordering::AcqRel) {
        return;
    }
    unsafe {
        libc::pthread_atfork(None, None, Some(atfork_child));
    }
}
