//! C allocator symbols backed by the process heap (`c-abi` feature).
//!
//! Built as a cdylib this can be preloaded into any program to give every
//! malloc its own guard page.

use crate::heap::Heap;
use crate::init;
use crate::util::{align_up, page_size};
use core::ffi::c_void;
use core::ptr;

/// Run `$body` with the initialized process heap bound to `$heap`, or
/// evaluate to `$fallback` when it cannot be initialized.
macro_rules! with_heap {
    (|$heap:ident| $body:expr, $fallback:expr) => {{
        if init::ensure_initialized() {
            let $heap: &Heap = init::heap().get_ref();
            $body
        } else {
            $fallback
        }
    }};
}

#[cfg(target_os = "linux")]
unsafe fn set_errno(value: libc::c_int) {
    *libc::__errno_location() = value;
}

#[cfg(target_os = "macos")]
unsafe fn set_errno(value: libc::c_int) {
    *libc::__error() = value;
}

/// Null results from the allocating entry points mean ENOMEM.
#[inline]
unsafe fn check_enomem(ptr: *mut u8) -> *mut c_void {
    if ptr.is_null() {
        set_errno(libc::ENOMEM);
    }
    ptr as *mut c_void
}

// ============================================================================
// Standard C allocator API
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    with_heap!(|heap| check_enomem(heap.allocate(size)), ptr::null_mut())
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    init::heap().free(ptr as *mut u8);
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    with_heap!(
        |heap| {
            let new_ptr = heap.reallocate(ptr as *mut u8, size);
            if new_ptr.is_null() && size != 0 {
                set_errno(libc::ENOMEM);
            }
            new_ptr as *mut c_void
        },
        ptr::null_mut()
    )
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    with_heap!(
        |heap| check_enomem(heap.allocate_zeroed(nmemb, size)),
        ptr::null_mut()
    )
}

// ============================================================================
// POSIX alignment APIs
// ============================================================================

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> libc::c_int {
    if memptr.is_null() {
        return libc::EINVAL;
    }
    // alignment must also be a multiple of sizeof(void*)
    if alignment < core::mem::size_of::<*mut c_void>() {
        return libc::EINVAL;
    }
    with_heap!(
        |heap| match heap.allocate_aligned_checked(alignment, size) {
            Ok(ptr) => {
                *memptr = ptr.as_ptr() as *mut c_void;
                0
            }
            Err(err) => err.errno(),
        },
        libc::ENOMEM
    )
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    // C11: size must be a multiple of alignment
    if !alignment.is_power_of_two() || (size % alignment != 0 && size != 0) {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    memalign(alignment, size)
}

#[no_mangle]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    if alignment != 0 && !alignment.is_power_of_two() {
        set_errno(libc::EINVAL);
        return ptr::null_mut();
    }
    with_heap!(
        |heap| check_enomem(heap.allocate_aligned(alignment, size)),
        ptr::null_mut()
    )
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    with_heap!(
        |heap| check_enomem(heap.allocate_page_aligned(size)),
        ptr::null_mut()
    )
}

#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    with_heap!(
        |heap| check_enomem(heap.allocate_page_aligned(align_up(size.max(1), page_size()))),
        ptr::null_mut()
    )
}

// ============================================================================
// GNU extensions
// ============================================================================

/// The requested size: with the user range flush against the guard page
/// there is never slack to report.
#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    init::heap()
        .allocation_info(ptr as *const u8)
        .map(|info| info.size)
        .unwrap_or(0)
}
