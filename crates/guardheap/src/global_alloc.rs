//! `#[global_allocator]` support.
//!
//! ```rust,ignore
//! use guardheap::GuardHeap;
//!
//! #[global_allocator]
//! static GLOBAL: GuardHeap = GuardHeap;
//! ```
//!
//! Every Rust allocation then gets its own guard page from the process
//! heap, configured through `GUARDHEAP_OPTIONS`.

use crate::init;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// A zero-sized handle to the process-global guarded heap.
pub struct GuardHeap;

impl GuardHeap {
    /// The heap behind this handle, initialized on first use.
    pub fn heap(&self) -> Option<&'static crate::heap::Heap> {
        if init::ensure_initialized() {
            Some(init::heap().get_ref())
        } else {
            None
        }
    }
}

unsafe impl GlobalAlloc for GuardHeap {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // Zero-size types: return a well-aligned dangling pointer.
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        match self.heap() {
            Some(heap) => heap.allocate_aligned(layout.align(), layout.size()),
            None => ptr::null_mut(),
        }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() && layout.size() != 0 {
            ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        // A live pointer means alloc() already initialized the heap.
        init::heap().free(ptr);
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size();
        if old_size == 0 {
            return self.alloc(Layout::from_size_align_unchecked(new_size, layout.align()));
        }
        if old_size == new_size {
            return ptr;
        }
        // The heap's own reallocate moves to the default alignment, which
        // may be weaker than the layout's, so move by hand.
        let heap = init::heap();
        let new_ptr = heap.allocate_aligned(layout.align(), new_size);
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
            heap.free(ptr);
        }
        new_ptr
    }
}
