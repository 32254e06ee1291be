//! The allocator contract a startup dispatcher selects implementations by.
//!
//! Six entry points are required; everything else has a default built on
//! them or answers [`HeapError::Unsupported`].

use crate::error::HeapError;
use crate::heap::{AllocationInfo, AllocationStats, Heap};
use crate::util::page_size;
use core::pin::Pin;
use core::ptr::{self, NonNull};

pub trait DebugAllocator: Sync {
    fn init(self: Pin<&Self>) -> Result<(), HeapError>;

    /// Called once the program is done, before process exit.
    fn terminate_after(&self);

    fn memalign(&self, alignment: usize, size: usize) -> *mut u8;

    fn malloc(&self, size: usize) -> *mut u8;

    /// # Safety
    /// `ptr` is null or was returned by this allocator and not yet freed.
    unsafe fn free(&self, ptr: *mut u8);

    /// # Safety
    /// As for [`DebugAllocator::free`].
    unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8;

    fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        let ptr = self.malloc(total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    fn valloc(&self, size: usize) -> *mut u8 {
        self.memalign(page_size(), size)
    }

    fn posix_memalign(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        if !alignment.is_power_of_two() || alignment % core::mem::size_of::<usize>() != 0 {
            return Err(HeapError::InvalidArgument);
        }
        NonNull::new(self.memalign(alignment, size)).ok_or(HeapError::OutOfMemory)
    }

    fn malloc_with_guard_page(&self, size: usize) -> *mut u8 {
        self.malloc(size)
    }

    fn start_wall_checking(&self, _interval_ms: u32) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn stop_wall_checking(&self) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn set_paranoid_validation(&self, _enabled: bool) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn set_memory_reuse(&self, _enabled: bool) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn set_debugger_calls(&self, _enabled: bool) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn set_default_alignment(&self, _alignment: usize) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn set_stack_trace_depth(&self, _depth: usize) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn validate_heaps(&self) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn validate_walls(&self) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn dump_allocations(
        &self,
        _stats_only: bool,
        _thread: Option<usize>,
    ) -> Result<AllocationStats, HeapError> {
        Err(HeapError::Unsupported)
    }

    fn dump_heaps(&self, _include_areas: bool, _include_pages: bool) -> Result<(), HeapError> {
        Err(HeapError::Unsupported)
    }

    fn get_allocation_info(&self, _ptr: *const u8) -> Result<AllocationInfo, HeapError> {
        Err(HeapError::Unsupported)
    }
}

impl DebugAllocator for Heap {
    fn init(self: Pin<&Self>) -> Result<(), HeapError> {
        Heap::init(self)
    }

    fn terminate_after(&self) {
        self.terminate();
    }

    fn memalign(&self, alignment: usize, size: usize) -> *mut u8 {
        self.allocate_aligned(alignment, size)
    }

    fn malloc(&self, size: usize) -> *mut u8 {
        self.allocate(size)
    }

    unsafe fn free(&self, ptr: *mut u8) {
        Heap::free(self, ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        self.reallocate(ptr, new_size)
    }

    fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        self.allocate_zeroed(count, size)
    }

    fn valloc(&self, size: usize) -> *mut u8 {
        self.allocate_page_aligned(size)
    }

    fn posix_memalign(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.allocate_aligned_checked(alignment, size)
    }

    fn start_wall_checking(&self, _interval_ms: u32) -> Result<(), HeapError> {
        log::warn!("wall checking is not supported by the guarded heap");
        Err(HeapError::Unsupported)
    }

    fn set_memory_reuse(&self, enabled: bool) -> Result<(), HeapError> {
        self.settings().set_memory_reuse(enabled);
        Ok(())
    }

    fn set_debugger_calls(&self, enabled: bool) -> Result<(), HeapError> {
        self.settings().set_debugger_calls(enabled);
        Ok(())
    }

    fn set_default_alignment(&self, alignment: usize) -> Result<(), HeapError> {
        self.settings().set_default_alignment(alignment)
    }

    fn set_stack_trace_depth(&self, depth: usize) -> Result<(), HeapError> {
        self.settings().set_stack_trace_depth(depth)
    }

    fn validate_heaps(&self) -> Result<(), HeapError> {
        Heap::validate_heaps(self)
    }

    fn dump_allocations(
        &self,
        stats_only: bool,
        thread: Option<usize>,
    ) -> Result<AllocationStats, HeapError> {
        Ok(Heap::dump_allocations(self, stats_only, thread))
    }

    fn dump_heaps(&self, include_areas: bool, include_pages: bool) -> Result<(), HeapError> {
        self.dump_heap_summary(include_areas, include_pages);
        Ok(())
    }

    fn get_allocation_info(&self, ptr: *const u8) -> Result<AllocationInfo, HeapError> {
        self.allocation_info(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc, dealloc, Layout};
    use std::sync::Mutex;

    /// Minimal allocator on top of the system heap, tracking layouts so it
    /// can free and reallocate.
    struct SystemBacked {
        live: Mutex<Vec<(usize, Layout)>>,
    }

    impl SystemBacked {
        fn new() -> Self {
            SystemBacked {
                live: Mutex::new(Vec::new()),
            }
        }
    }

    impl DebugAllocator for SystemBacked {
        fn init(self: Pin<&Self>) -> Result<(), HeapError> {
            Ok(())
        }

        fn terminate_after(&self) {}

        fn memalign(&self, alignment: usize, size: usize) -> *mut u8 {
            let Ok(layout) = Layout::from_size_align(size.max(1), alignment.max(1)) else {
                return ptr::null_mut();
            };
            let ptr = unsafe { alloc(layout) };
            self.live.lock().unwrap().push((ptr as usize, layout));
            ptr
        }

        fn malloc(&self, size: usize) -> *mut u8 {
            self.memalign(16, size)
        }

        unsafe fn free(&self, ptr: *mut u8) {
            let mut live = self.live.lock().unwrap();
            if let Some(pos) = live.iter().position(|&(p, _)| p == ptr as usize) {
                let (_, layout) = live.swap_remove(pos);
                dealloc(ptr, layout);
            }
        }

        unsafe fn realloc(&self, _ptr: *mut u8, _new_size: usize) -> *mut u8 {
            ptr::null_mut()
        }
    }

    #[test]
    fn default_calloc_zeroes_and_checks_overflow() {
        let allocator = SystemBacked::new();
        let ptr = allocator.calloc(16, 8);
        assert!(!ptr.is_null());
        assert!(unsafe { core::slice::from_raw_parts(ptr, 128) }
            .iter()
            .all(|&b| b == 0));
        unsafe { allocator.free(ptr) };
        assert!(allocator.calloc(usize::MAX, 2).is_null());
    }

    #[test]
    fn default_valloc_is_page_aligned() {
        crate::util::init_page_size();
        let allocator = SystemBacked::new();
        let ptr = allocator.valloc(10);
        assert_eq!(ptr as usize % page_size(), 0);
        unsafe { allocator.free(ptr) };
    }

    #[test]
    fn default_posix_memalign_validates_alignment() {
        let allocator = SystemBacked::new();
        assert_eq!(
            allocator.posix_memalign(24, 8),
            Err(HeapError::InvalidArgument)
        );
        let ptr = allocator.posix_memalign(64, 8).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
        unsafe { allocator.free(ptr.as_ptr()) };
    }

    #[test]
    fn optional_hooks_are_unsupported_by_default() {
        let allocator = SystemBacked::new();
        assert_eq!(allocator.start_wall_checking(100), Err(HeapError::Unsupported));
        assert_eq!(allocator.validate_walls(), Err(HeapError::Unsupported));
        assert_eq!(allocator.set_memory_reuse(false), Err(HeapError::Unsupported));
        assert_eq!(
            allocator.get_allocation_info(ptr::null()),
            Err(HeapError::Unsupported)
        );
    }
}
