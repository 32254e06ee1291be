#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

/// Map anonymous read-write memory. Returns null on failure.
///
/// # Safety
/// Caller must ensure `size` is page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr` must have been returned by `map_anonymous` and `size` must match.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Protect a memory region as inaccessible (guard page).
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn protect_none(ptr: *mut u8, size: usize) -> bool {
    sys::protect_none(ptr, size)
}

/// Mark memory as read-write.
///
/// # Safety
/// `ptr` and `size` must refer to a valid mapped region and be page-aligned.
#[inline]
pub unsafe fn protect_read_write(ptr: *mut u8, size: usize) -> bool {
    sys::protect_read_write(ptr, size)
}

/// Kernel identifier of the calling thread. Uncached; see `trace::ThreadContext`.
#[inline]
pub fn current_thread_id() -> usize {
    sys::current_thread_id()
}

/// Identifier of the calling process.
#[inline]
pub fn process_id() -> i32 {
    unsafe { libc::getpid() }
}

/// `[low, high)` bounds of the calling thread's stack, if the OS reports them.
pub fn current_stack_bounds() -> Option<(usize, usize)> {
    sys::current_stack_bounds()
}

/// Frame pointer of the caller's frame, or 0 on architectures we don't walk.
#[inline(always)]
pub fn frame_pointer() -> usize {
    let fp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        fp = 0;
    }
    fp
}

/// Identity of a mapped region: the process that owns the mapping plus its
/// base address. The owner changes across `fork`, so handles must be
/// re-resolved in the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHandle {
    pub owner: i32,
    pub base: usize,
}

impl RegionHandle {
    /// Resolve the handle of the mapping that starts at `base` in the calling process.
    pub fn resolve(base: usize) -> Self {
        RegionHandle {
            owner: process_id(),
            base,
        }
    }
}
