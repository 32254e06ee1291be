use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Number of `unit`-sized chunks needed to hold `value` bytes.
#[inline(always)]
pub const fn div_ceil(value: usize, unit: usize) -> usize {
    value.div_ceil(unit)
}

/// Alignment the process-global heap hands out by default (max_align_t on 64-bit).
pub const MIN_ALIGN: usize = 16;

/// Size of the first area mapped by `Heap::init`.
pub const INITIAL_AREA_SIZE: usize = 1024 * 1024; // 1 MiB

/// Size requested when the heap grows by another area.
pub const AREA_GROW_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

/// Smallest area the growth path will fall back to before giving up.
pub const MIN_AREA_GROW_SIZE: usize = 1024 * 1024; // 1 MiB

/// Runs of at least this many bytes (guard included) get a dedicated region.
pub const AREA_USE_THRESHOLD: usize = 1024 * 1024; // 1 MiB

/// Capacity of the per-page frame buffer shared by the alloc and free traces.
pub const MAX_STACK_TRACE_DEPTH: usize = 50;

/// Maximum number of simultaneously initialized heaps.
pub const MAX_HEAPS: usize = 16;

/// Runtime page size, initialized from sysconf(_SC_PAGESIZE) at startup.
/// Initialized to 4096 so `page_size()` never returns zero.
static PAGE_SIZE_CACHED: AtomicUsize = AtomicUsize::new(4096);

/// Cached log2(page_size) for shift-based page index computation.
static PAGE_SHIFT_CACHED: AtomicU32 = AtomicU32::new(12);

/// Initialize the page size from the OS. Idempotent.
pub fn init_page_size() {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let ps = if ps > 0 { ps as usize } else { 4096 };
    PAGE_SIZE_CACHED.store(ps, Ordering::Release);
    PAGE_SHIFT_CACHED.store(ps.trailing_zeros(), Ordering::Release);
}

/// Get the system page size. Returns 4096 before `init_page_size` runs.
#[inline(always)]
pub fn page_size() -> usize {
    PAGE_SIZE_CACHED.load(Ordering::Relaxed)
}

/// Get log2(page_size).
#[inline(always)]
pub fn page_shift() -> u32 {
    PAGE_SHIFT_CACHED.load(Ordering::Relaxed)
}
