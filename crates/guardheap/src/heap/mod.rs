//! The guarded heap.
//!
//! Every allocation gets a run of pages ending in an inaccessible guard
//! page, with the user range pushed flush against it. Freed runs are
//! protected again and either recycled oldest-first or retired for good.
//! Requests too large or too aligned for an area get a dedicated region.

pub mod area;
pub mod page;
pub mod registry;

use self::area::{Area, Misuse, Rejection};
use self::page::Page;
use crate::config::{Options, Settings};
use crate::error::HeapError;
use crate::hardening::report::{self, AccessKind, FaultKind, FaultLocation, FaultReport};
use crate::hardening::{self, fault, fork, FdWriter, PREFIX};
use crate::huge::{HugeRegion, HugeRegistry};
use crate::sync::RawRwLock;
use crate::trace::{current_thread_id, DladdrResolver, StackTrace, SymbolResolver};
use crate::util::{
    init_page_size, page_size, AREA_GROW_SIZE, AREA_USE_THRESHOLD, INITIAL_AREA_SIZE,
    MIN_AREA_GROW_SIZE,
};
use core::fmt::{self, Write};
use core::marker::{PhantomData, PhantomPinned};
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const SHUT_DOWN: u8 = 3;

/// Who owns an address handed back by a caller.
pub enum Owner<'h> {
    AreaSlot { area: &'h Area, page_index: usize },
    DedicatedRegion(HugeRegion),
}

/// Metadata of a live allocation, as reported by [`Heap::allocation_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    pub size: usize,
    pub alignment: usize,
    pub allocating_thread: usize,
}

impl AllocationInfo {
    fn from_record(record: &Page) -> Self {
        AllocationInfo {
            size: record.allocation_size,
            alignment: record.alignment,
            allocating_thread: record.allocating_thread,
        }
    }
}

/// Totals printed at the end of an allocation dump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationStats {
    pub count: usize,
    pub bytes: usize,
}

/// A guard-page debugging heap.
///
/// Construct with [`Heap::new`], pin it, then call [`Heap::init`]. Areas
/// store a pointer back to the heap and the fault handler finds it through
/// a process-wide registry, so the heap must not move once initialized.
pub struct Heap {
    /// Serializes appends to the area list against walks that need a stable view.
    lock: RawRwLock,
    areas: AtomicPtr<Area>,
    last_area: AtomicPtr<Area>,
    page_count: AtomicUsize,
    used_pages: AtomicUsize,
    area_creation_counter: AtomicU32,
    settings: Settings,
    huge: HugeRegistry,
    symbols: &'static dyn SymbolResolver,
    state: AtomicU8,
    _pinned: PhantomPinned,
}

struct Areas<'a> {
    next: *const Area,
    _heap: PhantomData<&'a Heap>,
}

impl<'a> Iterator for Areas<'a> {
    type Item = &'a Area;

    fn next(&mut self) -> Option<&'a Area> {
        // SAFETY: areas stay mapped until the heap shuts down, which needs
        // `&Heap` to outlive every iterator.
        let area = unsafe { self.next.as_ref()? };
        self.next = area.next.load(Ordering::Acquire);
        Some(area)
    }
}

impl Heap {
    pub const fn new(options: Options) -> Heap {
        Self::with_symbols(options, &DladdrResolver)
    }

    /// Like [`Heap::new`], printing stack frames through `symbols`.
    pub const fn with_symbols(options: Options, symbols: &'static dyn SymbolResolver) -> Heap {
        Heap {
            lock: RawRwLock::new(),
            areas: AtomicPtr::new(ptr::null_mut()),
            last_area: AtomicPtr::new(ptr::null_mut()),
            page_count: AtomicUsize::new(0),
            used_pages: AtomicUsize::new(0),
            area_creation_counter: AtomicU32::new(0),
            settings: Settings::new(options),
            huge: HugeRegistry::new(),
            symbols,
            state: AtomicU8::new(UNINIT),
            _pinned: PhantomPinned,
        }
    }

    /// Map the first area, register the heap and install the process-wide
    /// fault handler and fork hook.
    pub fn init(self: Pin<&Self>) -> Result<(), HeapError> {
        let heap = self.get_ref();
        if heap
            .state
            .compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HeapError::AlreadyInitialized);
        }
        init_page_size();

        // SAFETY: the heap is pinned, so the back-pointer stays valid.
        let Some(area) = (unsafe { Area::create(heap, INITIAL_AREA_SIZE) }) else {
            heap.state.store(UNINIT, Ordering::Release);
            return Err(HeapError::OutOfMemory);
        };
        if let Err(err) = registry::register(heap) {
            unsafe { Area::destroy(area) };
            heap.state.store(UNINIT, Ordering::Release);
            return Err(err);
        }
        {
            let _list = heap.lock.write();
            heap.link_area(area);
        }
        // Ready before the hooks: registering them may allocate.
        heap.state.store(READY, Ordering::Release);
        fault::install();
        fork::register_atfork();

        log::debug!(
            "heap {:p} initialized with {} pages of {} bytes",
            heap,
            heap.page_count(),
            page_size()
        );
        Ok(())
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn options(&self) -> Options {
        self.settings.snapshot()
    }

    pub fn symbols(&self) -> &'static dyn SymbolResolver {
        self.symbols
    }

    /// Data pages across all areas.
    pub fn page_count(&self) -> usize {
        self.page_count.load(Ordering::Relaxed)
    }

    /// Pages of live runs, plus retired ones when reuse is off.
    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Relaxed)
    }

    pub fn area_count(&self) -> usize {
        self.areas().count()
    }

    pub fn dedicated_region_count(&self) -> usize {
        self.huge.len()
    }

    fn areas(&self) -> Areas<'_> {
        Areas {
            next: self.areas.load(Ordering::Acquire),
            _heap: PhantomData,
        }
    }

    /// Append `area` to the list. Caller holds the write lock.
    fn link_area(&self, area: NonNull<Area>) {
        let area_ptr = area.as_ptr();
        let tail = self.last_area.load(Ordering::Relaxed);
        if tail.is_null() {
            self.areas.store(area_ptr, Ordering::Release);
        } else {
            unsafe { (*tail).next.store(area_ptr, Ordering::Release) };
        }
        self.last_area.store(area_ptr, Ordering::Relaxed);
        let pages = unsafe { area.as_ref() }.page_count();
        self.page_count.fetch_add(pages, Ordering::Relaxed);
        self.area_creation_counter.fetch_add(1, Ordering::Release);
    }

    #[inline]
    fn capture_trace(&self) -> StackTrace {
        StackTrace::capture(self.settings.stack_trace_depth())
    }

    /// Allocate `size` bytes at the default alignment. Returns null on failure.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.allocate_aligned(0, size)
    }

    /// Allocate `size` bytes at `alignment` (0 for the default). Returns null
    /// for a non-power-of-two alignment or when memory runs out.
    pub fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8 {
        let alignment = if alignment == 0 {
            self.settings.default_alignment()
        } else {
            alignment
        };
        if !alignment.is_power_of_two() {
            return ptr::null_mut();
        }
        match self.allocate_inner(alignment, size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    /// Status-returning aligned allocation: `InvalidArgument` for an
    /// alignment that is not a power of two, `OutOfMemory` on exhaustion.
    pub fn allocate_aligned_checked(
        &self,
        alignment: usize,
        size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        if !alignment.is_power_of_two() {
            return Err(HeapError::InvalidArgument);
        }
        self.allocate_inner(alignment, size)
    }

    /// Zeroed array of `count` elements of `size` bytes; null on overflow.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };
        let ptr = self.allocate(total);
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, total) };
        }
        ptr
    }

    pub fn allocate_page_aligned(&self, size: usize) -> *mut u8 {
        self.allocate_aligned(page_size(), size)
    }

    fn allocate_inner(&self, alignment: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        if !self.is_ready() {
            return Err(HeapError::NotInitialized);
        }
        let size = size.max(1);
        let ps = page_size();
        let pages_needed = size.div_ceil(ps) + 1;
        let trace = self.capture_trace();
        let thread = current_thread_id();

        if alignment > ps || pages_needed.saturating_mul(ps) >= AREA_USE_THRESHOLD {
            return self.allocate_huge(size, alignment, &trace, thread);
        }

        loop {
            let counter = {
                let _list = self.lock.read();
                for area in self.areas() {
                    if let Some(address) =
                        area.allocate(pages_needed, size, alignment, &trace, thread)
                    {
                        self.used_pages.fetch_add(pages_needed, Ordering::Relaxed);
                        // SAFETY: area data pages never start at address 0.
                        return Ok(unsafe { NonNull::new_unchecked(address as *mut u8) });
                    }
                }
                self.area_creation_counter.load(Ordering::Acquire)
            };
            self.grow(counter, pages_needed);
        }
    }

    /// Smallest area mapping that can hold a run of `pages_needed` pages.
    fn area_size_for(pages_needed: usize) -> usize {
        let mut size = MIN_AREA_GROW_SIZE;
        while Area::usable_pages(size) < pages_needed {
            size *= 2;
        }
        size
    }

    /// Add an area unless another thread already did since `counter` was
    /// read. Either way the caller retries its scan.
    fn grow(&self, counter: u32, pages_needed: usize) {
        let floor = Self::area_size_for(pages_needed);
        let grown = {
            let _list = self.lock.write();
            if self.area_creation_counter.load(Ordering::Relaxed) != counter {
                return;
            }
            let mut size = AREA_GROW_SIZE.max(floor);
            loop {
                // SAFETY: an initialized heap is pinned.
                if let Some(area) = unsafe { Area::create(self, size) } {
                    self.link_area(area);
                    break Some(size);
                }
                if size / 2 < floor {
                    break None;
                }
                size /= 2;
            }
        };
        match grown {
            Some(size) => log::debug!("heap {:p} grew by a {} byte area", self, size),
            None => self.fatal(format_args!(
                "out of memory: cannot map an area for {} pages",
                pages_needed
            )),
        }
    }

    fn allocate_huge(
        &self,
        size: usize,
        alignment: usize,
        trace: &StackTrace,
        thread: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        // SAFETY: alignment is a power of two and size is non-zero.
        let region = unsafe { HugeRegion::create(size, alignment, trace, thread) }
            .ok_or(HeapError::OutOfMemory)?;
        if !self.huge.insert(&region) {
            unsafe { region.destroy() };
            return Err(HeapError::OutOfMemory);
        }
        log::trace!(
            "heap {:p} mapped dedicated region {:#x} ({} bytes) for {} bytes",
            self,
            region.base,
            region.total_size,
            size
        );
        // SAFETY: the user pointer lies inside a fresh mapping.
        Ok(unsafe { NonNull::new_unchecked(region.user_ptr as *mut u8) })
    }

    /// Find the area page or dedicated region `address` belongs to.
    pub fn resolve(&self, address: usize) -> Option<Owner<'_>> {
        {
            let _list = self.lock.read();
            if let Some(area) = self.areas().find(|area| area.contains(address)) {
                return Some(Owner::AreaSlot {
                    area,
                    page_index: area.page_index(address),
                });
            }
        }
        self.huge
            .lookup(address)
            .or_else(|| self.huge.find_containing(address))
            .map(Owner::DedicatedRegion)
    }

    /// Release the allocation at `ptr`. Any misuse is reported and
    /// terminates the process.
    ///
    /// # Safety
    /// `ptr` must not be accessed afterwards. Passing anything other than a
    /// live allocation of this heap is diagnosed, not undefined.
    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let address = ptr as usize;
        let trace = self.capture_trace();
        let thread = current_thread_id();
        match self.resolve(address) {
            Some(Owner::AreaSlot { area, page_index }) => {
                let reuse = self.settings.memory_reuse();
                match area.free(address, page_index, reuse, &trace, thread) {
                    Ok(run_length) => {
                        if reuse {
                            self.used_pages.fetch_sub(run_length, Ordering::Relaxed);
                        }
                    }
                    Err(rejection) => self.report_rejection(address, &rejection),
                }
            }
            Some(Owner::DedicatedRegion(region)) => {
                if region.user_ptr != address {
                    self.check_region(address, &region);
                }
                // Whoever removes the slot owns the mapping; a concurrent
                // second free of the same pointer loses here.
                let Some(region) = self.huge.remove(address) else {
                    self.report_misuse(Misuse::DoubleFree.describe(), address, None)
                };
                self.check_region(address, &region);
                region.destroy();
                log::trace!("heap {:p} unmapped dedicated region {:#x}", self, region.base);
            }
            None => self.report_misuse("free of unrecognized address", address, None),
        }
    }

    /// Resize the allocation at `ptr`. Returns `ptr` itself when the size is
    /// unchanged, otherwise moves to a fresh allocation at the default
    /// alignment. A null `ptr` allocates; a zero `new_size` frees and
    /// returns null. On exhaustion returns null and leaves `ptr` intact.
    ///
    /// # Safety
    /// As for [`Heap::free`]; `ptr` is invalid afterwards unless returned.
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        let old_size = self.live_size(ptr as usize);
        if old_size == new_size {
            return ptr;
        }
        let new_ptr = self.allocate(new_size);
        if new_ptr.is_null() {
            return new_ptr;
        }
        ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size));
        self.free(ptr);
        new_ptr
    }

    /// Requested size of the live allocation at `address`; misuse is fatal.
    fn live_size(&self, address: usize) -> usize {
        match self.resolve(address) {
            Some(Owner::AreaSlot { area, page_index }) => {
                match area.allocation_size(address, page_index) {
                    Ok(size) => size,
                    Err(rejection) => self.report_rejection(address, &rejection),
                }
            }
            Some(Owner::DedicatedRegion(region)) => {
                self.check_region(address, &region).allocation_size
            }
            None => self.report_misuse("realloc of unrecognized address", address, None),
        }
    }

    /// Validate a dedicated region against the pointer handed back for it.
    fn check_region(&self, address: usize, region: &HugeRegion) -> Page {
        // SAFETY: the region was found in the registry, so it is mapped.
        let record = unsafe { region.snapshot() };
        if region.user_ptr != address {
            self.report_misuse(
                Misuse::NotAllocationStart.describe(),
                address,
                Some((&record, &record)),
            );
        }
        if !unsafe { region.verify(address) } {
            self.report_misuse(
                "free of a dedicated region with a corrupted record",
                address,
                Some((&record, &record)),
            );
        }
        record
    }

    /// Size, alignment and allocating thread of the live allocation at `ptr`.
    /// Never fatal and never modifies anything.
    pub fn allocation_info(&self, ptr: *const u8) -> Result<AllocationInfo, HeapError> {
        let address = ptr as usize;
        match self.resolve(address) {
            Some(Owner::AreaSlot { area, page_index }) => area
                .allocation_record(address, page_index)
                .map(|record| AllocationInfo::from_record(&record))
                .ok_or(HeapError::NotFound),
            Some(Owner::DedicatedRegion(region))
                if region.user_ptr == address && unsafe { region.verify(address) } =>
            {
                Ok(AllocationInfo::from_record(&unsafe { region.snapshot() }))
            }
            _ => Err(HeapError::NotFound),
        }
    }

    /// Describe `address` for the fault handler. Takes no locks.
    pub fn fault_report(&self, address: usize, access: AccessKind) -> Option<FaultReport> {
        if let Some(area) = self.areas().find(|area| area.contains(address)) {
            let page_index = area.page_index(address);
            // SAFETY: the index comes from an address inside the area.
            let (page, first) = unsafe { area.snapshot(page_index) };
            return Some(FaultReport {
                address,
                access,
                kind: FaultKind::classify(page.flags),
                location: FaultLocation::Area {
                    area: area as *const Area as usize,
                    page_index,
                    page_address: area.page_address(page_index),
                },
                page,
                first,
            });
        }
        let region = self.huge.find_containing(address)?;
        // SAFETY: registered regions are mapped.
        let record = unsafe { region.snapshot() };
        Some(FaultReport {
            address,
            access,
            kind: FaultKind::classify_region(address, &record),
            location: FaultLocation::DedicatedRegion {
                base: region.base,
                total_size: region.total_size,
            },
            page: record,
            first: record,
        })
    }

    #[cold]
    fn report_rejection(&self, address: usize, rejection: &Rejection) -> ! {
        self.report_misuse(
            rejection.misuse.describe(),
            address,
            Some((&rejection.page, &rejection.first)),
        )
    }

    #[cold]
    fn report_misuse(&self, what: &str, address: usize, records: Option<(&Page, &Page)>) -> ! {
        let mut out = FdWriter::stderr();
        let _ = report::write_misuse(&mut out, what, address, records, self.symbols);
        out.flush();
        hardening::fatal(self.settings.debugger_calls())
    }

    #[cold]
    fn fatal(&self, message: fmt::Arguments<'_>) -> ! {
        let mut out = FdWriter::stderr();
        let _ = writeln!(out, "{}{}", PREFIX, message);
        out.flush();
        hardening::fatal(self.settings.debugger_calls())
    }

    /// Heap-wide counters, then optionally each area and its non-free pages.
    /// `out` must not allocate from this heap.
    pub fn write_heap_summary(
        &self,
        out: &mut dyn fmt::Write,
        include_areas: bool,
        include_pages: bool,
    ) -> fmt::Result {
        let _list = self.lock.read();
        writeln!(
            out,
            "guarded heap {:p}: areas {}, pages {}, used pages {}, dedicated regions {}, area creations {}, memory reuse {}",
            self,
            self.area_count(),
            self.page_count(),
            self.used_pages(),
            self.huge.len(),
            self.area_creation_counter.load(Ordering::Relaxed),
            if self.settings.memory_reuse() { "on" } else { "off" }
        )?;
        if include_areas {
            for area in self.areas() {
                area.write_summary(out, include_pages)?;
            }
        }
        Ok(())
    }

    pub fn dump_heap_summary(&self, include_areas: bool, include_pages: bool) {
        let mut out = FdWriter::stdout();
        let _ = self.write_heap_summary(&mut out, include_areas, include_pages);
    }

    /// List live allocations, optionally only those made by `thread`, and
    /// return the totals. With `stats_only` only the totals line is written.
    /// `out` must not allocate from this heap.
    pub fn write_allocations(
        &self,
        out: &mut dyn fmt::Write,
        stats_only: bool,
        thread: Option<usize>,
    ) -> Result<AllocationStats, fmt::Error> {
        let mut stats = AllocationStats::default();
        let mut result = Ok(());
        let mut visit = |record: &Page| {
            if thread.is_some_and(|t| t != record.allocating_thread) {
                return;
            }
            stats.count += 1;
            stats.bytes += record.allocation_size;
            if !stats_only && result.is_ok() {
                result = writeln!(
                    out,
                    "allocation {:#x}: size {}, alignment {}, thread {}",
                    record.allocation_base,
                    record.allocation_size,
                    record.alignment,
                    record.allocating_thread
                );
            }
        };
        {
            let _list = self.lock.read();
            for area in self.areas() {
                area.for_each_allocation(&mut visit);
            }
        }
        // SAFETY: regions stay mapped while the registry lock is held.
        self.huge
            .for_each(|region| visit(&unsafe { region.snapshot() }));
        result?;
        writeln!(
            out,
            "{} allocations, {} bytes",
            stats.count, stats.bytes
        )?;
        Ok(stats)
    }

    pub fn dump_allocations(&self, stats_only: bool, thread: Option<usize>) -> AllocationStats {
        let mut out = FdWriter::stdout();
        self.write_allocations(&mut out, stats_only, thread)
            .unwrap_or_default()
    }

    /// Check every area's free list and run shapes, and every dedicated
    /// region's record. The first problem is printed to stderr.
    pub fn validate_heaps(&self) -> Result<(), HeapError> {
        let mut out = FdWriter::stderr();
        {
            let _list = self.lock.read();
            for area in self.areas() {
                if let Err(corruption) = area.validate() {
                    let _ = writeln!(
                        out,
                        "{}area {:p} page {}: {}",
                        PREFIX, area, corruption.page, corruption.reason
                    );
                    return Err(HeapError::Corrupted);
                }
            }
        }
        let mut broken = None;
        self.huge.for_each(|region| {
            if broken.is_none() && !unsafe { region.verify(region.user_ptr) } {
                broken = Some(region.base);
            }
        });
        if let Some(base) = broken {
            let _ = writeln!(out, "{}dedicated region {:#x}: corrupted record", PREFIX, base);
            return Err(HeapError::Corrupted);
        }
        Ok(())
    }

    /// End-of-run hook: dump live allocations if configured.
    pub fn terminate(&self) {
        if self.settings.dump_allocations_on_exit() {
            self.dump_allocations(false, None);
        }
    }

    /// Unregister the heap and unmap every area and dedicated region.
    /// Does nothing unless the heap is initialized.
    ///
    /// # Safety
    /// Every pointer obtained from the heap becomes dangling.
    pub unsafe fn shutdown(&self) {
        if self
            .state
            .compare_exchange(READY, SHUT_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        registry::unregister(self);
        let (areas, regions) = {
            let _list = self.lock.write();
            let mut cursor = self.areas.swap(ptr::null_mut(), Ordering::AcqRel);
            self.last_area.store(ptr::null_mut(), Ordering::Relaxed);
            let mut areas = 0;
            while let Some(area) = NonNull::new(cursor) {
                cursor = area.as_ref().next.load(Ordering::Acquire);
                Area::destroy(area);
                areas += 1;
            }
            let mut regions = 0;
            self.huge.drain(|region| {
                region.destroy();
                regions += 1;
            });
            self.page_count.store(0, Ordering::Relaxed);
            self.used_pages.store(0, Ordering::Relaxed);
            (areas, regions)
        };
        log::debug!(
            "heap {:p} shut down: unmapped {} areas and {} dedicated regions",
            self,
            areas,
            regions
        );
    }

    /// Reset every lock and re-resolve area region handles.
    ///
    /// # Safety
    /// Only in the single-threaded child right after `fork`.
    pub(crate) unsafe fn reinit_after_fork(&self) {
        self.lock.force_unlock();
        for area in self.areas() {
            area.reinit_after_fork();
        }
        self.huge.force_unlock();
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // SAFETY: nothing can borrow from the heap any more.
        unsafe { self.shutdown() };
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("page_count", &self.page_count())
            .field("used_pages", &self.used_pages())
            .field("dedicated_regions", &self.huge.len())
            .field("options", &self.options())
            .finish()
    }
}
