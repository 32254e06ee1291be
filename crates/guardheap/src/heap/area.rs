//! A contiguous mapped region carved into guarded runs.
//!
//! Layout of the mapping: `[Area header | page records ...] [data pages ...]`.
//! The header and record array occupy the leading pages; everything after
//! them is handed out in runs of data pages followed by one guard page.

use super::page::{FreeList, Page, PageFlags};
use super::Heap;
use crate::platform::{self, RegionHandle};
use crate::sync::{Mutex, MutexGuard};
use crate::trace::StackTrace;
use crate::util::{align_down, div_ceil, page_size};
use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};

#[repr(C)]
pub struct Area {
    heap: *const Heap,
    pub(super) next: AtomicPtr<Area>,
    /// Owner half of the region handle; rewritten in the child after fork.
    owner: AtomicI32,
    mapping_size: usize,
    base: usize,
    size: usize,
    page_count: usize,
    used_pages: AtomicUsize,
    pages: *mut Page,
    free_list: Mutex<FreeList>,
}

// SAFETY: the raw pointers refer to the area's own mapping and the owning
// heap, both of which outlive every reference to the area. Page records are
// only mutated under `free_list`.
unsafe impl Send for Area {}
unsafe impl Sync for Area {}

/// Exclusive access to an area's free list and page records.
pub struct AreaGuard<'a> {
    pub free_list: MutexGuard<'a, FreeList>,
    pub pages: &'a mut [Page],
}

/// Why a pointer handed to `free` or `reallocate` was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misuse {
    DoubleFree,
    GuardPage,
    DeadPage,
    NotAllocationStart,
}

impl Misuse {
    pub fn describe(&self) -> &'static str {
        match self {
            Misuse::DoubleFree => "double free",
            Misuse::GuardPage => "free of a guard page",
            Misuse::DeadPage => "free of a dead page",
            Misuse::NotAllocationStart => "free of an address that is not the start of an allocation",
        }
    }
}

/// A rejected pointer with copies of the page it landed on and the first
/// page of its run (which carries the stack traces).
pub struct Rejection {
    pub misuse: Misuse,
    pub page: Page,
    pub first: Page,
}

/// First inconsistency found by [`Area::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Corruption {
    pub page: usize,
    pub reason: &'static str,
}

impl Area {
    /// Data pages an area mapping of `size` bytes provides.
    pub fn usable_pages(size: usize) -> usize {
        let ps = page_size();
        let total = size / ps;
        let meta = div_ceil(size_of::<Area>() + total * size_of::<Page>(), ps);
        total.saturating_sub(meta)
    }

    /// Map a new area of `size` bytes with every data page free and protected.
    ///
    /// # Safety
    /// `heap` must outlive the area.
    pub unsafe fn create(heap: *const Heap, size: usize) -> Option<NonNull<Area>> {
        let ps = page_size();
        let size = align_down(size, ps);
        let page_count = Self::usable_pages(size);
        if page_count < 2 {
            return None;
        }
        let mapping = platform::map_anonymous(size);
        if mapping.is_null() {
            return None;
        }
        let meta_size = size - page_count * ps;
        let pages = mapping.add(size_of::<Area>()) as *mut Page;
        for index in 0..page_count {
            pages.add(index).write(Page::EMPTY);
        }

        let area = mapping as *mut Area;
        area.write(Area {
            heap,
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicI32::new(platform::process_id()),
            mapping_size: size,
            base: mapping as usize + meta_size,
            size: page_count * ps,
            page_count,
            used_pages: AtomicUsize::new(0),
            pages,
            free_list: Mutex::new(FreeList::new()),
        });

        let area_ref = &*area;
        {
            let mut guard = area_ref.lock();
            let AreaGuard { free_list, pages } = &mut guard;
            for index in 0..page_count {
                free_list.push_back(pages, index);
            }
        }
        if !platform::protect_none(area_ref.base as *mut u8, area_ref.size) {
            platform::unmap(mapping, size);
            return None;
        }
        Some(NonNull::new_unchecked(area))
    }

    /// Unmap the area.
    ///
    /// # Safety
    /// Nothing may reference the area or any allocation inside it afterwards.
    pub unsafe fn destroy(area: NonNull<Area>) {
        let size = area.as_ref().mapping_size;
        platform::unmap(area.as_ptr() as *mut u8, size);
    }

    pub fn lock(&self) -> AreaGuard<'_> {
        let free_list = self.free_list.lock();
        // SAFETY: the records live as long as the area and the mutex we hold
        // makes this the only mutable view of them.
        let pages = unsafe { core::slice::from_raw_parts_mut(self.pages, self.page_count) };
        AreaGuard { free_list, pages }
    }

    pub fn heap(&self) -> *const Heap {
        self.heap
    }

    pub fn region(&self) -> RegionHandle {
        RegionHandle {
            owner: self.owner.load(Ordering::Relaxed),
            base: self as *const Area as usize,
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.size
    }

    #[inline]
    pub fn page_index(&self, address: usize) -> usize {
        (address - self.base) / page_size()
    }

    #[inline]
    pub fn page_address(&self, index: usize) -> usize {
        self.base + index * page_size()
    }

    /// Carve a run of `pages_needed` pages (data plus guard) for `size`
    /// bytes. Scans the free list oldest entry first and takes the first
    /// position where the whole run is unused.
    pub fn allocate(
        &self,
        pages_needed: usize,
        size: usize,
        alignment: usize,
        trace: &StackTrace,
        thread: usize,
    ) -> Option<usize> {
        if pages_needed < 2 {
            panic!("guarded run of {} pages has no room for a guard page", pages_needed);
        }
        let ps = page_size();
        let mut guard = self.lock();
        let AreaGuard { free_list, pages } = &mut guard;

        let start = free_list
            .iter(pages)
            .find(|&index| run_fits(pages, index, pages_needed))?;

        let run_start = self.page_address(start);
        let guard_address = run_start + (pages_needed - 1) * ps;
        let address = align_down(guard_address - size, alignment);

        for offset in 0..pages_needed {
            let index = start + offset;
            free_list.remove(pages, index);
            let mut flags = PageFlags::USED;
            if offset == 0 {
                flags.insert(PageFlags::FIRST);
            }
            if offset == pages_needed - 1 {
                flags.insert(PageFlags::GUARD);
            }
            pages[index].record_allocation(flags, address, size, alignment, thread);
        }
        pages[start].set_alloc_trace(trace);

        // SAFETY: the run lies inside this area's data pages.
        let protected = unsafe {
            platform::protect_read_write(run_start as *mut u8, guard_address - run_start)
                && platform::protect_none(guard_address as *mut u8, ps)
        };
        if !protected {
            // Return the run to the free list.
            for index in start..start + pages_needed {
                pages[index] = Page::EMPTY;
                free_list.push_back(pages, index);
            }
            let _ = unsafe { platform::protect_none(run_start as *mut u8, pages_needed * ps) };
            drop(guard);
            self.owner_heap().fatal(format_args!(
                "out of memory: cannot protect run of {} pages at {:#x}",
                pages_needed, run_start
            ));
        }
        self.used_pages.fetch_add(pages_needed, Ordering::Relaxed);
        Some(address)
    }

    fn owner_heap(&self) -> &Heap {
        // SAFETY: areas are created for a pinned, initialized heap and
        // unmapped before it goes away.
        unsafe { &*self.heap }
    }

    /// Retire the run whose first page is `index`. Returns the run length.
    pub fn free(
        &self,
        address: usize,
        index: usize,
        reuse: bool,
        trace: &StackTrace,
        thread: usize,
    ) -> Result<usize, Rejection> {
        let mut guard = self.lock();
        self.check_allocation(guard.pages, address, index)?;
        let AreaGuard { free_list, pages } = &mut guard;

        let mut cursor = index;
        loop {
            if cursor >= self.page_count {
                panic!("run starting at page {} has no guard page", index);
            }
            let page = &mut pages[cursor];
            let is_guard = page.flags.contains(PageFlags::GUARD);
            page.freeing_thread = thread;
            if reuse {
                page.flags = PageFlags::NONE;
                free_list.push_back(pages, cursor);
            } else {
                page.flags.insert(PageFlags::DEAD);
            }
            if is_guard {
                break;
            }
            cursor += 1;
        }
        pages[index].append_free_trace(trace);

        let run_length = cursor - index + 1;
        // SAFETY: the data pages lie inside this area.
        let protected = run_length == 1
            || unsafe {
                platform::protect_none(
                    self.page_address(index) as *mut u8,
                    (run_length - 1) * page_size(),
                )
            };
        if !protected {
            drop(guard);
            self.owner_heap().fatal(format_args!(
                "out of memory: cannot protect freed run at {:#x}",
                self.page_address(index)
            ));
        }
        if reuse {
            self.used_pages.fetch_sub(run_length, Ordering::Relaxed);
        }
        Ok(run_length)
    }

    /// Requested size of the live allocation starting at `address`.
    pub fn allocation_size(&self, address: usize, index: usize) -> Result<usize, Rejection> {
        let guard = self.lock();
        self.check_allocation(guard.pages, address, index)?;
        Ok(guard.pages[index].allocation_size)
    }

    /// Metadata of the live allocation starting at `address`.
    pub fn allocation_record(&self, address: usize, index: usize) -> Option<Page> {
        let guard = self.lock();
        self.check_allocation(guard.pages, address, index).ok()?;
        Some(guard.pages[index])
    }

    fn check_allocation(&self, pages: &[Page], address: usize, index: usize) -> Result<(), Rejection> {
        let page = &pages[index];
        let misuse = if !page.flags.contains(PageFlags::USED) {
            Some(Misuse::DoubleFree)
        } else if page.flags.contains(PageFlags::GUARD) {
            Some(Misuse::GuardPage)
        } else if page.flags.contains(PageFlags::DEAD) {
            Some(Misuse::DeadPage)
        } else if !page.flags.contains(PageFlags::FIRST) || page.allocation_base != address {
            Some(Misuse::NotAllocationStart)
        } else {
            None
        };
        match misuse {
            None => Ok(()),
            Some(misuse) => Err(Rejection {
                misuse,
                page: *page,
                first: self.first_page_of(pages, page),
            }),
        }
    }

    /// The FIRST page of the run `page` belongs to, or `page` itself when
    /// its recorded base lies elsewhere.
    fn first_page_of(&self, pages: &[Page], page: &Page) -> Page {
        if self.contains(page.allocation_base) {
            let first = pages[self.page_index(page.allocation_base)];
            if first.flags.contains(PageFlags::FIRST) {
                return first;
            }
        }
        *page
    }

    /// Copies of the record for `index` and of its run's first page, read
    /// without the lock. Used by the fault handler.
    ///
    /// # Safety
    /// `index` must be below `page_count`. Another thread may be updating
    /// the records concurrently; the copies are best effort.
    pub unsafe fn snapshot(&self, index: usize) -> (Page, Page) {
        let page = ptr::read_volatile(self.pages.add(index));
        let mut first = page;
        if self.contains(page.allocation_base) {
            let candidate = ptr::read_volatile(self.pages.add(self.page_index(page.allocation_base)));
            if candidate.flags.contains(PageFlags::FIRST) {
                first = candidate;
            }
        }
        (page, first)
    }

    /// Visit the first page of every live allocation under the lock.
    pub fn for_each_allocation(&self, mut f: impl FnMut(&Page)) {
        let guard = self.lock();
        for page in guard.pages.iter() {
            if page.flags.contains(PageFlags::USED | PageFlags::FIRST)
                && !page.flags.contains(PageFlags::DEAD)
            {
                f(page);
            }
        }
    }

    /// Check the free list against the page flags and the shape of every run.
    pub fn validate(&self) -> Result<(), Corruption> {
        let guard = self.lock();
        let pages = &*guard.pages;
        if !guard.free_list.is_consistent(pages) {
            return Err(Corruption {
                page: 0,
                reason: "free list links are inconsistent",
            });
        }
        let unused = pages.iter().filter(|p| p.is_listed()).count();
        if unused != guard.free_list.len() {
            return Err(Corruption {
                page: 0,
                reason: "free list length does not match unused pages",
            });
        }
        if pages.len() - unused != self.used_pages() {
            return Err(Corruption {
                page: 0,
                reason: "used page counter does not match page flags",
            });
        }

        let mut index = 0;
        while index < pages.len() {
            let page = &pages[index];
            let live = page.flags.contains(PageFlags::USED) && !page.flags.contains(PageFlags::DEAD);
            if !live {
                index += 1;
                continue;
            }
            if !page.flags.contains(PageFlags::FIRST) {
                return Err(Corruption {
                    page: index,
                    reason: "live page outside of a run",
                });
            }
            let base = page.allocation_base;
            let mut cursor = index;
            loop {
                let Some(member) = pages.get(cursor) else {
                    return Err(Corruption {
                        page: index,
                        reason: "run has no guard page",
                    });
                };
                if !member.flags.contains(PageFlags::USED)
                    || member.flags.contains(PageFlags::DEAD)
                    || member.allocation_base != base
                    || (cursor != index && member.flags.contains(PageFlags::FIRST))
                {
                    return Err(Corruption {
                        page: cursor,
                        reason: "run pages disagree",
                    });
                }
                if member.flags.contains(PageFlags::GUARD) {
                    break;
                }
                cursor += 1;
            }
            if cursor == index {
                return Err(Corruption {
                    page: index,
                    reason: "run without data pages",
                });
            }
            index = cursor + 1;
        }
        Ok(())
    }

    /// Describe the area, optionally listing every non-free page.
    pub fn write_summary(&self, out: &mut dyn fmt::Write, include_pages: bool) -> fmt::Result {
        let guard = self.lock();
        let region = self.region();
        writeln!(
            out,
            "  area {:p}: region {}@{:#x}, base {:#x}, size {}, pages {}, used {}, free list {}",
            self as *const Area,
            region.owner,
            region.base,
            self.base,
            self.size,
            self.page_count,
            self.used_pages(),
            guard.free_list.len()
        )?;
        if include_pages {
            for (index, page) in guard.pages.iter().enumerate() {
                if page.flags.is_empty() {
                    continue;
                }
                writeln!(
                    out,
                    "    page {:5} {:#x}: {} (base {:#x}, size {})",
                    index,
                    self.page_address(index),
                    page.flags,
                    page.allocation_base,
                    page.allocation_size
                )?;
            }
        }
        Ok(())
    }

    /// Reset the mutex and adopt the mapping in the calling process.
    ///
    /// # Safety
    /// Only in the single-threaded child right after `fork`.
    pub unsafe fn reinit_after_fork(&self) {
        self.free_list.force_unlock();
        let region = RegionHandle::resolve(self as *const Area as usize);
        self.owner.store(region.owner, Ordering::Relaxed);
    }
}

fn run_fits(pages: &[Page], start: usize, len: usize) -> bool {
    start + len <= pages.len() && pages[start..start + len].iter().all(Page::is_listed)
}
