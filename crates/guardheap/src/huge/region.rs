use crate::heap::page::{Page, PageFlags};
use crate::platform;
use crate::trace::StackTrace;
use crate::util::{align_down, align_up};
use core::mem::size_of;

/// Tag carried by the record at the start of every dedicated region.
pub const REGION_TAG: PageFlags = PageFlags::USED
    .union(PageFlags::FIRST)
    .union(PageFlags::AREA);

/// Geometry of a dedicated region, computed before anything is mapped.
///
/// Layout: `[record] [padding] [user data] [guard]`. With alignment up to a
/// page the record shares the first page with the data, otherwise it gets a
/// page of its own and the slack in front of the data is protected too.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPlan {
    pub info_space: usize,
    /// Pages before the trailing guard page.
    pub pages_needed: usize,
    pub total_size: usize,
}

impl RegionPlan {
    /// Returns `None` when the sizes overflow.
    pub fn new(size: usize, alignment: usize, page_size: usize) -> Option<Self> {
        let info_space = if alignment >= page_size {
            page_size
        } else {
            align_up(size_of::<Page>(), alignment)
        };
        let mut pages_needed = size.checked_add(info_space)?.div_ceil(page_size);
        if alignment > page_size {
            pages_needed = pages_needed.checked_add(alignment / page_size - 1)?;
        }
        let total_size = pages_needed.checked_add(1)?.checked_mul(page_size)?;
        Some(RegionPlan {
            info_space,
            pages_needed,
            total_size,
        })
    }

    /// User pointer for a region mapped at `base`: flush against the guard,
    /// rounded down to `alignment`.
    pub fn place(&self, base: usize, size: usize, alignment: usize, page_size: usize) -> usize {
        align_down(base + self.pages_needed * page_size - size, alignment)
    }
}

/// A mapped dedicated region. Plain addresses so copies can be taken from
/// the lock-free registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HugeRegion {
    pub base: usize,
    pub total_size: usize,
    pub user_ptr: usize,
}

impl HugeRegion {
    /// Map and initialize a region for `size` bytes at `alignment`.
    /// Returns `None` if the sizes overflow, or the mapping or its guard
    /// protection fails.
    ///
    /// # Safety
    /// `alignment` must be a power of two and `size` non-zero.
    pub unsafe fn create(
        size: usize,
        alignment: usize,
        trace: &StackTrace,
        thread: usize,
    ) -> Option<Self> {
        let ps = crate::util::page_size();
        let plan = RegionPlan::new(size, alignment, ps)?;
        let base = platform::map_anonymous(plan.total_size);
        if base.is_null() {
            return None;
        }
        let base = base as usize;
        let user_ptr = plan.place(base, size, alignment, ps);

        let record = base as *mut Page;
        record.write(Page::EMPTY);
        (*record).record_allocation(REGION_TAG, user_ptr, size, alignment, thread);
        (*record).set_alloc_trace(trace);

        let guard_start = base + plan.pages_needed * ps;
        let protected = if alignment > ps {
            let data_start = align_down(user_ptr, ps);
            let data_end = align_up(user_ptr + size, ps);
            (data_start <= base + ps
                || platform::protect_none((base + ps) as *mut u8, data_start - base - ps))
                && platform::protect_none(data_end as *mut u8, base + plan.total_size - data_end)
        } else {
            platform::protect_none(guard_start as *mut u8, ps)
        };
        if !protected {
            platform::unmap(base as *mut u8, plan.total_size);
            return None;
        }

        Some(HugeRegion {
            base,
            total_size: plan.total_size,
            user_ptr,
        })
    }

    #[inline]
    pub fn record(&self) -> *mut Page {
        self.base as *mut Page
    }

    /// Copy of the region's page record.
    ///
    /// # Safety
    /// The region must still be mapped.
    pub unsafe fn snapshot(&self) -> Page {
        core::ptr::read_volatile(self.record())
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.total_size
    }

    /// Whether the record still describes an allocation starting at `address`.
    ///
    /// # Safety
    /// The region must still be mapped.
    pub unsafe fn verify(&self, address: usize) -> bool {
        let record = &*self.record();
        record.flags == REGION_TAG
            && record.allocation_base == address
            && record.allocation_size < self.total_size
    }

    /// # Safety
    /// The region must be mapped and no longer referenced.
    pub unsafe fn destroy(&self) {
        platform::unmap(self.base as *mut u8, self.total_size);
    }
}
