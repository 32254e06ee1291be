//! Per-page records and the index-linked free list threaded through them.

use crate::trace::StackTrace;
use crate::util::MAX_STACK_TRACE_DEPTH;
use core::fmt;
use core::ops::BitOr;

/// State bits of a page record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u8);

impl PageFlags {
    pub const NONE: PageFlags = PageFlags(0);
    /// Part of a live run, or permanently retired (with DEAD).
    pub const USED: PageFlags = PageFlags(0x01);
    /// First data page of a run; holds the stack traces.
    pub const FIRST: PageFlags = PageFlags(0x02);
    /// Trailing inaccessible page of a run.
    pub const GUARD: PageFlags = PageFlags(0x04);
    /// Freed while memory reuse was off; never handed out again.
    pub const DEAD: PageFlags = PageFlags(0x08);
    /// Synthesized record at the start of a dedicated region.
    pub const AREA: PageFlags = PageFlags(0x10);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: PageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: PageFlags) -> PageFlags {
        PageFlags(self.0 | other.0)
    }

    #[inline]
    pub fn insert(&mut self, other: PageFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PageFlags {
    type Output = PageFlags;

    fn bitor(self, rhs: PageFlags) -> PageFlags {
        PageFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("free");
        }
        let names = [
            (PageFlags::USED, "used"),
            (PageFlags::FIRST, "first"),
            (PageFlags::GUARD, "guard"),
            (PageFlags::DEAD, "dead"),
            (PageFlags::AREA, "area"),
        ];
        let mut separator = "";
        for (flag, name) in names {
            if self.contains(flag) {
                write!(f, "{}{}", separator, name)?;
                separator = " ";
            }
        }
        Ok(())
    }
}

/// Sentinel for "no page" in free-list links.
pub const NO_PAGE: u32 = u32::MAX;

/// Metadata for one page of an area (or the head of a dedicated region).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Page {
    pub flags: PageFlags,
    alloc_stack_depth: u16,
    free_stack_depth: u16,
    prev_free: u32,
    next_free: u32,
    pub allocation_size: usize,
    pub allocation_base: usize,
    pub alignment: usize,
    pub allocating_thread: usize,
    pub freeing_thread: usize,
    /// Alloc frames first, free frames appended after them.
    stack_trace: [usize; MAX_STACK_TRACE_DEPTH],
}

impl Page {
    pub const EMPTY: Page = Page {
        flags: PageFlags::NONE,
        alloc_stack_depth: 0,
        free_stack_depth: 0,
        prev_free: NO_PAGE,
        next_free: NO_PAGE,
        allocation_size: 0,
        allocation_base: 0,
        alignment: 0,
        allocating_thread: 0,
        freeing_thread: 0,
        stack_trace: [0; MAX_STACK_TRACE_DEPTH],
    };

    /// Stamp the page as part of the allocation `[base, base + size)`.
    pub fn record_allocation(
        &mut self,
        flags: PageFlags,
        base: usize,
        size: usize,
        alignment: usize,
        thread: usize,
    ) {
        self.flags = flags;
        self.allocation_base = base;
        self.allocation_size = size;
        self.alignment = alignment;
        self.allocating_thread = thread;
        self.freeing_thread = 0;
        self.alloc_stack_depth = 0;
        self.free_stack_depth = 0;
    }

    pub fn set_alloc_trace(&mut self, trace: &StackTrace) {
        let frames = trace.frames();
        self.stack_trace[..frames.len()].copy_from_slice(frames);
        self.alloc_stack_depth = frames.len() as u16;
        self.free_stack_depth = 0;
    }

    /// Store the free trace after the alloc trace, truncated to what fits.
    pub fn append_free_trace(&mut self, trace: &StackTrace) {
        let start = self.alloc_stack_depth as usize;
        let room = MAX_STACK_TRACE_DEPTH - start;
        let frames = trace.frames();
        let n = frames.len().min(room);
        self.stack_trace[start..start + n].copy_from_slice(&frames[..n]);
        self.free_stack_depth = n as u16;
    }

    pub fn alloc_trace(&self) -> &[usize] {
        &self.stack_trace[..self.alloc_stack_depth as usize]
    }

    pub fn free_trace(&self) -> &[usize] {
        let start = self.alloc_stack_depth as usize;
        &self.stack_trace[start..start + self.free_stack_depth as usize]
    }

    /// Whether the page currently sits in its area's free list.
    #[inline]
    pub fn is_listed(&self) -> bool {
        !self.flags.contains(PageFlags::USED)
    }
}

/// Intrusive doubly linked list of page indices, oldest entry at the head.
///
/// The links live in the page records themselves, so the list never
/// allocates; every operation takes the record array it threads through.
#[derive(Debug)]
pub struct FreeList {
    head: u32,
    tail: u32,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList {
            head: NO_PAGE,
            tail: NO_PAGE,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `index` at the tail (youngest end).
    pub fn push_back(&mut self, pages: &mut [Page], index: usize) {
        let idx = index as u32;
        pages[index].prev_free = self.tail;
        pages[index].next_free = NO_PAGE;
        if self.tail == NO_PAGE {
            self.head = idx;
        } else {
            pages[self.tail as usize].next_free = idx;
        }
        self.tail = idx;
        self.len += 1;
    }

    /// Unlink `index`, which must currently be in the list.
    pub fn remove(&mut self, pages: &mut [Page], index: usize) {
        let prev = pages[index].prev_free;
        let next = pages[index].next_free;
        if prev == NO_PAGE {
            self.head = next;
        } else {
            pages[prev as usize].next_free = next;
        }
        if next == NO_PAGE {
            self.tail = prev;
        } else {
            pages[next as usize].prev_free = prev;
        }
        pages[index].prev_free = NO_PAGE;
        pages[index].next_free = NO_PAGE;
        self.len -= 1;
    }

    /// Walk from the oldest entry to the youngest.
    pub fn iter<'a>(&self, pages: &'a [Page]) -> FreeListIter<'a> {
        FreeListIter {
            pages,
            next: self.head,
        }
    }

    /// Check that the links are mutually consistent and match `len`.
    pub fn is_consistent(&self, pages: &[Page]) -> bool {
        let mut prev = NO_PAGE;
        let mut cursor = self.head;
        let mut count = 0;
        while cursor != NO_PAGE {
            let Some(page) = pages.get(cursor as usize) else {
                return false;
            };
            if page.prev_free != prev || count > pages.len() {
                return false;
            }
            prev = cursor;
            cursor = page.next_free;
            count += 1;
        }
        prev == self.tail && count == self.len
    }
}

pub struct FreeListIter<'a> {
    pages: &'a [Page],
    next: u32,
}

impl Iterator for FreeListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.next == NO_PAGE {
            return None;
        }
        let index = self.next as usize;
        self.next = self.pages[index].next_free;
        Some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages(n: usize) -> Vec<Page> {
        vec![Page::EMPTY; n]
    }

    #[test]
    fn push_back_keeps_oldest_first() {
        let mut p = pages(4);
        let mut list = FreeList::new();
        for i in [2, 0, 3] {
            list.push_back(&mut p, i);
        }
        assert_eq!(list.iter(&p).collect::<Vec<_>>(), vec![2, 0, 3]);
        assert_eq!(list.len(), 3);
        assert!(list.is_consistent(&p));
    }

    #[test]
    fn remove_head_middle_tail() {
        let mut p = pages(5);
        let mut list = FreeList::new();
        for i in 0..5 {
            list.push_back(&mut p, i);
        }
        list.remove(&mut p, 0);
        list.remove(&mut p, 2);
        list.remove(&mut p, 4);
        assert_eq!(list.iter(&p).collect::<Vec<_>>(), vec![1, 3]);
        assert!(list.is_consistent(&p));
        list.remove(&mut p, 1);
        list.remove(&mut p, 3);
        assert!(list.is_empty());
        assert!(list.is_consistent(&p));
    }

    #[test]
    fn reinserted_page_moves_to_tail() {
        let mut p = pages(3);
        let mut list = FreeList::new();
        for i in 0..3 {
            list.push_back(&mut p, i);
        }
        list.remove(&mut p, 0);
        list.push_back(&mut p, 0);
        assert_eq!(list.iter(&p).collect::<Vec<_>>(), vec![1, 2, 0]);
    }

    #[test]
    fn corrupted_link_is_detected() {
        let mut p = pages(3);
        let mut list = FreeList::new();
        for i in 0..3 {
            list.push_back(&mut p, i);
        }
        p[2].prev_free = 0;
        assert!(!list.is_consistent(&p));
    }

    #[test]
    fn flags_display() {
        assert_eq!(PageFlags::NONE.to_string(), "free");
        assert_eq!(
            (PageFlags::USED | PageFlags::GUARD | PageFlags::DEAD).to_string(),
            "used guard dead"
        );
    }

    #[test]
    fn free_trace_truncates_to_remaining_capacity() {
        let mut page = Page::EMPTY;
        page.alloc_stack_depth = (MAX_STACK_TRACE_DEPTH - 2) as u16;
        let trace = StackTrace::capture(MAX_STACK_TRACE_DEPTH);
        page.append_free_trace(&trace);
        assert!(page.free_trace().len() <= 2);
        assert_eq!(page.alloc_trace().len(), MAX_STACK_TRACE_DEPTH - 2);
    }

    #[test]
    fn record_allocation_resets_traces() {
        let mut page = Page::EMPTY;
        page.alloc_stack_depth = 3;
        page.free_stack_depth = 2;
        page.record_allocation(PageFlags::USED | PageFlags::FIRST, 0x1000, 64, 1, 7);
        assert!(page.alloc_trace().is_empty());
        assert!(page.free_trace().is_empty());
        assert_eq!(page.allocating_thread, 7);
        assert!(!page.is_listed());
    }
}
