//! Formatting of misuse and fault diagnostics.
//!
//! Everything here is a pure function over copied page records, so the
//! signal handler can use it and tests can exercise it without faulting.

use super::PREFIX;
use crate::heap::page::{Page, PageFlags};
use crate::trace::{write_frames, SymbolResolver};
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Unknown,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Unknown => "unknown",
        })
    }
}

/// What the faulting address turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    NotAllocated,
    GuardPage,
    DeadPage,
    Unknown,
}

impl FaultKind {
    /// Classify a fault inside an area from the page record it landed on.
    pub fn classify(flags: PageFlags) -> FaultKind {
        if !flags.contains(PageFlags::USED) {
            FaultKind::NotAllocated
        } else if flags.contains(PageFlags::GUARD) {
            FaultKind::GuardPage
        } else if flags.contains(PageFlags::DEAD) {
            FaultKind::DeadPage
        } else {
            FaultKind::Unknown
        }
    }

    /// Classify a fault inside a dedicated region from its record: anything
    /// outside the user range is one of the protected pages around it.
    pub fn classify_region(address: usize, record: &Page) -> FaultKind {
        let start = record.allocation_base;
        if address < start || address >= start + record.allocation_size {
            FaultKind::GuardPage
        } else {
            FaultKind::Unknown
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            FaultKind::NotAllocated => "not allocated",
            FaultKind::GuardPage => "a guard page",
            FaultKind::DeadPage => "a dead page",
            FaultKind::Unknown => "unknown",
        }
    }
}

/// Where the faulting address lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultLocation {
    Area {
        area: usize,
        page_index: usize,
        page_address: usize,
    },
    DedicatedRegion {
        base: usize,
        total_size: usize,
    },
}

/// Everything the fault handler knows about a protection fault.
pub struct FaultReport {
    pub address: usize,
    pub access: AccessKind,
    pub kind: FaultKind,
    pub location: FaultLocation,
    /// Record of the page the fault landed on.
    pub page: Page,
    /// Record of the first page of the run, which holds the traces.
    pub first: Page,
}

impl FaultReport {
    pub fn write(&self, out: &mut dyn fmt::Write, symbols: &dyn SymbolResolver) -> fmt::Result {
        writeln!(
            out,
            "{}invalid {} access at {:#x}, which is {}",
            PREFIX,
            self.access,
            self.address,
            self.kind.describe()
        )?;
        match self.location {
            FaultLocation::Area {
                area,
                page_index,
                page_address,
            } => writeln!(
                out,
                "  in area {:#x}, page {} at {:#x}",
                area, page_index, page_address
            )?,
            FaultLocation::DedicatedRegion { base, total_size } => writeln!(
                out,
                "  in dedicated region {:#x}, size {}",
                base, total_size
            )?,
        }
        write_page_details(out, &self.page, &self.first, symbols)
    }
}

/// Header line for an allocator misuse, followed by the page details when
/// the address could be attributed to a page.
pub fn write_misuse(
    out: &mut dyn fmt::Write,
    what: &str,
    address: usize,
    records: Option<(&Page, &Page)>,
    symbols: &dyn SymbolResolver,
) -> fmt::Result {
    writeln!(out, "{}{} at {:#x}", PREFIX, what, address)?;
    match records {
        Some((page, first)) => write_page_details(out, page, first, symbols),
        None => Ok(()),
    }
}

/// Allocation metadata from `page` and both stack traces from `first`.
pub fn write_page_details(
    out: &mut dyn fmt::Write,
    page: &Page,
    first: &Page,
    symbols: &dyn SymbolResolver,
) -> fmt::Result {
    writeln!(
        out,
        "  page flags: {}; allocation base {:#x}, size {}, alignment {}",
        page.flags, page.allocation_base, page.allocation_size, page.alignment
    )?;
    writeln!(
        out,
        "  allocating thread {}, freeing thread {}",
        page.allocating_thread, page.freeing_thread
    )?;
    write_trace(out, "alloc", first.alloc_trace(), symbols)?;
    write_trace(out, "free", first.free_trace(), symbols)
}

fn write_trace(
    out: &mut dyn fmt::Write,
    label: &str,
    frames: &[usize],
    symbols: &dyn SymbolResolver,
) -> fmt::Result {
    if frames.is_empty() {
        return writeln!(out, "  {} stack trace: none", label);
    }
    writeln!(out, "  {} stack trace:", label)?;
    write_frames(out, frames, symbols)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{NoSymbols, StackTrace};

    fn run_page(flags: PageFlags) -> Page {
        let mut page = Page::EMPTY;
        page.record_allocation(flags, 0x5000_0f9c, 100, 1, 42);
        page
    }

    #[test]
    fn classification_order() {
        assert_eq!(FaultKind::classify(PageFlags::NONE), FaultKind::NotAllocated);
        assert_eq!(
            FaultKind::classify(PageFlags::GUARD),
            FaultKind::NotAllocated
        );
        assert_eq!(
            FaultKind::classify(PageFlags::USED | PageFlags::GUARD | PageFlags::DEAD),
            FaultKind::GuardPage
        );
        assert_eq!(
            FaultKind::classify(PageFlags::USED | PageFlags::FIRST | PageFlags::DEAD),
            FaultKind::DeadPage
        );
        assert_eq!(
            FaultKind::classify(PageFlags::USED | PageFlags::FIRST),
            FaultKind::Unknown
        );
    }

    #[test]
    fn region_faults_outside_user_range_hit_guards() {
        let page = run_page(PageFlags::USED | PageFlags::FIRST | PageFlags::AREA);
        assert_eq!(
            FaultKind::classify_region(0x5000_0f9c + 100, &page),
            FaultKind::GuardPage
        );
        assert_eq!(
            FaultKind::classify_region(0x5000_0000, &page),
            FaultKind::GuardPage
        );
        assert_eq!(
            FaultKind::classify_region(0x5000_0fa0, &page),
            FaultKind::Unknown
        );
    }

    #[test]
    fn guard_fault_report_names_everything() {
        let page = run_page(PageFlags::USED | PageFlags::GUARD);
        let mut first = run_page(PageFlags::USED | PageFlags::FIRST);
        first.set_alloc_trace(&StackTrace::capture(4));
        let report = FaultReport {
            address: 0x5000_1000,
            access: AccessKind::Write,
            kind: FaultKind::classify(page.flags),
            location: FaultLocation::Area {
                area: 0x4000_0000,
                page_index: 1,
                page_address: 0x5000_1000,
            },
            page,
            first,
        };
        let mut out = String::new();
        report.write(&mut out, &NoSymbols).unwrap();
        assert!(out.starts_with(
            "guardheap: invalid write access at 0x50001000, which is a guard page\n"
        ));
        assert!(out.contains("page 1 at 0x50001000"));
        assert!(out.contains("page flags: used guard; allocation base 0x50000f9c, size 100"));
        assert!(out.contains("allocating thread 42, freeing thread 0"));
        assert!(out.contains("free stack trace: none"));
    }

    #[test]
    fn misuse_without_records_is_one_line() {
        let mut out = String::new();
        write_misuse(&mut out, "free of unrecognized address", 0x1234, None, &NoSymbols).unwrap();
        assert_eq!(out, "guardheap: free of unrecognized address at 0x1234\n");
    }

    #[test]
    fn misuse_with_records_prints_both_traces() {
        let mut page = run_page(PageFlags::NONE);
        page.freeing_thread = 43;
        let mut out = String::new();
        write_misuse(&mut out, "double free", 0x5000_0f9c, Some((&page, &page)), &NoSymbols)
            .unwrap();
        assert!(out.contains("double free at 0x50000f9c"));
        assert!(out.contains("page flags: free;"));
        assert!(out.contains("freeing thread 43"));
        assert!(out.contains("alloc stack trace"));
        assert!(out.contains("free stack trace"));
    }
}
