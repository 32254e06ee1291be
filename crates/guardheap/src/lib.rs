//! A guard-page debugging allocator.
//!
//! Every allocation is placed so that it ends exactly at an inaccessible
//! guard page, and freed memory is protected again, so overruns and
//! use-after-free fault immediately. The fault handler turns the fault into
//! a report naming the allocation, its threads and stack traces.
//!
//! ```rust,ignore
//! use guardheap::{Heap, Options};
//!
//! let heap = Box::pin(Heap::new(Options::parse("stack_trace_depth=16").unwrap()));
//! heap.as_ref().init()?;
//! let p = heap.allocate(100);
//! unsafe { heap.free(p) };
//! ```

extern crate libc;

#[cfg(feature = "c-abi")]
pub mod api;
pub mod config;
pub mod error;
pub mod global_alloc;
pub mod hardening;
pub mod heap;
pub mod huge;
pub mod init;
pub mod platform;
pub mod sync;
pub mod trace;
pub mod util;
pub mod vtable;

pub use config::{ConfigError, Options, Settings};
pub use error::HeapError;
pub use global_alloc::GuardHeap;
pub use hardening::report::{AccessKind, FaultKind, FaultReport};
pub use heap::{AllocationInfo, AllocationStats, Heap, Owner};
pub use trace::{DladdrResolver, NoSymbols, SymbolResolver};
pub use vtable::DebugAllocator;
