//! Allocation provenance: per-thread context, frame-pointer stack capture and
//! the symbol-resolution seam used when traces are printed.

use crate::platform;
use crate::util::MAX_STACK_TRACE_DEPTH;
use core::cell::Cell;
use core::fmt;

/// Frames belonging to the allocator itself, dropped from every capture.
const SKIP_FRAMES: usize = 2;

/// Lazily populated state of the calling thread.
///
/// Every field is filled on first use and then cached, so a thread that
/// never captures a stack trace never pays for the stack-bounds lookup.
pub struct ThreadContext {
    thread_id: Cell<usize>,
    stack_bounds: Cell<Option<(usize, usize)>>,
    /// Set while the bounds lookup runs; it may re-enter the allocator.
    resolving_bounds: Cell<bool>,
    bounds_unavailable: Cell<bool>,
}

thread_local! {
    static CONTEXT: ThreadContext = const { ThreadContext::new() };
}

impl ThreadContext {
    const fn new() -> Self {
        ThreadContext {
            thread_id: Cell::new(0),
            stack_bounds: Cell::new(None),
            resolving_bounds: Cell::new(false),
            bounds_unavailable: Cell::new(false),
        }
    }

    /// Run `f` with the calling thread's context. Returns `None` while the
    /// thread is being torn down.
    pub fn with<R>(f: impl FnOnce(&ThreadContext) -> R) -> Option<R> {
        CONTEXT.try_with(f).ok()
    }

    pub fn thread_id(&self) -> usize {
        let cached = self.thread_id.get();
        if cached != 0 {
            return cached;
        }
        let tid = platform::current_thread_id();
        self.thread_id.set(tid);
        tid
    }

    /// Stack bounds of this thread, looked up once.
    pub fn stack_bounds(&self) -> Option<(usize, usize)> {
        if let Some(bounds) = self.stack_bounds.get() {
            return Some(bounds);
        }
        if self.bounds_unavailable.get() || self.resolving_bounds.get() {
            return None;
        }
        self.resolving_bounds.set(true);
        let bounds = platform::current_stack_bounds();
        self.resolving_bounds.set(false);
        match bounds {
            Some(bounds) => self.stack_bounds.set(Some(bounds)),
            None => self.bounds_unavailable.set(true),
        }
        bounds
    }
}

/// Identifier of the calling thread (0 during thread teardown).
pub fn current_thread_id() -> usize {
    ThreadContext::with(|ctx| ctx.thread_id()).unwrap_or(0)
}

/// A fixed-capacity list of return addresses.
#[derive(Clone, Copy)]
pub struct StackTrace {
    frames: [usize; MAX_STACK_TRACE_DEPTH],
    depth: usize,
}

impl StackTrace {
    pub const fn empty() -> Self {
        StackTrace {
            frames: [0; MAX_STACK_TRACE_DEPTH],
            depth: 0,
        }
    }

    /// Capture up to `max_depth` frames of the caller's stack.
    ///
    /// Walks the frame-pointer chain, accepting only frames that lie inside
    /// the thread's stack and move towards its top, so a chain broken by code
    /// built without frame pointers ends the walk instead of faulting.
    #[inline(never)]
    pub fn capture(max_depth: usize) -> Self {
        let mut trace = StackTrace::empty();
        let max_depth = max_depth.min(MAX_STACK_TRACE_DEPTH);
        if max_depth == 0 {
            return trace;
        }
        let Some((low, high)) = ThreadContext::with(|ctx| ctx.stack_bounds()).flatten() else {
            return trace;
        };

        let word = core::mem::size_of::<usize>();
        let mut fp = platform::frame_pointer();
        let mut skipped = 0;
        while trace.depth < max_depth {
            if fp < low || fp + 2 * word > high || fp % word != 0 {
                break;
            }
            // SAFETY: `fp` lies within the current thread's stack, above the
            // frame we are executing in.
            let (next, return_address) = unsafe {
                let frame = fp as *const usize;
                (frame.read(), frame.add(1).read())
            };
            if return_address == 0 {
                break;
            }
            if skipped < SKIP_FRAMES {
                skipped += 1;
            } else {
                trace.frames[trace.depth] = return_address;
                trace.depth += 1;
            }
            if next <= fp {
                break;
            }
            fp = next;
        }
        trace
    }

    pub fn frames(&self) -> &[usize] {
        &self.frames[..self.depth]
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }
}

/// Resolves a return address to something readable. Implementations run in
/// the fault handler, so they must not allocate or take locks the heap holds.
pub trait SymbolResolver: Sync {
    fn write_symbol(&self, address: usize, out: &mut dyn fmt::Write) -> fmt::Result;
}

/// Prints bare addresses.
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn write_symbol(&self, address: usize, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{:#x}", address)
    }
}

/// Looks addresses up in the dynamic symbol tables via `dladdr`.
pub struct DladdrResolver;

impl SymbolResolver for DladdrResolver {
    fn write_symbol(&self, address: usize, out: &mut dyn fmt::Write) -> fmt::Result {
        let mut info: libc::Dl_info = unsafe { core::mem::zeroed() };
        let found = unsafe { libc::dladdr(address as *const libc::c_void, &mut info) } != 0;
        write!(out, "{:#x}", address)?;
        if !found {
            return Ok(());
        }
        if !info.dli_sname.is_null() {
            let name = unsafe { core::ffi::CStr::from_ptr(info.dli_sname) };
            let offset = address.wrapping_sub(info.dli_saddr as usize);
            write!(out, " <{}+{:#x}>", name.to_str().unwrap_or("?"), offset)?;
        }
        if !info.dli_fname.is_null() {
            let image = unsafe { core::ffi::CStr::from_ptr(info.dli_fname) };
            let image = image.to_str().unwrap_or("?");
            let short = image.rsplit('/').next().unwrap_or(image);
            write!(out, " in {}", short)?;
        }
        Ok(())
    }
}

/// Write `frames` one per line, indented, through `symbols`.
pub fn write_frames(
    out: &mut dyn fmt::Write,
    frames: &[usize],
    symbols: &dyn SymbolResolver,
) -> fmt::Result {
    for (index, &address) in frames.iter().enumerate() {
        write!(out, "    #{:<2} ", index)?;
        symbols.write_symbol(address, out)?;
        out.write_char('\n')?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_ids_are_cached_and_distinct() {
        let main = current_thread_id();
        assert_ne!(main, 0);
        assert_eq!(main, current_thread_id());
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(main, other);
    }

    #[test]
    fn zero_depth_skips_capture() {
        let trace = StackTrace::capture(0);
        assert!(trace.is_empty());
    }

    #[test]
    fn capture_respects_requested_depth() {
        let trace = StackTrace::capture(3);
        assert!(trace.frames().len() <= 3);
    }

    #[test]
    fn capture_never_exceeds_buffer() {
        let trace = StackTrace::capture(MAX_STACK_TRACE_DEPTH * 2);
        assert!(trace.frames().len() <= MAX_STACK_TRACE_DEPTH);
    }

    #[test]
    fn frames_are_numbered() {
        let mut out = String::new();
        write_frames(&mut out, &[0x1000, 0x2000], &NoSymbols).unwrap();
        assert_eq!(out, "    #0  0x1000\n    #1  0x2000\n");
    }

    #[test]
    fn dladdr_always_prints_the_address() {
        let mut out = String::new();
        DladdrResolver.write_symbol(0x10, &mut out).unwrap();
        assert!(out.starts_with("0x10"));
    }
}
