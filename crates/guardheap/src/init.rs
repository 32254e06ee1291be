//! The process-global heap behind `GuardHeap` and the C ABI.

use crate::config::{Options, OPTIONS_ENV};
use crate::hardening::{FdWriter, PREFIX};
use crate::heap::Heap;
use crate::platform;
use crate::util::MIN_ALIGN;
use core::fmt::Write;
use core::pin::Pin;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
const FAILED: u8 = 3;

pub static INIT_STATE: AtomicU8 = AtomicU8::new(UNINIT);

/// Kernel thread id of the thread running initialization.
static INIT_THREAD: AtomicUsize = AtomicUsize::new(0);

/// Options of the process heap before `GUARDHEAP_OPTIONS` is applied.
pub const PROCESS_DEFAULTS: Options = Options {
    default_alignment: MIN_ALIGN,
    ..Options::DEFAULT
};

static HEAP: Heap = Heap::new(PROCESS_DEFAULTS);

/// Library constructor, so the environment is read before main().
#[cfg(feature = "c-abi")]
#[used]
#[cfg_attr(target_os = "linux", link_section = ".init_array")]
#[cfg_attr(target_os = "macos", link_section = "__DATA,__mod_init_func")]
static CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn init() {
        ensure_initialized();
    }
    init
};

/// The process heap, whether or not it is initialized yet.
#[inline(always)]
pub fn heap() -> Pin<&'static Heap> {
    Pin::static_ref(&HEAP)
}

/// Initialize the process heap on first use. Returns whether it is usable.
///
/// Allocations made by the initializing thread while initialization runs
/// see the heap as soon as its first area exists, and fail before that.
pub fn ensure_initialized() -> bool {
    match INIT_STATE.compare_exchange(UNINIT, INITIALIZING, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {}
        Err(READY) => return true,
        Err(INITIALIZING) => {
            if INIT_THREAD.load(Ordering::Acquire) == platform::current_thread_id() {
                return HEAP.is_ready();
            }
            while INIT_STATE.load(Ordering::Acquire) == INITIALIZING {
                core::hint::spin_loop();
            }
            return state() == READY;
        }
        Err(_) => return false,
    }
    INIT_THREAD.store(platform::current_thread_id(), Ordering::Release);

    let ready = initialize();
    INIT_STATE.store(if ready { READY } else { FAILED }, Ordering::Release);
    ready
}

#[cold]
fn initialize() -> bool {
    let mut out = FdWriter::stderr();
    // SAFETY: runs once, before the program could be racing on setenv.
    let options = match unsafe { Options::from_env(PROCESS_DEFAULTS) } {
        Ok(options) => options,
        Err(err) => {
            let name = &OPTIONS_ENV[..OPTIONS_ENV.len() - 1];
            let _ = writeln!(
                out,
                "{}ignoring {}: {}",
                PREFIX,
                core::str::from_utf8(name).unwrap_or("options"),
                err
            );
            PROCESS_DEFAULTS
        }
    };
    if HEAP.settings().store(&options).is_err() {
        let _ = writeln!(out, "{}invalid process heap options", PREFIX);
    }
    match heap().init() {
        Ok(()) => {
            register_exit_hook();
            true
        }
        Err(err) => {
            let _ = writeln!(out, "{}cannot initialize the process heap: {}", PREFIX, err);
            false
        }
    }
}

extern "C" fn terminate_at_exit() {
    HEAP.terminate();
}

fn register_exit_hook() {
    unsafe {
        libc::atexit(terminate_at_exit);
    }
}

#[inline(always)]
pub fn state() -> u8 {
    INIT_STATE.load(Ordering::Acquire)
}

pub const STATE_READY: u8 = READY;
pub const STATE_FAILED: u8 = FAILED;
