//! Process-wide SIGSEGV/SIGBUS handler.
//!
//! Installed once by the first heap that initializes. A protection fault
//! inside any registered heap is turned into a [`FaultReport`] and printed
//! before the process terminates; everything else is reported as not ours.

use super::report::AccessKind;
use super::{fatal, FdWriter, PREFIX};
use crate::heap::registry;
use core::fmt::Write;
use core::sync::atomic::{AtomicBool, Ordering};

static INSTALLED: AtomicBool = AtomicBool::new(false);

// si_code for an access to a mapped page without permission; the libc
// crate does not export it for Linux.
#[cfg(target_os = "linux")]
const SEGV_ACCERR: libc::c_int = 2;
#[cfg(not(target_os = "linux"))]
use libc::SEGV_ACCERR;

/// Install the handler for SIGSEGV and SIGBUS. Idempotent.
pub fn install() {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = handle_fault as *const () as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGSEGV, libc::SIGBUS] {
            if libc::sigaction(signal, &action, core::ptr::null_mut()) != 0 {
                log::warn!("failed to install fault handler for signal {}", signal);
            }
        }
    }
}

/// Whether the signal is an access to a mapped but protected page.
fn is_protection_fault(signal: libc::c_int, code: libc::c_int) -> bool {
    match signal {
        libc::SIGSEGV => code == SEGV_ACCERR,
        // Darwin delivers protection faults on PROT_NONE mappings as SIGBUS.
        libc::SIGBUS => cfg!(target_os = "macos"),
        _ => false,
    }
}

fn signal_name(signal: libc::c_int) -> &'static str {
    match signal {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGBUS => "SIGBUS",
        _ => "signal",
    }
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: &libc::siginfo_t) -> usize {
    info.si_addr() as usize
}

#[cfg(target_os = "macos")]
unsafe fn fault_address(info: &libc::siginfo_t) -> usize {
    info.si_addr as usize
}

/// Read or write, from the page-fault error code where the platform exposes it.
#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
unsafe fn access_kind(context: *mut libc::c_void) -> AccessKind {
    if context.is_null() {
        return AccessKind::Unknown;
    }
    let context = &*(context as *const libc::ucontext_t);
    let error = context.uc_mcontext.gregs[libc::REG_ERR as usize];
    if error & 2 != 0 {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu")))]
unsafe fn access_kind(_context: *mut libc::c_void) -> AccessKind {
    AccessKind::Unknown
}

extern "C" fn handle_fault(
    signal: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let mut out = FdWriter::stderr();
    let (address, code) = unsafe {
        let info = &*info;
        (fault_address(info), info.si_code)
    };

    if is_protection_fault(signal, code) {
        let access = unsafe { access_kind(context) };
        // SAFETY: the registry only holds initialized heaps; see `find_map`.
        let handled = unsafe {
            registry::find_map(|heap| {
                let report = heap.fault_report(address, access)?;
                let _ = report.write(&mut out, heap.symbols());
                Some(heap.settings().debugger_calls())
            })
        };
        if let Some(debugger_calls) = handled {
            out.flush();
            fatal(debugger_calls);
        }
    }

    let _ = writeln!(
        out,
        "{}{} at {:#x} (code {}): not ours",
        PREFIX,
        signal_name(signal),
        address,
        code
    );
    out.flush();
    fatal(false)
}
