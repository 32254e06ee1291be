//! Detection tests for the guarded heap.
//!
//! Every misuse terminates the process, so each scenario runs in a child:
//! the test binary re-executes itself with `GUARDHEAP_SCENARIO` set, the
//! driver performs the misuse, and the parent checks the exit status and
//! the diagnostic on stderr.

use guardheap::{Heap, Options};
use std::os::unix::process::ExitStatusExt;
use std::pin::Pin;
use std::process::Output;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Barrier;

const SCENARIO_ENV: &str = "GUARDHEAP_SCENARIO";

// ---------------------------------------------------------------------------
// Subprocess harness
// ---------------------------------------------------------------------------

fn run_scenario(scenario: &str) -> Output {
    let exe = std::env::current_exe().expect("cannot determine test binary path");
    std::process::Command::new(&exe)
        .env(SCENARIO_ENV, scenario)
        .arg("--exact")
        .arg("scenario_driver")
        .arg("--nocapture")
        .env("RUST_TEST_THREADS", "1")
        .output()
        .expect("failed to spawn subprocess")
}

/// Run `scenario` in a child and require that it aborts with every one of
/// `expected` on stderr.
fn expect_abort(scenario: &str, expected: &[&str]) {
    let output = run_scenario(scenario);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "scenario '{}' should have aborted, got {:?}. stderr:\n{}",
        scenario,
        output.status,
        stderr
    );
    for message in expected {
        assert!(
            stderr.contains(message),
            "scenario '{}' stderr does not contain '{}'. Full stderr:\n{}",
            scenario,
            message,
            stderr
        );
    }
}

fn new_heap(options: Options) -> Pin<Box<Heap>> {
    let heap = Box::pin(Heap::new(options));
    heap.as_ref().init().expect("heap init failed");
    heap
}

fn no_reuse() -> Options {
    Options {
        memory_reuse: false,
        ..Options::DEFAULT
    }
}

/// Kernel limit on mappings per process, if readable.
fn max_map_count() -> Option<usize> {
    std::fs::read_to_string("/proc/sys/vm/max_map_count")
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Heap inspected by the SIGTRAP handler in the recovery scenario.
static TRAPPED_HEAP: AtomicPtr<Heap> = AtomicPtr::new(ptr::null_mut());

/// Runs in place of the abort that follows a debugger trap: the heap must
/// still be consistent and usable after the diagnosed misuse.
extern "C" fn check_heap_after_trap(_signal: libc::c_int) {
    let heap = unsafe { &*TRAPPED_HEAP.load(Ordering::Acquire) };
    let usable = heap.validate_heaps().is_ok() && {
        let p = heap.allocate(64);
        !p.is_null()
            && unsafe {
                ptr::write_bytes(p, 0x11, 64);
                heap.free(p);
                true
            }
    };
    unsafe { libc::_exit(if usable { 0 } else { 3 }) };
}

// ---------------------------------------------------------------------------
// Scenario driver
// ---------------------------------------------------------------------------

#[test]
fn scenario_driver() {
    let scenario = match std::env::var(SCENARIO_ENV) {
        Ok(s) => s,
        Err(_) => return,
    };

    unsafe {
        match scenario.as_str() {
            "overrun" => {
                let heap = new_heap(Options::DEFAULT);
                let p = heap.allocate(100);
                ptr::write_volatile(p.add(100), 0xAA);
            }
            "underrun_read_ok_then_overrun_read" => {
                let heap = new_heap(Options::DEFAULT);
                let p = heap.allocate(37);
                let _ = ptr::read_volatile(p.add(36));
                let _ = ptr::read_volatile(p.add(37));
            }
            "use_after_free_retired" => {
                let heap = new_heap(no_reuse());
                let p = heap.allocate(64);
                heap.free(p);
                let _ = ptr::read_volatile(p);
            }
            "use_after_free_recycled" => {
                let heap = new_heap(Options::DEFAULT);
                let p = heap.allocate(64);
                heap.free(p);
                ptr::write_volatile(p, 1);
            }
            "double_free" => {
                let heap = new_heap(Options::DEFAULT);
                let p = heap.allocate(64);
                heap.free(p);
                heap.free(p);
            }
            "double_free_retired" => {
                let heap = new_heap(no_reuse());
                let p = heap.allocate(64);
                heap.free(p);
                heap.free(p);
            }
            "interior_free" => {
                let heap = new_heap(Options::DEFAULT);
                let p = heap.allocate(64);
                heap.free(p.add(8));
            }
            "guard_free" => {
                let heap = new_heap(Options::DEFAULT);
                let p = heap.allocate(100);
                heap.free(p.add(100));
            }
            "foreign_free" => {
                let heap = new_heap(Options::DEFAULT);
                let mut local = [0u8; 16];
                heap.free(local.as_mut_ptr());
            }
            "foreign_realloc" => {
                let heap = new_heap(Options::DEFAULT);
                let mut local = [0u8; 16];
                heap.reallocate(local.as_mut_ptr(), 32);
            }
            "dedicated_region_overrun" => {
                let heap = new_heap(Options::DEFAULT);
                let size = 2 * 1024 * 1024;
                let p = heap.allocate(size);
                ptr::write_volatile(p.add(size), 0xAA);
            }
            "dedicated_region_interior_free" => {
                let heap = new_heap(Options::DEFAULT);
                let p = heap.allocate_aligned(8192, 100);
                heap.free(p.add(16));
            }
            "double_free_with_traces" => {
                let heap = new_heap(Options {
                    stack_trace_depth: 8,
                    ..Options::DEFAULT
                });
                let p = heap.allocate(64);
                heap.free(p);
                heap.free(p);
            }
            "double_free_debugger_call" => {
                let heap = new_heap(Options {
                    debugger_calls: true,
                    ..Options::DEFAULT
                });
                let p = heap.allocate(64);
                heap.free(p);
                heap.free(p);
            }
            "mapping_limit_exhaustion" => {
                let heap = new_heap(Options::DEFAULT);
                // Every run alternates read-write and no-access pages, so
                // each one costs about two kernel mappings.
                let limit = max_map_count().unwrap_or(65530);
                for _ in 0..limit / 2 + 10_000 {
                    if heap.allocate(100).is_null() {
                        break;
                    }
                }
            }
            "double_free_then_recover" => {
                let heap = new_heap(Options {
                    debugger_calls: true,
                    ..Options::DEFAULT
                });
                TRAPPED_HEAP.store(&*heap as *const Heap as *mut Heap, Ordering::Release);
                libc::signal(
                    libc::SIGTRAP,
                    check_heap_after_trap as *const () as libc::sighandler_t,
                );
                let a = heap.allocate(64);
                let b = heap.allocate(64);
                heap.free(a);
                let c = heap.allocate(200);
                heap.free(a);
                // Not reached: the trap handler exits.
                heap.free(b);
                heap.free(c);
            }
            "dedicated_region_racing_double_free" => {
                let heap = new_heap(Options::DEFAULT);
                let heap: &Heap = &heap;
                let p = heap.allocate(2 * 1024 * 1024) as usize;
                let barrier = Barrier::new(2);
                std::thread::scope(|s| {
                    for _ in 0..2 {
                        s.spawn(|| {
                            barrier.wait();
                            heap.free(p as *mut u8);
                        });
                    }
                });
            }
            "unrelated_fault" => {
                let _heap = new_heap(Options::DEFAULT);
                let _ = ptr::read_volatile(0x10 as *const u8);
            }
            _ => panic!("unknown scenario: {}", scenario),
        }
    }
    // Reaching this point means the misuse went unnoticed.
    std::process::exit(0);
}

// ---------------------------------------------------------------------------
// Faults on protected pages
// ---------------------------------------------------------------------------

#[test]
fn overrun_hits_guard_page() {
    expect_abort(
        "overrun",
        &["invalid write access at", "which is a guard page", "  in area "],
    );
}

#[test]
fn last_byte_is_accessible_and_next_one_faults() {
    expect_abort(
        "underrun_read_ok_then_overrun_read",
        &["access at", "which is a guard page"],
    );
}

#[test]
fn use_after_free_with_reuse_off_hits_dead_page() {
    expect_abort(
        "use_after_free_retired",
        &["which is a dead page", "allocation base", "freeing thread"],
    );
}

#[test]
fn use_after_free_with_reuse_on_hits_free_page() {
    expect_abort("use_after_free_recycled", &["which is not allocated"]);
}

#[test]
fn dedicated_region_overrun_is_reported() {
    expect_abort(
        "dedicated_region_overrun",
        &["which is a guard page", "in dedicated region"],
    );
}

#[test]
fn unrelated_fault_is_not_ours() {
    let output = run_scenario("unrelated_fault");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success());
    assert!(
        stderr.contains("SIGSEGV at 0x10") && stderr.contains("not ours"),
        "stderr:\n{}",
        stderr
    );
}

// ---------------------------------------------------------------------------
// Invalid frees
// ---------------------------------------------------------------------------

#[test]
fn double_free_is_detected() {
    expect_abort("double_free", &["guardheap: double free at"]);
}

#[test]
fn double_free_of_retired_run_is_detected() {
    expect_abort("double_free_retired", &["free of a dead page"]);
}

#[test]
fn interior_free_is_detected() {
    expect_abort(
        "interior_free",
        &["free of an address that is not the start of an allocation"],
    );
}

#[test]
fn guard_page_free_is_detected() {
    expect_abort("guard_free", &["free of a guard page", "page flags: used guard"]);
}

#[test]
fn foreign_pointer_free_is_detected() {
    expect_abort("foreign_free", &["free of unrecognized address"]);
}

#[test]
fn foreign_pointer_realloc_is_detected() {
    expect_abort("foreign_realloc", &["realloc of unrecognized address"]);
}

#[test]
fn dedicated_region_interior_free_is_detected() {
    expect_abort(
        "dedicated_region_interior_free",
        &["not the start of an allocation", "size 100, alignment 8192"],
    );
}

#[test]
fn diagnostics_carry_threads_and_stack_traces() {
    expect_abort(
        "double_free_with_traces",
        &["double free at", "allocating thread", "alloc stack trace", "free stack trace"],
    );
}

#[test]
fn debugger_calls_raise_sigtrap_first() {
    let output = run_scenario("double_free_debugger_call");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGTRAP),
        "stderr:\n{}",
        stderr
    );
    assert!(stderr.contains("double free at"));
}

// ---------------------------------------------------------------------------
// Resource exhaustion and recovery
// ---------------------------------------------------------------------------

#[test]
fn mapping_limit_exhaustion_is_reported() {
    // Far beyond the usual default, the loop would take too long.
    if max_map_count().is_some_and(|limit| limit > 4_000_000) {
        return;
    }
    expect_abort("mapping_limit_exhaustion", &["guardheap: out of memory"]);
}

#[test]
fn double_free_leaves_the_heap_consistent() {
    let output = run_scenario("double_free_then_recover");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.code(),
        Some(0),
        "heap unusable after a diagnosed double free, status {:?}. stderr:\n{}",
        output.status,
        stderr
    );
    assert!(stderr.contains("double free at"), "stderr:\n{}", stderr);
}

#[test]
fn racing_dedicated_region_frees_are_diagnosed() {
    let output = run_scenario("dedicated_region_racing_double_free");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        output.status.signal(),
        Some(libc::SIGABRT),
        "stderr:\n{}",
        stderr
    );
    assert!(
        stderr.contains("double free at") || stderr.contains("free of unrecognized address"),
        "stderr:\n{}",
        stderr
    );
    assert!(!stderr.contains("not ours"), "stderr:\n{}", stderr);
}
