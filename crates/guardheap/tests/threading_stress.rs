//! Thread stress tests for the guarded heap.
//!
//! Many threads allocate and free at once, hand pointers to each other and
//! force area growth concurrently. Corruption, a lost page or a deadlock
//! shows up as a failed assertion, a failed validation or a hang.

use guardheap::{Heap, Options};
use std::pin::Pin;
use std::ptr;
use std::sync::{Barrier, Mutex};
use std::thread;

static SERIAL: Mutex<()> = Mutex::new(());

fn new_heap(options: Options) -> Pin<Box<Heap>> {
    let heap = Box::pin(Heap::new(options));
    heap.as_ref().init().expect("heap init failed");
    heap
}

/// Wrapper to send heap pointers between threads. Only ownership moves:
/// one thread allocates, another frees.
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

// ---------------------------------------------------------------------------
// N threads doing rapid allocate/free cycles
// ---------------------------------------------------------------------------

fn stress_allocate_free_n_threads(num_threads: usize) {
    const ITERATIONS: usize = 2_000;
    const SIZE: usize = 128;

    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let heap = new_heap(Options::DEFAULT);
    let heap: &Heap = &heap;
    let used_before = heap.used_pages();
    let barrier = Barrier::new(num_threads);

    thread::scope(|s| {
        for _ in 0..num_threads {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..ITERATIONS {
                    let p = heap.allocate(SIZE);
                    assert!(!p.is_null(), "allocate returned null under contention");
                    unsafe {
                        ptr::write_bytes(p, 0xCC, SIZE);
                        heap.free(p);
                    }
                }
            });
        }
    });

    assert_eq!(heap.used_pages(), used_before);
    heap.validate_heaps().unwrap();
}

#[test]
fn stress_allocate_free_4_threads() {
    stress_allocate_free_n_threads(4);
}

#[test]
fn stress_allocate_free_16_threads() {
    stress_allocate_free_n_threads(16);
}

// ---------------------------------------------------------------------------
// Cross-thread free: one thread allocates, another frees
// ---------------------------------------------------------------------------

#[test]
fn cross_thread_free() {
    const COUNT: usize = 1_000;
    const SIZE: usize = 64;

    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let heap = new_heap(Options::DEFAULT);
    let heap: &Heap = &heap;
    let shared: Mutex<Vec<SendPtr>> = Mutex::new(Vec::with_capacity(COUNT));
    let barrier = Barrier::new(2);

    thread::scope(|s| {
        s.spawn(|| {
            barrier.wait();
            for _ in 0..COUNT {
                let p = heap.allocate(SIZE);
                assert!(!p.is_null());
                unsafe { ptr::write_bytes(p, 0xDD, SIZE) };
                shared.lock().unwrap().push(SendPtr(p));
            }
        });
        s.spawn(|| {
            barrier.wait();
            let mut freed = 0;
            while freed < COUNT {
                let batch: Vec<SendPtr> = shared.lock().unwrap().drain(..).collect();
                for sp in batch {
                    let info = heap.allocation_info(sp.0).unwrap();
                    assert_ne!(info.allocating_thread, guardheap::trace::current_thread_id());
                    unsafe { heap.free(sp.0) };
                    freed += 1;
                }
                if freed < COUNT {
                    thread::yield_now();
                }
            }
        });
    });

    let mut out = String::new();
    let stats = heap.write_allocations(&mut out, true, None).unwrap();
    assert_eq!(stats.count, 0);
    heap.validate_heaps().unwrap();
}

// ---------------------------------------------------------------------------
// Data integrity under contention
// ---------------------------------------------------------------------------

#[test]
fn no_data_corruption_under_contention() {
    const NUM_THREADS: usize = 8;
    const ITERATIONS: usize = 500;
    const LIVE: usize = 8;

    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let heap = new_heap(Options::DEFAULT);
    let heap: &Heap = &heap;
    let barrier = Barrier::new(NUM_THREADS);

    thread::scope(|s| {
        for tid in 0..NUM_THREADS {
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                let pattern = (tid as u8).wrapping_mul(31).wrapping_add(1);
                let mut live: Vec<(*mut u8, usize)> = Vec::with_capacity(LIVE);
                for i in 0..ITERATIONS {
                    let size = 1 + (i * 97 + tid * 13) % 6000;
                    let p = heap.allocate(size);
                    assert!(!p.is_null());
                    unsafe { ptr::write_bytes(p, pattern, size) };
                    live.push((p, size));
                    if live.len() == LIVE {
                        for (p, size) in live.drain(..) {
                            let bytes = unsafe { std::slice::from_raw_parts(p, size) };
                            assert!(
                                bytes.iter().all(|&b| b == pattern),
                                "thread {} found foreign bytes in {:p}",
                                tid,
                                p
                            );
                            unsafe { heap.free(p) };
                        }
                    }
                }
                for (p, _) in live {
                    unsafe { heap.free(p) };
                }
            });
        }
    });

    heap.validate_heaps().unwrap();
}

// ---------------------------------------------------------------------------
// Concurrent growth
// ---------------------------------------------------------------------------

#[test]
fn concurrent_growth_adds_areas_without_losing_pages() {
    const NUM_THREADS: usize = 8;

    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    // Retired pages never come back, so every thread keeps forcing growth.
    let heap = new_heap(Options {
        memory_reuse: false,
        ..Options::DEFAULT
    });
    let heap: &Heap = &heap;
    let per_thread = heap.page_count();
    let barrier = Barrier::new(NUM_THREADS);

    thread::scope(|s| {
        for _ in 0..NUM_THREADS {
            s.spawn(|| {
                barrier.wait();
                for _ in 0..per_thread / 4 {
                    let p = heap.allocate(32);
                    assert!(!p.is_null());
                    unsafe {
                        *p = 1;
                        heap.free(p);
                    }
                }
            });
        }
    });

    assert!(heap.area_count() > 1);
    assert_eq!(heap.used_pages(), NUM_THREADS * (per_thread / 4) * 2);
    assert!(heap.used_pages() <= heap.page_count());
    heap.validate_heaps().unwrap();
}

#[test]
fn dedicated_regions_under_contention() {
    const NUM_THREADS: usize = 4;
    const ITERATIONS: usize = 50;

    let _serial = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let heap = new_heap(Options::DEFAULT);
    let heap: &Heap = &heap;

    thread::scope(|s| {
        for tid in 0..NUM_THREADS {
            s.spawn(move || {
                for i in 0..ITERATIONS {
                    let p = if (i + tid) % 2 == 0 {
                        heap.allocate(1024 * 1024 + i)
                    } else {
                        heap.allocate_aligned(16384, 64)
                    };
                    assert!(!p.is_null());
                    unsafe {
                        *p = tid as u8;
                        heap.free(p);
                    }
                }
            });
        }
    });

    assert_eq!(heap.dedicated_region_count(), 0);
}
