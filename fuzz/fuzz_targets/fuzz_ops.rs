#![no_main]

use guardheap::{Heap, Options};
use libfuzzer_sys::fuzz_target;
use std::pin::Pin;
use std::sync::OnceLock;

/// Fuzz target that interprets a byte slice as a sequence of heap operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=allocate, 1=free, 2=reallocate, 3=allocate_zeroed)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers. Every byte of a live allocation is
/// written, so any off-by-one in run placement faults on the guard page.
const MAX_SLOTS: usize = 64;

fn heap() -> &'static Heap {
    static HEAP: OnceLock<Pin<Box<Heap>>> = OnceLock::new();
    HEAP.get_or_init(|| {
        let heap = Box::pin(Heap::new(Options::DEFAULT));
        heap.as_ref().init().expect("heap init failed");
        heap
    })
}

fuzz_target!(|data: &[u8]| {
    let heap = heap();
    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                unsafe { heap.free(slots[slot]) };
                let ptr = heap.allocate(size);
                assert!(!ptr.is_null());
                unsafe { std::ptr::write_bytes(ptr, 0xAA, size) };
                slots[slot] = ptr;
                sizes[slot] = size;
            }
            1 => {
                unsafe { heap.free(slots[slot]) };
                slots[slot] = std::ptr::null_mut();
                sizes[slot] = 0;
            }
            2 => {
                let old = sizes[slot];
                let ptr = unsafe { heap.reallocate(slots[slot], size) };
                if size == 0 {
                    assert!(ptr.is_null());
                } else {
                    assert!(!ptr.is_null());
                    for j in 0..old.min(size) {
                        assert_eq!(unsafe { *ptr.add(j) }, 0xAA, "realloc lost byte {}", j);
                    }
                    unsafe { std::ptr::write_bytes(ptr, 0xAA, size) };
                }
                slots[slot] = ptr;
                sizes[slot] = size;
            }
            3 => {
                unsafe { heap.free(slots[slot]) };
                let nmemb = (size >> 8).max(1);
                let elem_size = (size & 0xFF).max(1);
                let total = nmemb * elem_size;
                let ptr = heap.allocate_zeroed(nmemb, elem_size);
                assert!(!ptr.is_null());
                let bytes = unsafe { std::slice::from_raw_parts(ptr, total) };
                assert!(bytes.iter().all(|&b| b == 0), "zeroed memory is dirty");
                unsafe { std::ptr::write_bytes(ptr, 0xAA, total) };
                slots[slot] = ptr;
                sizes[slot] = total;
            }
            _ => unreachable!(),
        }
    }

    for slot in &mut slots {
        unsafe { heap.free(*slot) };
        *slot = std::ptr::null_mut();
    }
    assert!(heap.validate_heaps().is_ok());
});
