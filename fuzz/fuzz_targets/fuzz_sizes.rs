#![no_main]

use guardheap::util::page_size;
use guardheap::{Heap, Options};
use libfuzzer_sys::fuzz_target;
use std::pin::Pin;
use std::sync::OnceLock;

// Fuzz target that exercises size and alignment boundaries.
// Interprets input as a series of (size, alignment shift) records,
// allocates, checks placement against the guard page, writes the full
// extent and frees.

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
    let mut i = 0;
    while i + 5 <= data.len() {
        let raw_size = u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        // Alignments from 1 to 64 KiB, covering both sides of the page size.
        let alignment = 1usize << (data[i + 4] % 17);
        i += 5;

        // Cap size so dedicated regions stay cheap
        let size = (raw_size as usize) % (2 * 1024 * 1024);

        let ptr = heap.allocate_aligned(alignment, size);
        assert!(!ptr.is_null(), "allocate_aligned({}, {}) failed", alignment, size);
        assert_eq!(
            (ptr as usize) % alignment,
            0,
            "allocate_aligned({}, {}) returned unaligned pointer {:p}",
            alignment,
            size,
            ptr
        );

        let info = heap.allocation_info(ptr).expect("live allocation not found");
        assert_eq!(info.size, size.max(1));

        // Small-alignment runs end flush against their guard page.
        let end = ptr as usize + size.max(1);
        if alignment == 1 {
            assert_eq!(end % page_size(), 0, "{:p}+{} does not touch the guard", ptr, size);
        }

        unsafe {
            std::ptr::write_bytes(ptr, 0xBB, size);
            heap.free(ptr);
        }
    }
});
