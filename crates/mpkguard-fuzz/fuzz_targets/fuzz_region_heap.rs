#![no_main]
use std::sync::OnceLock;

use libfuzzer_sys::fuzz_target;
use mpkguard_membrane::{RegionHeap, ReservedRegion};

const FUZZ_WINDOW: ReservedRegion = ReservedRegion::new(0x5800_0000_0000, 1 << 32);

fn heap() -> Option<&'static RegionHeap> {
    static HEAP: OnceLock<Option<RegionHeap>> = OnceLock::new();
    HEAP.get_or_init(|| RegionHeap::reserve(FUZZ_WINDOW).ok())
        .as_ref()
}

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: op, size (le u16), fill byte.
    let Some(heap) = heap() else {
        return;
    };
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

    for chunk in data.chunks_exact(4) {
        let size = usize::from(u16::from_le_bytes([chunk[1], chunk[2]]));
        let fill = chunk[3];
        match chunk[0] % 5 {
            0 => {
                let block = heap.allocate(size);
                if !block.is_null() {
                    assert!(FUZZ_WINDOW.contains_ptr(block));
                    // SAFETY: fresh block of `size` bytes.
                    unsafe { block.write_bytes(fill, size) };
                    live.push((block, size, fill));
                }
            }
            1 => {
                let block = heap.allocate_zeroed(1, size);
                if !block.is_null() {
                    // SAFETY: fresh block of `size` bytes.
                    let bytes = unsafe { std::slice::from_raw_parts(block, size) };
                    assert!(bytes.iter().all(|&b| b == 0));
                    live.push((block, size, 0));
                }
            }
            2 => {
                if let Some((block, _, _)) = live.pop() {
                    // SAFETY: live block from this heap.
                    unsafe { heap.deallocate(block) };
                }
            }
            3 => {
                if let Some((block, old, fill)) = live.pop() {
                    // SAFETY: live block from this heap.
                    let moved = unsafe { heap.reallocate(block, size) };
                    if size == 0 {
                        // Resizing to zero frees the block.
                        assert!(moved.is_null());
                    } else if moved.is_null() {
                        live.push((block, old, fill));
                    } else {
                        let kept = old.min(size);
                        // SAFETY: `moved` holds at least `kept` bytes.
                        let bytes = unsafe { std::slice::from_raw_parts(moved, kept) };
                        assert!(bytes.iter().all(|&b| b == fill));
                        // SAFETY: grow the filled prefix to the new size.
                        unsafe { moved.write_bytes(fill, size) };
                        live.push((moved, size, fill));
                    }
                }
            }
            _ => {
                let align = 16_usize << (fill % 8);
                let block = heap.allocate_aligned(size, align);
                if !block.is_null() {
                    assert_eq!(block as usize % align, 0);
                    // SAFETY: fresh block of `size` bytes.
                    unsafe { block.write_bytes(fill, size) };
                    live.push((block, size, fill));
                }
            }
        }
    }

    // Every surviving block still holds its own fill pattern.
    for (block, size, fill) in live {
        // SAFETY: live blocks from this heap.
        unsafe {
            assert!(std::slice::from_raw_parts(block, size).iter().all(|&b| b == fill));
            heap.deallocate(block);
        }
    }
    assert_eq!(heap.stats().live_blocks, 0);
});
