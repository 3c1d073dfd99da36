//! Size classes for small blocks in the region heap.
//!
//! Sizes from 16 bytes to 32 KiB map onto 32 bins. Each bin is refilled by
//! carving a 64 KiB slab into equally sized slots.

/// Smallest block handed out.
pub const MIN_SIZE: usize = 16;

/// Largest request served from a bin. Above this, the span path is used.
pub const MAX_SMALL_SIZE: usize = 32 * 1024;

pub const NUM_SIZE_CLASSES: usize = 32;

/// Bytes carved from the region when a bin runs dry.
pub const SLAB_SIZE: usize = 64 * 1024;

const SIZE_TABLE: [usize; NUM_SIZE_CLASSES] = [
    16, 32, 48, 64, 80, 96, 112, 128, // 16-byte steps
    160, 192, 224, 256, 288, 320, 352, 384, // 32-byte steps
    448, 512, 640, 768, 896, 1024, 1280, 1536, // wider steps
    2048, 2560, 3072, 4096, 8192, 16384, 24576, 32768,
];

/// Bin for `size`, or `None` when the request belongs on the span path.
#[must_use]
pub fn bin_index(size: usize) -> Option<usize> {
    let size = size.max(MIN_SIZE);
    if size > MAX_SMALL_SIZE {
        return None;
    }
    SIZE_TABLE.iter().position(|&class_size| size <= class_size)
}

/// Block size served by bin `index`; zero when out of range.
#[must_use]
pub fn bin_size(index: usize) -> usize {
    SIZE_TABLE.get(index).copied().unwrap_or(0)
}

/// How many slots of `slot_size` bytes one slab refill yields (at least one).
#[must_use]
pub const fn slots_per_slab(slot_size: usize) -> usize {
    if slot_size == 0 || slot_size >= SLAB_SIZE {
        1
    } else {
        SLAB_SIZE / slot_size
    }
}
