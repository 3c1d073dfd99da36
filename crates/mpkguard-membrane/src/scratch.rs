//! Static scratch memory handed out while the runtime bootstraps.
//!
//! Resolving the real allocator can itself allocate (the dynamic linker
//! keeps error state on the heap). Those requests are served from one fixed
//! buffer. The buffer is shared, not thread-safe, and only meant for the
//! single-threaded startup window.

use std::cell::UnsafeCell;

/// Bytes available to pre-initialization allocations.
pub const SCRATCH_SIZE: usize = 512;

#[repr(C, align(16))]
pub struct ScratchBuffer {
    bytes: UnsafeCell<[u8; SCRATCH_SIZE]>,
}

// SAFETY: the buffer is only touched during bootstrap, which the init gate
// confines to a single thread; afterwards it is only compared by address or
// drained once by `realloc`.
unsafe impl Sync for ScratchBuffer {}

impl ScratchBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0; SCRATCH_SIZE]),
        }
    }

    /// The sentinel address callers receive.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.bytes.get().cast()
    }

    #[must_use]
    pub fn is_sentinel(&self, ptr: *const u8) -> bool {
        std::ptr::eq(ptr, self.as_ptr())
    }

    /// Hand out the buffer for a request of `size` bytes, or `None` when the
    /// request does not fit. Zeroes it first when `zeroed` is set.
    #[must_use]
    pub fn claim(&self, size: usize, zeroed: bool) -> Option<*mut u8> {
        if size > SCRATCH_SIZE {
            return None;
        }
        if zeroed {
            self.clear();
        }
        Some(self.as_ptr())
    }

    /// Zero the buffer so a later claim starts clean.
    pub fn clear(&self) {
        // SAFETY: the buffer is SCRATCH_SIZE bytes and single-threaded here.
        unsafe { self.as_ptr().write_bytes(0, SCRATCH_SIZE) };
    }
}

impl std::fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("addr", &self.as_ptr())
            .field("size", &SCRATCH_SIZE)
            .finish()
    }
}

impl Default for ScratchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_stable_and_aligned() {
        let scratch = ScratchBuffer::new();
        let first = scratch.claim(16, false).expect("fits");
        let second = scratch.claim(SCRATCH_SIZE, false).expect("fits");
        assert_eq!(first, second);
        assert!(scratch.is_sentinel(first));
        assert_eq!(first as usize % 16, 0);
    }

    #[test]
    fn oversized_requests_are_refused() {
        let scratch = ScratchBuffer::new();
        assert!(scratch.claim(SCRATCH_SIZE + 1, false).is_none());
    }

    #[test]
    fn zeroed_claim_and_clear_reset_contents() {
        let scratch = ScratchBuffer::new();
        let ptr = scratch.claim(8, false).expect("fits");
        // SAFETY: within the buffer.
        unsafe { ptr.write_bytes(0xEE, 8) };
        let ptr = scratch.claim(8, true).expect("fits");
        // SAFETY: within the buffer.
        unsafe { assert_eq!(*ptr, 0) };
        // SAFETY: within the buffer.
        unsafe { ptr.write_bytes(0x11, 8) };
        scratch.clear();
        // SAFETY: within the buffer.
        unsafe { assert_eq!(*ptr.add(7), 0) };
    }
}
