//! Address-range classification.
//!
//! Ownership of a heap block is decided purely by where it lives: anything
//! inside the reserved unsafe region belongs to the unsafe backend, anything
//! else to the safe backend. The classifier never consults allocation
//! history, so a pointer can be freed from either domain.

use crate::domain::BackendKind;

/// Base address of the unsafe heap region.
pub const UNSAFE_REGION_START: usize = 0x5100_0000_0000;
/// Length of the unsafe heap region (16 GiB).
pub const UNSAFE_REGION_LEN: usize = 1 << 34;

/// The process-wide unsafe region.
pub const UNSAFE_REGION: ReservedRegion =
    ReservedRegion::new(UNSAFE_REGION_START, UNSAFE_REGION_LEN);

/// A contiguous half-open address range `[start, start + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedRegion {
    start: usize,
    len: usize,
}

impl ReservedRegion {
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    #[must_use]
    pub const fn start(&self) -> usize {
        self.start
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last address of the region.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start.saturating_add(self.len)
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    #[must_use]
    pub fn contains_ptr<T>(&self, ptr: *const T) -> bool {
        self.contains(ptr as usize)
    }

    /// Which backend owns `addr`.
    #[must_use]
    pub const fn classify(&self, addr: usize) -> BackendKind {
        if self.contains(addr) {
            BackendKind::Unsafe
        } else {
            BackendKind::Safe
        }
    }
}

/// Classify an address against the process-wide unsafe region.
#[inline]
#[must_use]
pub const fn classify(addr: usize) -> BackendKind {
    UNSAFE_REGION.classify(addr)
}

/// True when `addr` lies inside the process-wide unsafe region.
#[inline]
#[must_use]
pub const fn in_unsafe_region(addr: usize) -> bool {
    UNSAFE_REGION.contains(addr)
}
