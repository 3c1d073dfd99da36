//! Routing of allocation requests between the two backends.
//!
//! New memory is routed by the caller's domain. Existing memory is routed
//! by where it lives, so a block allocated in an untrusted domain can be
//! freed or resized from trusted code and vice versa.

use crate::backend::DualBackend;
use crate::counters::IsolationCounters;
use crate::domain::{BackendKind, Domain};
use crate::region::ReservedRegion;
use crate::scratch::{SCRATCH_SIZE, ScratchBuffer};

/// Result of an allocation entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    /// Memory from a backend (null on exhaustion).
    Real(*mut u8),
    /// The pre-initialization scratch buffer.
    Scratch,
}

impl Allocation {
    /// Serve a request made while the runtime is still bootstrapping.
    #[must_use]
    pub fn during_bootstrap(scratch: &ScratchBuffer, size: usize, zeroed: bool) -> Self {
        match scratch.claim(size, zeroed) {
            Some(_) => Self::Scratch,
            None => Self::Real(std::ptr::null_mut()),
        }
    }

    /// The pointer handed back across the C ABI.
    #[must_use]
    pub fn into_ptr(self, scratch: &ScratchBuffer) -> *mut u8 {
        match self {
            Self::Real(ptr) => ptr,
            Self::Scratch => scratch.as_ptr(),
        }
    }
}

/// Who owns an existing pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Null,
    Scratch,
    Backend(BackendKind),
}

/// Borrowed view of everything routing needs.
#[derive(Debug, Clone, Copy)]
pub struct Router<'a> {
    backends: &'a DualBackend,
    region: ReservedRegion,
    counters: &'a IsolationCounters,
    scratch: &'a ScratchBuffer,
}

impl<'a> Router<'a> {
    #[must_use]
    pub const fn new(
        backends: &'a DualBackend,
        region: ReservedRegion,
        counters: &'a IsolationCounters,
        scratch: &'a ScratchBuffer,
    ) -> Self {
        Self {
            backends,
            region,
            counters,
            scratch,
        }
    }

    #[must_use]
    pub const fn region(&self) -> ReservedRegion {
        self.region
    }

    #[must_use]
    pub fn classify(&self, ptr: *const u8) -> Provenance {
        if ptr.is_null() {
            Provenance::Null
        } else if self.scratch.is_sentinel(ptr) {
            Provenance::Scratch
        } else {
            Provenance::Backend(self.region.classify(ptr as usize))
        }
    }

    pub fn allocate(&self, domain: Domain, size: usize) -> *mut u8 {
        self.counters.record_heap(1, domain.is_untrusted());
        self.backends.for_domain(domain).allocate(size)
    }

    /// Overflowing `count * size` yields null without touching a backend.
    pub fn allocate_zeroed(&self, domain: Domain, count: usize, size: usize) -> *mut u8 {
        if count.checked_mul(size).is_none() {
            return std::ptr::null_mut();
        }
        self.counters.record_heap(count as u64, domain.is_untrusted());
        self.backends.for_domain(domain).allocate_zeroed(count, size)
    }

    pub fn allocate_aligned(&self, domain: Domain, size: usize, align: usize) -> *mut u8 {
        self.counters.record_heap(1, domain.is_untrusted());
        self.backends.for_domain(domain).allocate_aligned(size, align)
    }

    /// Allocate from an explicitly chosen backend, bypassing the domain.
    pub fn allocate_in(&self, kind: BackendKind, size: usize) -> *mut u8 {
        self.counters.record_heap(1, kind == BackendKind::Unsafe);
        self.backends.backend(kind).allocate(size)
    }

    /// Resize `ptr` in the backend that owns it. A null pointer allocates in
    /// `domain`; the scratch sentinel is moved into real memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, the scratch sentinel, or a live block of either
    /// backend.
    pub unsafe fn reallocate(&self, domain: Domain, ptr: *mut u8, size: usize) -> *mut u8 {
        match self.classify(ptr) {
            Provenance::Null => self.allocate(domain, size),
            Provenance::Scratch => {
                let moved = self.allocate(domain, size);
                if !moved.is_null() {
                    // SAFETY: `moved` holds `size` bytes; the scratch buffer holds SCRATCH_SIZE.
                    unsafe {
                        std::ptr::copy_nonoverlapping(ptr, moved, size.min(SCRATCH_SIZE));
                    }
                    self.scratch.clear();
                }
                moved
            }
            Provenance::Backend(kind) => {
                self.counters.record_heap(1, kind == BackendKind::Unsafe);
                // SAFETY: address classification picked the owning backend.
                unsafe { self.backends.backend(kind).reallocate(ptr, size) }
            }
        }
    }

    /// Release `ptr` to the backend that owns it.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, the scratch sentinel, or a live block of either
    /// backend.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        match self.classify(ptr) {
            Provenance::Null => {}
            Provenance::Scratch => self.scratch.clear(),
            Provenance::Backend(kind) => {
                // SAFETY: address classification picked the owning backend.
                unsafe { self.backends.backend(kind).deallocate(ptr) }
            }
        }
    }

    /// Release `ptr` to an explicitly chosen backend.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block of backend `kind`.
    pub unsafe fn deallocate_in(&self, kind: BackendKind, ptr: *mut u8) {
        if !ptr.is_null() {
            // SAFETY: forwarded caller contract.
            unsafe { self.backends.backend(kind).deallocate(ptr) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_requests_use_scratch_until_too_large() {
        let scratch = ScratchBuffer::new();
        let small = Allocation::during_bootstrap(&scratch, 64, true);
        assert_eq!(small, Allocation::Scratch);
        assert_eq!(small.into_ptr(&scratch), scratch.as_ptr());

        let large = Allocation::during_bootstrap(&scratch, SCRATCH_SIZE * 2, false);
        assert_eq!(large, Allocation::Real(std::ptr::null_mut()));
        assert!(large.into_ptr(&scratch).is_null());
    }
}
