//! Extern stacks: per-thread stacks in unsafe memory that untrusted code
//! runs on.

use mpkguard_membrane::config::DEFAULT_EXTERN_STACK_SIZE;
use mpkguard_membrane::{AllocatorBackend, IsolationError, IsolationResult};

use crate::runtime_state::IsolationRuntime;

/// Bytes actually reserved for a request of `size`.
#[must_use]
pub const fn effective_size(size: usize) -> usize {
    if size > DEFAULT_EXTERN_STACK_SIZE {
        size
    } else {
        DEFAULT_EXTERN_STACK_SIZE
    }
}

/// Allocate an extern stack from the unsafe backend and return its top
/// (stacks grow down).
pub fn allocate(runtime: &IsolationRuntime, size: usize) -> IsolationResult<*mut u8> {
    let size = effective_size(size);
    let base = runtime.backends().unsafe_backend().allocate(size);
    if base.is_null() {
        return Err(IsolationError::OutOfMemory {
            what: "extern stack",
            size,
        });
    }
    // SAFETY: `base` heads a block of `size` bytes.
    Ok(unsafe { base.add(size) })
}

/// Return a stack obtained from [`allocate`] with the same `size`.
///
/// # Safety
///
/// `top` must come from `allocate(runtime, size)` and not be in use.
pub unsafe fn release(runtime: &IsolationRuntime, top: *mut u8, size: usize) {
    // SAFETY: caller contract; the base lies `effective_size` below the top.
    unsafe {
        let base = top.sub(effective_size(size));
        runtime.backends().unsafe_backend().deallocate(base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_requests_get_the_default_size() {
        assert_eq!(effective_size(0), DEFAULT_EXTERN_STACK_SIZE);
        assert_eq!(effective_size(4096), DEFAULT_EXTERN_STACK_SIZE);
        assert_eq!(
            effective_size(DEFAULT_EXTERN_STACK_SIZE * 2),
            DEFAULT_EXTERN_STACK_SIZE * 2
        );
    }
}
