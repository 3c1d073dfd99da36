//! Standard allocation entry points.
//!
//! New blocks come from the backend of the calling thread's domain; `free`
//! and `realloc` follow the address. While the runtime bootstraps, requests
//! from the bootstrapping thread are served from the scratch buffer.

use std::ffi::{c_int, c_void};

use mpkguard_membrane::backend::MIN_ALIGN;
use mpkguard_membrane::scratch::SCRATCH_SIZE;
use mpkguard_membrane::{Allocation, BackendKind, Domain, OrAbort, Provenance};

use crate::domain_state;
use crate::runtime_state::{self, Entry, SCRATCH};

/// The calling thread's domain; a thread without one is fatal.
fn calling_domain() -> Domain {
    domain_state::current_domain().or_abort()
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    malloc_in(runtime_state::enter(), size)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: C contract: `ptr` came from one of our entry points.
    unsafe { free_in(runtime_state::enter(), ptr) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut c_void {
    calloc_in(runtime_state::enter(), count, size)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: C contract: `ptr` is null or came from one of our entry points.
    unsafe { realloc_in(runtime_state::enter(), ptr, size) }
}

/// Null results report `ENOMEM` through errno.
fn or_enomem(block: *mut c_void) -> *mut c_void {
    if block.is_null() {
        set_errno(libc::ENOMEM);
    }
    block
}

fn malloc_in(entry: Entry, size: usize) -> *mut c_void {
    let block = match entry {
        Entry::Bootstrapping => Allocation::during_bootstrap(&SCRATCH, size, false)
            .into_ptr(&SCRATCH)
            .cast(),
        Entry::Ready(runtime) => runtime.router().allocate(calling_domain(), size).cast(),
    };
    or_enomem(block)
}

/// # Safety
///
/// `ptr` is non-null and came from one of our entry points.
unsafe fn free_in(entry: Entry, ptr: *mut c_void) {
    match entry {
        Entry::Bootstrapping => {
            // Nothing but the scratch buffer can have been handed out yet.
            if SCRATCH.is_sentinel(ptr.cast()) {
                SCRATCH.clear();
            }
        }
        // SAFETY: caller contract.
        Entry::Ready(runtime) => unsafe { runtime.router().deallocate(ptr.cast()) },
    }
}

fn calloc_in(entry: Entry, count: usize, size: usize) -> *mut c_void {
    let block = match entry {
        Entry::Bootstrapping => match count.checked_mul(size) {
            Some(total) => Allocation::during_bootstrap(&SCRATCH, total, true)
                .into_ptr(&SCRATCH)
                .cast(),
            None => std::ptr::null_mut(),
        },
        Entry::Ready(runtime) => runtime
            .router()
            .allocate_zeroed(calling_domain(), count, size)
            .cast(),
    };
    or_enomem(block)
}

/// # Safety
///
/// `ptr` is null or came from one of our entry points.
unsafe fn realloc_in(entry: Entry, ptr: *mut c_void, size: usize) -> *mut c_void {
    let block = match entry {
        Entry::Bootstrapping => {
            let fits = size <= SCRATCH_SIZE;
            if fits && (ptr.is_null() || SCRATCH.is_sentinel(ptr.cast())) {
                SCRATCH.as_ptr().cast()
            } else {
                std::ptr::null_mut()
            }
        }
        Entry::Ready(runtime) => {
            let router = runtime.router();
            // The domain only decides where null and scratch pointers go.
            let domain = match router.classify(ptr.cast()) {
                Provenance::Backend(_) => Domain::SAFE,
                Provenance::Null | Provenance::Scratch => calling_domain(),
            };
            // SAFETY: caller contract.
            unsafe { router.reallocate(domain, ptr.cast(), size).cast() }
        }
    };
    // A zero-size realloc that frees and returns null is not a failure.
    if size == 0 { block } else { or_enomem(block) }
}

fn aligned_in(entry: Entry, align: usize, size: usize) -> *mut c_void {
    match entry {
        Entry::Bootstrapping if align <= MIN_ALIGN => {
            Allocation::during_bootstrap(&SCRATCH, size, false)
                .into_ptr(&SCRATCH)
                .cast()
        }
        Entry::Bootstrapping => std::ptr::null_mut(),
        Entry::Ready(runtime) => runtime
            .router()
            .allocate_aligned(calling_domain(), size, align)
            .cast(),
    }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: usize,
    size: usize,
) -> c_int {
    if memptr.is_null()
        || !alignment.is_power_of_two()
        || alignment % std::mem::size_of::<*mut c_void>() != 0
    {
        return libc::EINVAL;
    }
    let block = aligned_in(runtime_state::enter(), alignment, size);
    if block.is_null() {
        return libc::ENOMEM;
    }
    // SAFETY: checked non-null out-pointer from the caller.
    unsafe { *memptr = block };
    0
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        set_errno(libc::EINVAL);
        return std::ptr::null_mut();
    }
    or_enomem(aligned_in(runtime_state::enter(), alignment, size))
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
    if !alignment.is_power_of_two() {
        set_errno(libc::EINVAL);
        return std::ptr::null_mut();
    }
    or_enomem(aligned_in(runtime_state::enter(), alignment, size))
}

/// The program break is not a domain heap: only `sbrk(0)` is answered.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn sbrk(increment: libc::intptr_t) -> *mut c_void {
    if increment == 0 {
        if let Entry::Ready(runtime) = runtime_state::enter() {
            // SAFETY: querying the break has no side effects.
            return unsafe { (runtime.primitives().sbrk)(0) };
        }
    }
    set_errno(libc::ENOMEM);
    usize::MAX as *mut c_void
}

/// `mmap` for both domains; mappings are outside the isolation boundary.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mpk_mmap(
    addr: *mut c_void,
    length: usize,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    let runtime = runtime_state::runtime();
    // SAFETY: forwarded verbatim to the real mmap.
    unsafe { (runtime.primitives().mmap)(addr, length, prot, flags, fd, offset) }
}

/// `mremap` for both domains. `new_address` is only read with
/// `MREMAP_FIXED`.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mpk_mremap(
    old_address: *mut c_void,
    old_size: usize,
    new_size: usize,
    flags: c_int,
    new_address: *mut c_void,
) -> *mut c_void {
    let runtime = runtime_state::runtime();
    // SAFETY: forwarded verbatim to the real mremap.
    unsafe { (runtime.primitives().mremap)(old_address, old_size, new_size, flags, new_address) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mpk_malloc(size: usize) -> *mut c_void {
    // SAFETY: same contract.
    unsafe { malloc(size) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mpk_free(ptr: *mut c_void) {
    // SAFETY: same contract.
    unsafe { free(ptr) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mpk_calloc(count: usize, size: usize) -> *mut c_void {
    // SAFETY: same contract.
    unsafe { calloc(count, size) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mpk_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    // SAFETY: same contract.
    unsafe { realloc(ptr, size) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn mpk_sbrk(increment: libc::intptr_t) -> *mut c_void {
    // SAFETY: same contract.
    unsafe { sbrk(increment) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn ensure_initialized() {
    runtime_state::ensure_initialized();
}

// Backend-explicit helpers for code generators that copy objects across the
// boundary.

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __safe_malloc(size: usize) -> *mut c_void {
    runtime_state::runtime()
        .router()
        .allocate_in(BackendKind::Safe, size)
        .cast()
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __unsafe_malloc(size: usize) -> *mut c_void {
    runtime_state::runtime()
        .router()
        .allocate_in(BackendKind::Unsafe, size)
        .cast()
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __safe_free(ptr: *mut c_void) {
    // SAFETY: caller passes a safe-backend block or null.
    unsafe {
        runtime_state::runtime()
            .router()
            .deallocate_in(BackendKind::Safe, ptr.cast());
    }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __unsafe_free(ptr: *mut c_void) {
    // SAFETY: caller passes an unsafe-backend block or null.
    unsafe {
        runtime_state::runtime()
            .router()
            .deallocate_in(BackendKind::Unsafe, ptr.cast());
    }
}

fn set_errno(value: c_int) {
    // SAFETY: __errno_location always returns this thread's errno slot.
    unsafe { *libc::__errno_location() = value };
}
