//! Domain-tagged allocator shims for instrumented Rust code.
//!
//! The code generator rewrites `__rust_alloc`/`__rdl_alloc` call sites whose
//! result may reach untrusted code into these entry points, passing a flag
//! byte: non-zero allocates from the unsafe backend. Resizes and frees route
//! by address. Requests aligned above 16 bytes use the backend's aligned
//! path.

use mpkguard_membrane::backend::MIN_ALIGN;
use mpkguard_membrane::{BackendKind, Domain, Provenance, Router};

use crate::runtime_state;

fn allocate(router: &Router<'_>, size: u64, align: u64, flag: u8, zeroed: bool) -> *mut u8 {
    let (Ok(size), Ok(align)) = (usize::try_from(size), usize::try_from(align)) else {
        return std::ptr::null_mut();
    };
    let domain = Domain::from_flag(flag);
    if align > MIN_ALIGN {
        let block = router.allocate_aligned(domain, size, align);
        if zeroed && !block.is_null() {
            // SAFETY: fresh block of `size` bytes.
            unsafe { block.write_bytes(0, size) };
        }
        block
    } else if zeroed {
        router.allocate_zeroed(domain, 1, size)
    } else {
        router.allocate(domain, size)
    }
}

/// # Safety
///
/// `ptr` must be a live block of `old_size` bytes from these shims or the
/// standard entry points.
unsafe fn reallocate(
    router: &Router<'_>,
    ptr: *mut u8,
    old_size: u64,
    align: u64,
    new_size: u64,
    flag: u8,
) -> *mut u8 {
    let (Ok(old_size), Ok(align), Ok(new_size)) = (
        usize::try_from(old_size),
        usize::try_from(align),
        usize::try_from(new_size),
    ) else {
        return std::ptr::null_mut();
    };
    if align <= MIN_ALIGN {
        // SAFETY: forwarded caller contract.
        return unsafe { router.reallocate(Domain::from_flag(flag), ptr, new_size) };
    }
    // Over-aligned blocks move through the aligned path of their owner.
    let owner = match router.classify(ptr) {
        Provenance::Backend(kind) => kind,
        Provenance::Null | Provenance::Scratch => BackendKind::for_domain(Domain::from_flag(flag)),
    };
    let domain = match owner {
        BackendKind::Safe => Domain::SAFE,
        BackendKind::Unsafe => Domain::EXTERN,
    };
    let moved = router.allocate_aligned(domain, new_size, align);
    if !moved.is_null() && !ptr.is_null() {
        // SAFETY: both blocks hold at least `min(old, new)` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, moved, old_size.min(new_size));
            router.deallocate(ptr);
        }
    }
    moved
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __mpk_unsafe__rust_alloc(size: u64, align: u64, flag: u8) -> *mut u8 {
    allocate(&runtime_state::runtime().router(), size, align, flag, false)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __mpk_unsafe__rust_alloc_zeroed(
    size: u64,
    align: u64,
    flag: u8,
) -> *mut u8 {
    allocate(&runtime_state::runtime().router(), size, align, flag, true)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __mpk_unsafe__rust_realloc(
    ptr: *mut u8,
    old_size: u64,
    align: u64,
    new_size: u64,
    flag: u8,
) -> *mut u8 {
    let router = runtime_state::runtime().router();
    // SAFETY: forwarded caller contract.
    unsafe { reallocate(&router, ptr, old_size, align, new_size, flag) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __mpk_unsafe__rust_dealloc(ptr: *mut u8, _size: u64, _align: u64) {
    // SAFETY: caller passes a live block from these shims.
    unsafe { runtime_state::runtime().router().deallocate(ptr) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __mpk_unsafe__rdl_alloc(size: u64, align: u64, flag: u8) -> *mut u8 {
    allocate(&runtime_state::runtime().router(), size, align, flag, false)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __mpk_unsafe__rdl_alloc_zeroed(
    size: u64,
    align: u64,
    flag: u8,
) -> *mut u8 {
    allocate(&runtime_state::runtime().router(), size, align, flag, true)
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __mpk_unsafe__rdl_realloc(
    ptr: *mut u8,
    old_size: u64,
    align: u64,
    new_size: u64,
    flag: u8,
) -> *mut u8 {
    let router = runtime_state::runtime().router();
    // SAFETY: forwarded caller contract.
    unsafe { reallocate(&router, ptr, old_size, align, new_size, flag) }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __mpk_unsafe__rdl_dealloc(ptr: *mut u8, _size: u64, _align: u64) {
    // SAFETY: caller passes a live block from these shims.
    unsafe { runtime_state::runtime().router().deallocate(ptr) }
}
