//! Primitives called by instrumented code: domain get/set, descriptor and
//! extern stack access, and the statistics checks.

use std::ffi::{c_int, c_ulong, c_void};

use mpkguard_membrane::diag;
use mpkguard_membrane::diag::LogLevel;
use mpkguard_membrane::domain::DomainDescriptor;
use mpkguard_membrane::{Domain, OrAbort, UNSAFE_REGION, global_counters};

use crate::runtime_state;
use crate::{domain_state, extern_stack, pkru};

/// The calling thread's descriptor with its extern stack in place.
pub(crate) fn descriptor_with_stack() -> *mut DomainDescriptor {
    let runtime = runtime_state::runtime();
    domain_state::ensure_extern_stack(runtime).or_abort()
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn set_domain_value(new_domain: c_int) {
    let runtime = runtime_state::runtime();
    let domain = Domain::from_c_int(new_domain);
    domain_state::set_current_domain(domain).or_abort();
    if runtime.pkru_writes() {
        // Full rights for every key; revoking them is generated code's job.
        let _ = pkru::set_pkey_rights(0, 0);
    }
    diag!(LogLevel::Debug, "thread switched to domain {domain}");
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn get_domain() -> c_int {
    runtime_state::ensure_initialized();
    domain_state::current_domain().or_abort().as_c_int()
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn get_domain_ptr() -> *mut DomainDescriptor {
    descriptor_with_stack()
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __get_domain_ptr() -> *mut c_void {
    descriptor_with_stack().cast()
}

/// Allocate an extern stack of at least `size` bytes; returns its top.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __allocate_extern_stack(size: usize) -> *mut c_void {
    extern_stack::allocate(runtime_state::runtime(), size)
        .or_abort()
        .cast()
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __check_load_false_positive(addr: *mut c_void) {
    global_counters().check_load_false_positive(&UNSAFE_REGION, addr as usize);
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __check_store_false_positive(addr: *mut c_void) {
    global_counters().check_store_false_positive(&UNSAFE_REGION, addr as usize);
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __check_load_false_negative(addr: *mut c_void) {
    global_counters().check_load_false_negative(&UNSAFE_REGION, addr as usize);
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __check_store_false_negative(addr: *mut c_void) {
    global_counters().check_store_false_negative(&UNSAFE_REGION, addr as usize);
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __count_allocas(allocas: u8, unsafe_allocas: u8) {
    global_counters().count_allocas(u64::from(allocas), u64::from(unsafe_allocas));
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __sfi_exception() {
    global_counters().sfi_exception();
}

/// Write the rights for `pkey` into PKRU. Returns -1 without protection-key
/// support. `flags` is reserved.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn __pkey_set(pkey: c_int, rights: c_ulong, _flags: c_ulong) -> c_int {
    let (Ok(pkey), Ok(rights)) = (u32::try_from(pkey), u32::try_from(rights)) else {
        return -1;
    };
    pkru::set_pkey_rights(pkey, rights)
}
