//! Per-thread Domain Descriptor storage.
//!
//! The descriptor pointer lives in a const-initialized thread-local so reads
//! never allocate. The same pointer is stored under a pthread key whose
//! destructor tears the descriptor down at thread exit; afterwards the
//! thread keeps answering with the domain it had, so allocations made by
//! late TLS destructors still route.

use std::cell::Cell;
use std::ffi::c_void;

use mpkguard_membrane::diag;
use mpkguard_membrane::diag::LogLevel;
use mpkguard_membrane::domain::DomainDescriptor;
use mpkguard_membrane::{AllocatorBackend, Domain, IsolationError, IsolationResult};

use crate::extern_stack;
use crate::private_stacks;
use crate::runtime_state::{self, IsolationRuntime};

thread_local! {
    static DESCRIPTOR: Cell<*mut DomainDescriptor> = const { Cell::new(std::ptr::null_mut()) };
    static RETIRED: Cell<Option<Domain>> = const { Cell::new(None) };
}

pub(crate) fn create_key() -> IsolationResult<libc::pthread_key_t> {
    let mut key: libc::pthread_key_t = 0;
    // SAFETY: `key` is a valid out-pointer; the destructor has the C ABI.
    let rc = unsafe { libc::pthread_key_create(&mut key, Some(retire_descriptor)) };
    if rc != 0 {
        return Err(IsolationError::DomainKey(rc));
    }
    Ok(key)
}

/// Allocate a descriptor for `domain` from the backend that serves it.
pub(crate) fn new_descriptor(
    runtime: &IsolationRuntime,
    domain: Domain,
) -> IsolationResult<*mut DomainDescriptor> {
    let size = std::mem::size_of::<DomainDescriptor>();
    let raw = runtime.backends().for_domain(domain).allocate(size);
    if raw.is_null() {
        return Err(IsolationError::OutOfMemory {
            what: "domain descriptor",
            size,
        });
    }
    let descriptor = raw.cast::<DomainDescriptor>();
    // SAFETY: fresh, suitably aligned block of the right size.
    unsafe { descriptor.write(DomainDescriptor::new(domain)) };
    Ok(descriptor)
}

/// Make `descriptor` the calling thread's descriptor.
pub(crate) fn install(
    runtime: &IsolationRuntime,
    descriptor: *mut DomainDescriptor,
) -> IsolationResult<()> {
    // SAFETY: the key was created at bootstrap.
    let rc = unsafe { libc::pthread_setspecific(runtime.domain_key(), descriptor.cast()) };
    if rc != 0 {
        return Err(IsolationError::DomainStore(rc));
    }
    DESCRIPTOR.with(|slot| slot.set(descriptor));
    RETIRED.with(|slot| slot.set(None));
    Ok(())
}

pub(crate) fn install_initial(runtime: &IsolationRuntime) -> IsolationResult<()> {
    if DESCRIPTOR.with(Cell::get).is_null() {
        let descriptor = new_descriptor(runtime, Domain::SAFE)?;
        install(runtime, descriptor)?;
    }
    Ok(())
}

/// The calling thread's descriptor, or null.
#[must_use]
pub fn current_descriptor() -> *mut DomainDescriptor {
    DESCRIPTOR.with(Cell::get)
}

/// The calling thread's domain.
pub fn current_domain() -> IsolationResult<Domain> {
    let descriptor = current_descriptor();
    if descriptor.is_null() {
        return RETIRED.with(Cell::get).ok_or(IsolationError::NoDomain);
    }
    // SAFETY: a non-null slot always holds this thread's live descriptor.
    Ok(unsafe { (*descriptor).domain() })
}

pub fn set_current_domain(domain: Domain) -> IsolationResult<()> {
    let descriptor = current_descriptor();
    if descriptor.is_null() {
        return Err(IsolationError::NoDomain);
    }
    // SAFETY: live descriptor owned by this thread.
    unsafe { (*descriptor).set_domain(domain) };
    Ok(())
}

/// Give the calling thread's descriptor an extern stack if it lacks one.
pub(crate) fn ensure_extern_stack(
    runtime: &IsolationRuntime,
) -> IsolationResult<*mut DomainDescriptor> {
    let descriptor = current_descriptor();
    if descriptor.is_null() {
        return Err(IsolationError::NoDomain);
    }
    // SAFETY: live descriptor owned by this thread.
    unsafe {
        if !(*descriptor).has_extern_stack() {
            let top = extern_stack::allocate(runtime, runtime.config().extern_stack_size)?;
            (*descriptor).extern_stack_ptr = top as usize;
        }
    }
    Ok(descriptor)
}

/// Install a descriptor for a thread that was not started through the
/// thread hook. Does nothing when the thread already has one.
pub fn adopt_current_thread(domain: Domain) -> IsolationResult<()> {
    let runtime = runtime_state::runtime();
    if current_descriptor().is_null() {
        let descriptor = new_descriptor(runtime, domain)?;
        install(runtime, descriptor)?;
        diag!(LogLevel::Debug, "adopted thread into domain {domain}");
    }
    Ok(())
}

/// Key destructor: release the extern stack and the descriptor, and flag
/// a private run stack for reclaiming.
extern "C" fn retire_descriptor(value: *mut c_void) {
    let descriptor = value.cast::<DomainDescriptor>();
    if descriptor.is_null() || !runtime_state::is_initialized() {
        return;
    }
    let runtime = runtime_state::runtime();
    // SAFETY: the key only ever holds this thread's live descriptor.
    let (domain, stack_top) = unsafe { ((*descriptor).domain(), (*descriptor).extern_stack_ptr) };
    RETIRED.with(|slot| slot.set(Some(domain)));
    DESCRIPTOR.with(|slot| {
        if slot.get() == descriptor {
            slot.set(std::ptr::null_mut());
        }
    });
    private_stacks::mark_exiting();
    let router = runtime.router();
    // SAFETY: both blocks were allocated by the runtime for this thread and
    // nothing references them once the thread is exiting.
    unsafe {
        if stack_top != 0 {
            extern_stack::release(
                runtime,
                stack_top as *mut u8,
                runtime.config().extern_stack_size,
            );
        }
        router.deallocate(descriptor.cast());
    }
}
