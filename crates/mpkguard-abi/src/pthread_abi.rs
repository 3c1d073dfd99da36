//! Thread creation hook: the new thread inherits its creator's domain.
//!
//! A descriptor for the child is prepared by the creator and installed by a
//! trampoline before the user routine runs. Children of untrusted threads
//! also get a private run stack carved from the unsafe backend, so their
//! frames live in untrusted memory. Those stacks come back through
//! [`pthread_join`] and [`pthread_detach`] (see [`crate::private_stacks`]).

use std::ffi::{c_int, c_void};
use std::mem::MaybeUninit;

use mpkguard_membrane::config::DEFAULT_EXTERN_STACK_SIZE;
use mpkguard_membrane::diag;
use mpkguard_membrane::diag::LogLevel;
use mpkguard_membrane::domain::DomainDescriptor;
use mpkguard_membrane::region_heap::PAGE_SIZE;
use mpkguard_membrane::{AllocatorBackend, IsolationError, IsolationResult, OrAbort};

use crate::domain_state;
use crate::private_stacks;
use crate::runtime_state::{self, IsolationRuntime, StartRoutine};

unsafe extern "C" {
    fn pthread_attr_setstack(
        attr: *mut libc::pthread_attr_t,
        stackaddr: *mut c_void,
        stacksize: usize,
    ) -> c_int;
    fn pthread_attr_getdetachstate(attr: *const libc::pthread_attr_t, state: *mut c_int) -> c_int;
}

/// What the trampoline needs to start the user routine.
struct ThreadLaunch {
    descriptor: *mut DomainDescriptor,
    routine: StartRoutine,
    arg: *mut c_void,
}

/// Thread attributes carrying a stack from the unsafe backend. The thread
/// is always started joinable; `detached` records what the caller asked for.
struct PrivateStack {
    attr: libc::pthread_attr_t,
    base: *mut u8,
    size: usize,
    detached: bool,
}

fn attr_call(call: &'static str, code: c_int) -> IsolationResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(IsolationError::ThreadAttributes { call, code })
    }
}

/// Largest of the default, the platform default and the requested size,
/// rounded up to whole pages.
#[must_use]
pub const fn stack_size_for(platform: usize, requested: usize) -> usize {
    let mut size = DEFAULT_EXTERN_STACK_SIZE;
    if platform > size {
        size = platform;
    }
    if requested > size {
        size = requested;
    }
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

impl PrivateStack {
    /// # Safety
    ///
    /// `requested` must be null or an initialized attribute object.
    unsafe fn build(
        runtime: &IsolationRuntime,
        requested: *const libc::pthread_attr_t,
    ) -> IsolationResult<Self> {
        let mut attr = MaybeUninit::<libc::pthread_attr_t>::uninit();
        // SAFETY: `attr` is writable storage for an attribute object.
        attr_call("pthread_attr_init", unsafe {
            libc::pthread_attr_init(attr.as_mut_ptr())
        })?;
        // SAFETY: initialized by pthread_attr_init.
        let mut attr = unsafe { attr.assume_init() };

        let result = (|| -> IsolationResult<(*mut u8, usize, bool)> {
            let mut platform = 0_usize;
            // SAFETY: initialized attribute, valid out-pointer.
            attr_call("pthread_attr_getstacksize", unsafe {
                libc::pthread_attr_getstacksize(&attr, &mut platform)
            })?;
            let mut wanted = 0_usize;
            let mut detach = libc::PTHREAD_CREATE_JOINABLE;
            if !requested.is_null() {
                // SAFETY: caller contract on `requested`.
                unsafe {
                    attr_call(
                        "pthread_attr_getstacksize",
                        libc::pthread_attr_getstacksize(requested, &mut wanted),
                    )?;
                    attr_call(
                        "pthread_attr_getdetachstate",
                        pthread_attr_getdetachstate(requested, &mut detach),
                    )?;
                }
            }
            let size = stack_size_for(platform, wanted);
            let base = runtime
                .backends()
                .unsafe_backend()
                .allocate_aligned(size, PAGE_SIZE);
            if base.is_null() {
                return Err(IsolationError::OutOfMemory {
                    what: "thread stack",
                    size,
                });
            }
            // SAFETY: `base` heads `size` writable bytes, page aligned.
            if let Err(err) = attr_call("pthread_attr_setstack", unsafe {
                pthread_attr_setstack(&mut attr, base.cast(), size)
            }) {
                // SAFETY: fresh block that no thread uses.
                unsafe { runtime.backends().unsafe_backend().deallocate(base) };
                return Err(err);
            }
            Ok((base, size, detach == libc::PTHREAD_CREATE_DETACHED))
        })();

        match result {
            Ok((base, size, detached)) => Ok(Self {
                attr,
                base,
                size,
                detached,
            }),
            Err(err) => {
                // SAFETY: initialized above and no longer needed.
                unsafe { libc::pthread_attr_destroy(&mut attr) };
                Err(err)
            }
        }
    }

    /// Give the stack back after a failed creation.
    fn release(mut self, runtime: &IsolationRuntime) {
        // SAFETY: no thread ever ran on this stack.
        unsafe {
            libc::pthread_attr_destroy(&mut self.attr);
            runtime.backends().unsafe_backend().deallocate(self.base);
        }
    }

    /// Drop the attribute object; the stack is in use until the thread is
    /// joined.
    fn hand_over(mut self) {
        diag!(
            LogLevel::Debug,
            "private stack {:p}+{:#x} handed to new thread",
            self.base,
            self.size
        );
        // SAFETY: pthread_create has copied what it needs.
        unsafe { libc::pthread_attr_destroy(&mut self.attr) };
    }
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    routine: Option<StartRoutine>,
    arg: *mut c_void,
) -> c_int {
    let runtime = runtime_state::runtime();
    let Some(routine) = routine else {
        return libc::EINVAL;
    };
    let domain = domain_state::current_domain().or_abort();
    let router = runtime.router();

    let descriptor = domain_state::new_descriptor(runtime, domain).or_abort();
    let launch_size = std::mem::size_of::<ThreadLaunch>();
    let launch = router.allocate(domain, launch_size).cast::<ThreadLaunch>();
    if launch.is_null() {
        IsolationError::OutOfMemory {
            what: "thread launch",
            size: launch_size,
        }
        .abort();
    }
    // SAFETY: fresh block sized for a ThreadLaunch.
    unsafe {
        launch.write(ThreadLaunch {
            descriptor,
            routine,
            arg,
        });
    }

    let real_create = runtime.real_pthread_create();
    let rc = if domain.is_untrusted() {
        private_stacks::reclaim(runtime);
        // SAFETY: C contract: `attr` is null or initialized.
        let stack = unsafe { PrivateStack::build(runtime, attr) }.or_abort();
        let tracked =
            private_stacks::track(runtime, stack.base, stack.size, stack.detached).or_abort();
        // SAFETY: forwarding to the real pthread_create with our attributes.
        let rc = unsafe { real_create(thread, &stack.attr, trampoline, launch.cast()) };
        if rc == 0 {
            // SAFETY: a successful pthread_create stored the handle.
            tracked.started(unsafe { *thread });
            stack.hand_over();
        } else {
            tracked.abandon(runtime);
            stack.release(runtime);
        }
        rc
    } else {
        // SAFETY: forwarding the caller's own arguments.
        unsafe { real_create(thread, attr, trampoline, launch.cast()) }
    };

    if rc != 0 {
        // SAFETY: the thread never started, so both blocks are still ours.
        unsafe {
            router.deallocate(launch.cast());
            router.deallocate(descriptor.cast());
        }
    }
    rc
}

#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_join(
    thread: libc::pthread_t,
    retval: *mut *mut c_void,
) -> c_int {
    let runtime = runtime_state::runtime();
    // SAFETY: forwarding the caller's own arguments.
    let rc = unsafe { (runtime.real_pthread_join())(thread, retval) };
    if rc == 0 {
        private_stacks::joined(runtime, thread);
    }
    private_stacks::reclaim(runtime);
    rc
}

/// Threads on a private stack stay joinable underneath; the runtime joins
/// them once they exit.
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
pub unsafe extern "C" fn pthread_detach(thread: libc::pthread_t) -> c_int {
    let runtime = runtime_state::runtime();
    if private_stacks::detach(thread) {
        return 0;
    }
    // SAFETY: forwarding the caller's own argument.
    unsafe { (runtime.real_pthread_detach())(thread) }
}

extern "C" fn trampoline(raw: *mut c_void) -> *mut c_void {
    let runtime = runtime_state::runtime();
    // SAFETY: `raw` is the ThreadLaunch written by pthread_create, consumed
    // exactly once here.
    let launch = unsafe { raw.cast::<ThreadLaunch>().read() };
    // SAFETY: as above; freed by address.
    unsafe { runtime.router().deallocate(raw.cast()) };

    domain_state::install(runtime, launch.descriptor).or_abort();
    let descriptor = domain_state::ensure_extern_stack(runtime).or_abort();
    diag!(
        LogLevel::Debug,
        "thread started in domain {}",
        // SAFETY: just installed for this thread.
        unsafe { (*descriptor).domain() }
    );
    // SAFETY: `descriptor` is this thread's live descriptor.
    unsafe { runtime.mirror().run(descriptor, launch.routine, launch.arg) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_stack_size_takes_the_largest_request() {
        assert_eq!(stack_size_for(0, 0), DEFAULT_EXTERN_STACK_SIZE);
        assert_eq!(stack_size_for(8 << 20, 0), DEFAULT_EXTERN_STACK_SIZE);
        assert_eq!(stack_size_for(32 << 20, 0), 32 << 20);
        assert_eq!(stack_size_for(0, (32 << 20) + 1), (32 << 20) + PAGE_SIZE);
    }
}
