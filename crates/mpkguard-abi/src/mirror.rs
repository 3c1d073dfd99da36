//! Register mirror of the descriptor address.
//!
//! On x86-64, instrumented code expects `r15` to hold the current thread's
//! descriptor address. The thread-local slot stays authoritative; `r15` is a
//! cache that `__check_r15` repairs when it drifts.

use std::ffi::c_void;

use mpkguard_membrane::domain::DomainDescriptor;

use crate::runtime_state::StartRoutine;

/// Publishes the descriptor address while a thread routine runs.
pub trait RegisterMirror: Sync {
    fn name(&self) -> &'static str;

    /// Run `routine(arg)` with the mirror set to `descriptor`.
    ///
    /// # Safety
    ///
    /// `descriptor` must be the calling thread's live descriptor.
    unsafe fn run(
        &self,
        descriptor: *mut DomainDescriptor,
        routine: StartRoutine,
        arg: *mut c_void,
    ) -> *mut c_void;
}

/// No register is reserved; the routine runs unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMirror;

impl RegisterMirror for NoMirror {
    fn name(&self) -> &'static str {
        "none"
    }

    unsafe fn run(
        &self,
        _descriptor: *mut DomainDescriptor,
        routine: StartRoutine,
        arg: *mut c_void,
    ) -> *mut c_void {
        routine(arg)
    }
}

#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Clone, Copy)]
pub struct R15Mirror;

#[cfg(target_arch = "x86_64")]
impl RegisterMirror for R15Mirror {
    fn name(&self) -> &'static str {
        "r15"
    }

    unsafe fn run(
        &self,
        descriptor: *mut DomainDescriptor,
        routine: StartRoutine,
        arg: *mut c_void,
    ) -> *mut c_void {
        // SAFETY: `call_with_r15` saves and restores r15 around the call.
        unsafe { call_with_r15(descriptor, routine, arg) }
    }
}

/// `routine(arg)` with `r15 = descriptor`; r15 is restored on return.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
unsafe extern "C" fn call_with_r15(
    descriptor: *mut DomainDescriptor,
    routine: StartRoutine,
    arg: *mut c_void,
) -> *mut c_void {
    core::arch::naked_asm!(
        "push r15",
        "mov r15, rdi",
        "mov rdi, rdx",
        "call rsi",
        "pop r15",
        "ret",
    )
}

/// The mirror to use for `enabled`, given the target.
#[must_use]
pub fn select(enabled: bool) -> &'static dyn RegisterMirror {
    #[cfg(target_arch = "x86_64")]
    if enabled {
        return &R15Mirror;
    }
    let _ = enabled;
    &NoMirror
}

/// Descriptor address `r15` should hold, allocating the extern stack if
/// needed. Aborts when the thread has no domain.
#[cfg(target_arch = "x86_64")]
extern "C" fn mirror_target() -> *mut DomainDescriptor {
    crate::instrument_abi::descriptor_with_stack()
}

#[cfg(target_arch = "x86_64")]
extern "C" fn note_resync() {
    let counters = mpkguard_membrane::global_counters();
    mpkguard_membrane::IsolationCounters::inc(&counters.mirror_resyncs);
}

/// `__check_r15()`: reload `r15` from the descriptor slot when it drifted.
#[cfg(target_arch = "x86_64")]
#[cfg_attr(not(debug_assertions), unsafe(no_mangle))]
#[unsafe(naked)]
pub unsafe extern "C" fn __check_r15() {
    core::arch::naked_asm!(
        "sub rsp, 8",
        "call {target}",
        "cmp r15, rax",
        "je 2f",
        "mov r15, rax",
        "call {resync}",
        "2:",
        "add rsp, 8",
        "ret",
        target = sym mirror_target,
        resync = sym note_resync,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn echo(arg: *mut c_void) -> *mut c_void {
        arg
    }

    #[test]
    fn no_mirror_calls_through() {
        let arg = 0x1234 as *mut c_void;
        // SAFETY: the descriptor is unused by NoMirror.
        let out = unsafe { NoMirror.run(std::ptr::null_mut(), echo, arg) };
        assert_eq!(out, arg);
        assert_eq!(select(false).name(), "none");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn r15_mirror_passes_argument_and_result() {
        let mut descriptor = DomainDescriptor::new(mpkguard_membrane::Domain::INTERN);
        let ptr: *mut DomainDescriptor = &mut descriptor;
        // SAFETY: `ptr` outlives the call; nothing dereferences it.
        let out = unsafe { R15Mirror.run(ptr, echo, 0x55 as *mut c_void) };
        assert_eq!(out, 0x55 as *mut c_void);
        assert_eq!(select(true).name(), "r15");
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn check_r15_reloads_the_descriptor_address() {
        crate::domain_state::adopt_current_thread(mpkguard_membrane::Domain::SAFE)
            .expect("adopt");
        let before = mpkguard_membrane::global_counters().snapshot().mirror_resyncs;
        let observed: usize;
        // SAFETY: r15 is declared clobbered, so the compiler keeps nothing
        // live in it across the call.
        unsafe {
            core::arch::asm!(
                "xor r15, r15",
                "call {check}",
                "mov rax, r15",
                check = sym __check_r15,
                out("rax") observed,
                out("r15") _,
                clobber_abi("C"),
            );
        }
        assert_eq!(observed, crate::domain_state::current_descriptor() as usize);
        let after = mpkguard_membrane::global_counters().snapshot().mirror_resyncs;
        assert!(after > before);
    }
}
