//! In-process scenarios. Each one drives the runtime through its C entry
//! points and reports the first broken expectation.

use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use mpkguard::instrument_abi::{
    __check_load_false_negative, __check_load_false_positive, __check_store_false_negative,
    __check_store_false_positive, __count_allocas, __pkey_set, get_domain, get_domain_ptr,
    set_domain_value,
};
use mpkguard::malloc_abi::{calloc, free, malloc, realloc};
use mpkguard::pthread_abi::{pthread_create, pthread_join};
use mpkguard::rust_alloc_abi::{__mpk_unsafe__rust_alloc, __mpk_unsafe__rust_dealloc};
use mpkguard::{pkru, runtime_state};
use mpkguard_membrane::{Domain, UNSAFE_REGION, global_counters};

use crate::error::{HarnessError, HarnessResult};
use crate::verdict::Verdict;

type Check = Result<(), String>;

/// A named check against the live runtime.
#[derive(Clone, Copy)]
pub struct Scenario {
    pub name: &'static str,
    pub summary: &'static str,
    run: fn() -> Check,
}

impl Scenario {
    #[must_use]
    pub fn run(&self) -> Verdict {
        let started = Instant::now();
        let result = (self.run)();
        Verdict::new(self.name, result, started)
    }
}

impl std::fmt::Debug for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scenario").field("name", &self.name).finish()
    }
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "routing-by-domain",
        summary: "domain 1 allocation lands in the region and is freed from domain 0",
        run: routing_by_domain,
    },
    Scenario {
        name: "safe-heap-accounting",
        summary: "K safe allocations count K heap allocations and no unsafe ones",
        run: safe_heap_accounting,
    },
    Scenario {
        name: "realloc-keeps-owner",
        summary: "resizing keeps a block with the backend that owns it",
        run: realloc_keeps_owner,
    },
    Scenario {
        name: "thread-inherits-domain",
        summary: "a child of a domain 2 thread starts in domain 2 on an untrusted stack",
        run: thread_inherits_domain,
    },
    Scenario {
        name: "init-idempotent",
        summary: "concurrent initialization converges on one runtime",
        run: init_idempotent,
    },
    Scenario {
        name: "extern-stack",
        summary: "the descriptor's extern stack lies in the region",
        run: extern_stack,
    },
    Scenario {
        name: "access-classification",
        summary: "statistics checks classify region and non-region addresses",
        run: access_classification,
    },
    Scenario {
        name: "rust-shims",
        summary: "Rust allocator shims route by flag",
        run: rust_shims,
    },
    Scenario {
        name: "protection-keys",
        summary: "__pkey_set agrees with CPU support",
        run: protection_keys,
    },
];

pub fn find(name: &str) -> HarnessResult<&'static Scenario> {
    SCENARIOS
        .iter()
        .find(|scenario| scenario.name == name)
        .ok_or_else(|| HarnessError::UnknownScenario(name.to_owned()))
}

/// Run every scenario in table order.
#[must_use]
pub fn run_all() -> Vec<Verdict> {
    SCENARIOS.iter().map(Scenario::run).collect()
}

fn ensure(cond: bool, what: impl FnOnce() -> String) -> Check {
    if cond { Ok(()) } else { Err(what()) }
}

fn in_region<T>(ptr: *const T) -> bool {
    UNSAFE_REGION.contains_ptr(ptr)
}

/// Run `body` in `domain` on an adopted thread, then return to domain 0.
fn in_domain<R>(domain: i32, body: impl FnOnce() -> R) -> Result<R, String> {
    mpkguard::adopt_current_thread(Domain::SAFE).map_err(|err| err.to_string())?;
    // SAFETY: the thread has a descriptor.
    unsafe { set_domain_value(domain) };
    let out = body();
    // SAFETY: as above.
    unsafe { set_domain_value(0) };
    Ok(out)
}

fn routing_by_domain() -> Check {
    // SAFETY: plain allocation.
    let block = in_domain(1, || unsafe { malloc(100) })?;
    ensure(!block.is_null(), || "allocation failed".into())?;
    ensure(in_region(block), || format!("{block:p} is outside the region"))?;
    let before = global_counters().snapshot();
    // SAFETY: live block, freed from domain 0.
    unsafe { free(block) };
    let after = global_counters().snapshot();
    ensure(after.total_heap == before.total_heap, || {
        "free changed the allocation counter".into()
    })
}

fn safe_heap_accounting() -> Check {
    const K: usize = 16;
    let start = global_counters().snapshot();
    let blocks = in_domain(0, || {
        // SAFETY: plain allocations.
        (0..K).map(|i| unsafe { malloc(16 * (i + 1)) }).collect::<Vec<_>>()
    })?;
    for &block in &blocks[..K - 1] {
        // SAFETY: live blocks.
        unsafe { free(block) };
    }
    let end = global_counters().snapshot();
    // SAFETY: last live block.
    unsafe { free(blocks[K - 1]) };

    ensure(blocks.iter().all(|&b| !b.is_null() && !in_region(b)), || {
        "safe allocation landed in the region".into()
    })?;
    ensure(end.total_heap - start.total_heap == K as u64, || {
        format!("total heap grew by {}", end.total_heap - start.total_heap)
    })?;
    ensure(end.unsafe_heap == start.unsafe_heap, || {
        "unsafe heap counter moved".into()
    })
}

fn realloc_keeps_owner() -> Check {
    // SAFETY: every pointer is live when passed back.
    unsafe {
        let block = in_domain(2, || calloc(8, 8))?;
        ensure(in_region(block), || "calloc in domain 2 missed the region".into())?;
        let grown = realloc(block, 1 << 16);
        let kept = in_region(grown);
        free(grown);
        ensure(kept, || "realloc from domain 0 moved the block out".into())
    }
}

extern "C" fn report_child(arg: *mut c_void) -> *mut c_void {
    let marker = 0_u8;
    // SAFETY: the trampoline installed a descriptor; `arg` points at the
    // creator's pair.
    unsafe {
        let out = arg.cast::<(i32, usize)>();
        *out = (get_domain(), ptr::addr_of!(marker) as usize);
    }
    ptr::null_mut()
}

fn thread_inherits_domain() -> Check {
    let mut seen = (-1_i32, 0_usize);
    let rc = in_domain(2, || {
        let mut thread: libc::pthread_t = 0;
        // SAFETY: `seen` outlives the child, which is joined before return.
        unsafe {
            let rc = pthread_create(
                &mut thread,
                ptr::null(),
                Some(report_child),
                ptr::addr_of_mut!(seen).cast(),
            );
            if rc == 0 {
                pthread_join(thread, ptr::null_mut());
            }
            rc
        }
    })?;
    ensure(rc == 0, || format!("pthread_create returned {rc}"))?;
    ensure(seen.0 == 2, || format!("child started in domain {}", seen.0))?;
    ensure(UNSAFE_REGION.contains(seen.1), || {
        format!("child stack {:#x} is outside the region", seen.1)
    })
}

fn init_idempotent() -> Check {
    const THREADS: usize = 4;
    const CALLS: usize = 500;
    let seen = Arc::new(AtomicUsize::new(0));
    let mismatches = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let seen = Arc::clone(&seen);
            let mismatches = Arc::clone(&mismatches);
            std::thread::spawn(move || {
                for _ in 0..CALLS {
                    mpkguard::ensure_initialized();
                    let addr = runtime_state::runtime() as *const _ as usize;
                    if let Err(prev) =
                        seen.compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire)
                    {
                        if prev != addr {
                            mismatches.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().map_err(|_| "worker panicked".to_owned())?;
    }
    ensure(mpkguard::is_initialized(), || "runtime not ready".into())?;
    let mismatches = mismatches.load(Ordering::Relaxed);
    ensure(mismatches == 0, || format!("{mismatches} calls saw another runtime"))
}

fn extern_stack() -> Check {
    in_domain(1, || {
        // SAFETY: the thread has a descriptor.
        let top = unsafe { (*get_domain_ptr()).extern_stack_ptr };
        ensure(UNSAFE_REGION.contains(top.wrapping_sub(1)), || {
            format!("extern stack top {top:#x} is outside the region")
        })
    })?
}

fn access_classification() -> Check {
    let inside = (UNSAFE_REGION.start() + 0x80) as *mut c_void;
    let local = 0_u32;
    let outside = ptr::addr_of!(local) as *mut c_void;
    let start = global_counters().snapshot();
    // SAFETY: the checks only classify addresses.
    unsafe {
        __check_load_false_positive(inside);
        __check_store_false_positive(outside);
        __check_load_false_negative(inside);
        __check_store_false_negative(outside);
        __count_allocas(2, 1);
    }
    let end = global_counters().snapshot();
    let deltas = [
        end.total_unsafe_loads - start.total_unsafe_loads,
        end.safe_stores_in_unsafe - start.safe_stores_in_unsafe,
        end.unsafe_loads_in_safe - start.unsafe_loads_in_safe,
        end.total_safe_stores - start.total_safe_stores,
        end.total_allocas - start.total_allocas,
        end.unsafe_allocas - start.unsafe_allocas,
    ];
    ensure(deltas == [1, 1, 1, 1, 2, 1], || format!("counter deltas {deltas:?}"))
}

fn rust_shims() -> Check {
    // SAFETY: each block is released with the size and alignment it was
    // allocated with.
    unsafe {
        let tagged = __mpk_unsafe__rust_alloc(64, 8, 1);
        let plain = __mpk_unsafe__rust_alloc(64, 8, 0);
        let routed = in_region(tagged) && !in_region(plain);
        __mpk_unsafe__rust_dealloc(tagged, 64, 8);
        __mpk_unsafe__rust_dealloc(plain, 64, 8);
        ensure(routed, || "shim flag did not select the backend".into())
    }
}

fn protection_keys() -> Check {
    let previous = pkru::read_pkru();
    // SAFETY: full rights for key 1; the previous value is restored.
    let rc = unsafe { __pkey_set(1, 0, 0) };
    if let Some(value) = previous {
        // SAFETY: PKU present.
        unsafe { pkru::write_pkru(value) };
    }
    let expected = if pkru::pku_supported() { 0 } else { -1 };
    ensure(rc == expected, || format!("__pkey_set returned {rc}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_names_are_unique() {
        let mut names: Vec<_> = SCENARIOS.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SCENARIOS.len());
    }

    #[test]
    fn unknown_names_are_reported() {
        let err = find("no-such-thing").expect_err("must fail");
        assert!(matches!(err, HarnessError::UnknownScenario(name) if name == "no-such-thing"));
        assert_eq!(find("init-idempotent").expect("known").name, "init-idempotent");
    }
}
