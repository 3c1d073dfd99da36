#![cfg(target_os = "linux")]
//! Allocation entry points and instrumentation primitives called by path.

use std::ffi::c_void;
use std::ptr;
use std::sync::Mutex;

use mpkguard::instrument_abi::{
    __allocate_extern_stack, __check_load_false_negative, __check_load_false_positive,
    __check_store_false_negative, __check_store_false_positive, __count_allocas,
    __get_domain_ptr, __pkey_set, get_domain, get_domain_ptr, set_domain_value,
};
use mpkguard::malloc_abi::{
    __safe_free, __safe_malloc, __unsafe_free, __unsafe_malloc, aligned_alloc, calloc, free,
    malloc, memalign, mpk_mmap, posix_memalign, realloc, sbrk,
};
use mpkguard::pkru;
use mpkguard::runtime_state::runtime;
use mpkguard::rust_alloc_abi::{
    __mpk_unsafe__rdl_alloc, __mpk_unsafe__rust_alloc, __mpk_unsafe__rust_alloc_zeroed,
    __mpk_unsafe__rust_dealloc, __mpk_unsafe__rust_realloc,
};
use mpkguard_membrane::domain::DomainDescriptor;
use mpkguard_membrane::{Domain, UNSAFE_REGION, global_counters};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn in_region<T>(ptr: *const T) -> bool {
    UNSAFE_REGION.contains_ptr(ptr)
}

fn live_unsafe_blocks() -> usize {
    runtime()
        .backends()
        .unsafe_backend()
        .region_heap()
        .expect("region backend")
        .stats()
        .live_blocks
}

fn errno() -> i32 {
    // SAFETY: this thread's errno slot.
    unsafe { *libc::__errno_location() }
}

/// Run `body` with the calling thread adopted and in `domain`, restoring
/// domain 0 afterwards.
fn in_domain<R>(domain: i32, body: impl FnOnce() -> R) -> R {
    mpkguard::adopt_current_thread(Domain::SAFE).expect("adopt");
    // SAFETY: the thread has a descriptor.
    unsafe { set_domain_value(domain) };
    let out = body();
    // SAFETY: as above.
    unsafe { set_domain_value(0) };
    out
}

#[test]
fn domain_one_allocation_is_freed_from_domain_zero_into_the_unsafe_heap() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let before = live_unsafe_blocks();
    // SAFETY: plain allocation.
    let block = in_domain(1, || unsafe { malloc(100) });
    assert!(in_region(block));
    assert_eq!(live_unsafe_blocks(), before + 1);

    // SAFETY: the thread is back in domain 0; the block is live.
    unsafe { free(block) };
    assert_eq!(live_unsafe_blocks(), before);
}

#[test]
fn safe_allocations_leave_the_unsafe_counter_alone() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    const K: usize = 32;
    let start = global_counters().snapshot();
    let blocks: Vec<*mut c_void> = in_domain(0, || {
        // SAFETY: plain allocations.
        (0..K).map(|i| unsafe { malloc(8 + i) }).collect()
    });
    for &block in &blocks[..K - 1] {
        assert!(!in_region(block));
        // SAFETY: live safe-backend blocks.
        unsafe { free(block) };
    }
    let end = global_counters().snapshot();
    assert_eq!(end.total_heap - start.total_heap, K as u64);
    assert_eq!(end.unsafe_heap, start.unsafe_heap);
    // SAFETY: last live block.
    unsafe { free(blocks[K - 1]) };
}

#[test]
fn calloc_and_realloc_follow_domain_then_address() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: every pointer is live when passed back.
    unsafe {
        let zeroed = in_domain(2, || calloc(16, 8)).cast::<u8>();
        assert!(in_region(zeroed));
        assert!(std::slice::from_raw_parts(zeroed, 128).iter().all(|&b| b == 0));
        zeroed.write_bytes(0x5A, 128);

        // Grown from domain 0: stays in the unsafe heap.
        let grown = realloc(zeroed.cast(), 50_000).cast::<u8>();
        assert!(in_region(grown));
        assert_eq!(*grown.add(127), 0x5A);
        free(grown.cast());

        assert!(in_domain(0, || calloc(usize::MAX, 2)).is_null());
        let fresh = in_domain(1, || realloc(ptr::null_mut(), 64));
        assert!(in_region(fresh));
        free(fresh);
    }
}

#[test]
fn aligned_entry_points_validate_and_align() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: out-pointers are valid; blocks are freed.
    unsafe {
        let mut out: *mut c_void = ptr::null_mut();
        assert_eq!(in_domain(0, || posix_memalign(&mut out, 3, 64)), libc::EINVAL);
        for domain in [0, 1] {
            assert_eq!(in_domain(domain, || posix_memalign(&mut out, 256, 1000)), 0);
            assert_eq!(out as usize % 256, 0);
            assert_eq!(in_region(out), domain != 0);
            free(out);
        }

        let block = in_domain(1, || aligned_alloc(64, 640));
        assert_eq!(block as usize % 64, 0);
        free(block);
        assert!(in_domain(0, || memalign(48, 16)).is_null());
        assert_eq!(errno(), libc::EINVAL);
    }
}

#[test]
fn exhausted_unsafe_heap_reports_enomem() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let oversized = UNSAFE_REGION.len() + 1;
    let before = live_unsafe_blocks();
    // SAFETY: failed requests hand back null; the live block is freed.
    unsafe {
        for attempt in 0..4 {
            libc::__errno_location().write(0);
            let block = in_domain(1, || match attempt {
                0 => malloc(oversized),
                1 => calloc(oversized, 1),
                2 => aligned_alloc(64, oversized),
                _ => memalign(64, oversized),
            });
            assert!(block.is_null(), "attempt {attempt} succeeded");
            assert_eq!(errno(), libc::ENOMEM, "attempt {attempt}");
        }

        let block = in_domain(1, || malloc(64));
        libc::__errno_location().write(0);
        assert!(realloc(block, oversized).is_null());
        assert_eq!(errno(), libc::ENOMEM);
        assert!(in_region(block), "failed realloc keeps the block");
        free(block);
    }
    assert_eq!(live_unsafe_blocks(), before);
}

#[test]
fn program_break_only_answers_queries() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: sbrk(0) only reads the break; the increment is refused.
    unsafe {
        let current = sbrk(0);
        assert_ne!(current as usize, usize::MAX);
        assert_eq!(sbrk(4096) as usize, usize::MAX);
        assert_eq!(errno(), libc::ENOMEM);
        assert_eq!(sbrk(0), current);
    }
}

#[test]
fn mapping_passes_through_in_every_domain() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    for domain in [0, 1] {
        // SAFETY: anonymous private mapping, unmapped below.
        unsafe {
            let map = in_domain(domain, || {
                mpk_mmap(
                    ptr::null_mut(),
                    4096,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            });
            assert_ne!(map, libc::MAP_FAILED);
            assert!(!in_region(map));
            assert_eq!(libc::munmap(map, 4096), 0);
        }
    }
}

#[test]
fn explicit_backend_helpers() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: each block goes back to the backend that produced it.
    unsafe {
        let unsafe_block = __unsafe_malloc(40);
        let safe_block = in_domain(2, || __safe_malloc(40));
        assert!(in_region(unsafe_block));
        assert!(!in_region(safe_block));
        __unsafe_free(unsafe_block);
        __safe_free(safe_block);
    }
}

#[test]
fn rust_shims_allocate_by_flag_and_free_by_address() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let start = global_counters().snapshot();
    // SAFETY: sizes and alignments passed back match each allocation.
    unsafe {
        let tagged = __mpk_unsafe__rust_alloc(48, 8, 1);
        let plain = __mpk_unsafe__rdl_alloc(48, 8, 0);
        assert!(in_region(tagged));
        assert!(!in_region(plain));

        tagged.write_bytes(7, 48);
        let grown = __mpk_unsafe__rust_realloc(tagged, 48, 8, 4096, 0);
        assert!(in_region(grown));
        assert_eq!(*grown.add(47), 7);

        let wide = __mpk_unsafe__rust_alloc_zeroed(512, 128, 1);
        assert_eq!(wide as usize % 128, 0);
        assert!(in_region(wide));
        assert!(std::slice::from_raw_parts(wide, 512).iter().all(|&b| b == 0));
        let wide = __mpk_unsafe__rust_realloc(wide, 512, 128, 2048, 1);
        assert_eq!(wide as usize % 128, 0);

        __mpk_unsafe__rust_dealloc(grown, 4096, 8);
        __mpk_unsafe__rust_dealloc(plain, 48, 8);
        __mpk_unsafe__rust_dealloc(wide, 2048, 128);
    }
    let end = global_counters().snapshot();
    assert_eq!(end.total_heap - start.total_heap, 5);
    assert_eq!(end.unsafe_heap - start.unsafe_heap, 4);
}

#[test]
fn descriptor_pointer_carries_an_extern_stack() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let before = live_unsafe_blocks();
    // A joined thread, so its extern stack is released before the lock is.
    std::thread::spawn(|| {
        in_domain(1, || {
            // SAFETY: the thread has a descriptor.
            unsafe {
                let descriptor = get_domain_ptr();
                assert_eq!(__get_domain_ptr(), descriptor.cast::<c_void>());
                let DomainDescriptor {
                    extern_stack_ptr,
                    domain,
                    ..
                } = *descriptor;
                assert_eq!(domain, 1);
                assert_eq!(get_domain(), 1);
                assert!(UNSAFE_REGION.contains(extern_stack_ptr - 1));
                // Stable across calls.
                assert_eq!((*get_domain_ptr()).extern_stack_ptr, extern_stack_ptr);
            }
        });
    })
    .join()
    .expect("join");
    assert_eq!(live_unsafe_blocks(), before);
}

#[test]
fn extern_stack_requests_are_at_least_the_default() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: the returned top is only compared, then released.
    unsafe {
        let top = __allocate_extern_stack(4096).cast::<u8>();
        let base = top.sub(0x100_0000);
        assert!(in_region(base));
        mpkguard::extern_stack::release(runtime(), top, 4096);
    }
}

#[test]
fn access_checks_classify_addresses() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let inside = (UNSAFE_REGION.start() + 0x40) as *mut c_void;
    let local = 0_u64;
    let outside = ptr::addr_of!(local) as *mut c_void;
    let start = global_counters().snapshot();
    // SAFETY: the checks only classify the addresses.
    unsafe {
        __check_load_false_positive(inside);
        __check_load_false_positive(outside);
        __check_store_false_positive(inside);
        __check_load_false_negative(outside);
        __check_load_false_negative(inside);
        __check_store_false_negative(inside);
        __count_allocas(4, 1);
    }
    let end = global_counters().snapshot();
    assert_eq!(end.total_unsafe_loads - start.total_unsafe_loads, 2);
    assert_eq!(end.safe_loads_in_unsafe - start.safe_loads_in_unsafe, 1);
    assert_eq!(end.total_unsafe_stores - start.total_unsafe_stores, 1);
    assert_eq!(end.safe_stores_in_unsafe - start.safe_stores_in_unsafe, 0);
    assert_eq!(end.total_safe_loads - start.total_safe_loads, 2);
    assert_eq!(end.unsafe_loads_in_safe - start.unsafe_loads_in_safe, 1);
    assert_eq!(end.unsafe_stores_in_safe - start.unsafe_stores_in_safe, 1);
    assert_eq!(end.total_allocas - start.total_allocas, 4);
    assert_eq!(end.unsafe_allocas - start.unsafe_allocas, 1);
}

#[test]
fn pkey_set_reports_missing_hardware() {
    let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let original = pkru::read_pkru();
    // SAFETY: grants full rights to key 1, restored below.
    let rc = unsafe { __pkey_set(1, 0, 0) };
    match original {
        None => assert_eq!(rc, -1),
        Some(value) => {
            assert_eq!(rc, 0);
            // SAFETY: PKU is present; restoring the previous value.
            unsafe { pkru::write_pkru(value) };
        }
    }
    // SAFETY: negative keys are rejected before touching the register.
    assert_eq!(unsafe { __pkey_set(-1, 0, 0) }, -1);
}
