// Every export takes raw pointers from C callers; per-function safety docs
// would repeat the C contract.
#![allow(clippy::missing_safety_doc)]
//! # mpkguard-abi
//!
//! `extern "C"` surface of the mpkguard isolation runtime. Built as a
//! `cdylib` (`libmpkguard.so`) and loaded with `LD_PRELOAD` into a program
//! whose instrumented code calls the domain primitives.
//!
//! # Architecture
//!
//! ```text
//! malloc/free/...        -> runtime_state::enter -> Router (membrane)
//! pthread_create         -> pthread_abi trampoline -> domain_state
//! pthread_join/detach    -> private_stacks
//! set_domain_value/...   -> domain_state, pkru
//! __check_* / __count_*  -> IsolationCounters (membrane)
//! ```
//!
//! Symbols are only exported unmangled in release builds, so debug builds
//! and tests link the same functions without interposing their own
//! allocator.

pub mod domain_state;
pub mod extern_stack;
pub mod instrument_abi;
pub mod malloc_abi;
pub mod mirror;
pub mod pkru;
pub mod private_stacks;
pub mod pthread_abi;
pub mod runtime_state;
pub mod rust_alloc_abi;

pub use domain_state::{adopt_current_thread, current_domain, set_current_domain};
pub use runtime_state::{IsolationRuntime, ensure_initialized, is_initialized};
