//! Process-wide runtime state and its one-time bootstrap.
//!
//! Every entry point calls [`enter`] first. The first caller bootstraps:
//! configuration, both allocator backends, the raw memory primitives, the
//! domain key with a domain-0 descriptor for itself, and the real
//! `pthread_create`. Allocation requests made by that same thread while it
//! bootstraps (the dynamic linker allocating inside `dlsym`) are served from
//! the scratch buffer. Other threads wait.
//!
//! Once the gate is ready a second, lighter gate runs the post-init work
//! that needs a working heap: exit report registration and the diagnostic
//! sink.

use std::cell::UnsafeCell;
use std::ffi::{CStr, c_int, c_void};
use std::io::Write as _;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::OnceLock;

use mpkguard_membrane::diag;
use mpkguard_membrane::diag::LogLevel;
use mpkguard_membrane::sink::{DiagnosticSink, Signal};
use mpkguard_membrane::{
    DualBackend, GateStatus, InitGate, IsolationError, IsolationResult, NextObjectResolver,
    OrAbort, RegionHeap, Router, RuntimeConfig, SafeBackend, ScratchBuffer, SymbolResolver,
    UNSAFE_REGION, UnsafeAllocator, UnsafeBackend, global_counters,
};

use crate::domain_state;
use crate::mirror::{self, RegisterMirror};
use crate::pkru;

pub type SbrkFn = unsafe extern "C" fn(libc::intptr_t) -> *mut c_void;
pub type MmapFn =
    unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, libc::off_t) -> *mut c_void;
/// `mremap(old, old_size, new_size, flags, ...)`.
pub type MremapFn = unsafe extern "C" fn(*mut c_void, usize, usize, c_int, ...) -> *mut c_void;
pub type StartRoutine = extern "C" fn(*mut c_void) -> *mut c_void;
pub type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    StartRoutine,
    *mut c_void,
) -> c_int;
pub type PthreadJoinFn = unsafe extern "C" fn(libc::pthread_t, *mut *mut c_void) -> c_int;
pub type PthreadDetachFn = unsafe extern "C" fn(libc::pthread_t) -> c_int;

/// Real memory primitives forwarded unchanged.
#[derive(Debug, Clone, Copy)]
pub struct RawPrimitives {
    pub sbrk: SbrkFn,
    pub mmap: MmapFn,
    pub mremap: MremapFn,
}

impl RawPrimitives {
    fn resolve(resolver: &impl SymbolResolver) -> IsolationResult<Self> {
        let sbrk = lookup(resolver, c"sbrk", "sbrk")?;
        let mmap = lookup(resolver, c"mmap", "mmap")?;
        let mremap = lookup(resolver, c"mremap", "mremap")?;
        // SAFETY: the symbols are the libc functions with these signatures.
        unsafe {
            Ok(Self {
                sbrk: std::mem::transmute::<NonNull<c_void>, SbrkFn>(sbrk),
                mmap: std::mem::transmute::<NonNull<c_void>, MmapFn>(mmap),
                mremap: std::mem::transmute::<NonNull<c_void>, MremapFn>(mremap),
            })
        }
    }
}

fn lookup(
    resolver: &impl SymbolResolver,
    name: &CStr,
    label: &'static str,
) -> IsolationResult<NonNull<c_void>> {
    resolver
        .resolve(name)
        .ok_or(IsolationError::MissingPrimitive(label))
}

/// Everything the entry points need once bootstrap has finished.
pub struct IsolationRuntime {
    config: RuntimeConfig,
    backends: DualBackend,
    primitives: RawPrimitives,
    domain_key: libc::pthread_key_t,
    real_pthread_create: PthreadCreateFn,
    real_pthread_join: PthreadJoinFn,
    real_pthread_detach: PthreadDetachFn,
    pkru_supported: bool,
}

impl IsolationRuntime {
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub const fn backends(&self) -> &DualBackend {
        &self.backends
    }

    #[must_use]
    pub const fn primitives(&self) -> &RawPrimitives {
        &self.primitives
    }

    #[must_use]
    pub const fn domain_key(&self) -> libc::pthread_key_t {
        self.domain_key
    }

    #[must_use]
    pub const fn real_pthread_create(&self) -> PthreadCreateFn {
        self.real_pthread_create
    }

    #[must_use]
    pub const fn real_pthread_join(&self) -> PthreadJoinFn {
        self.real_pthread_join
    }

    #[must_use]
    pub const fn real_pthread_detach(&self) -> PthreadDetachFn {
        self.real_pthread_detach
    }

    /// PKRU writes are both requested and possible on this CPU.
    #[must_use]
    pub const fn pkru_writes(&self) -> bool {
        self.config.pkru_writes && self.pkru_supported
    }

    #[must_use]
    pub fn router(&'static self) -> Router<'static> {
        Router::new(&self.backends, UNSAFE_REGION, global_counters(), &SCRATCH)
    }

    #[must_use]
    pub fn mirror(&self) -> &'static dyn RegisterMirror {
        mirror::select(self.config.register_mirror)
    }
}

impl std::fmt::Debug for IsolationRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationRuntime")
            .field("config", &self.config)
            .field("backends", &self.backends)
            .field("domain_key", &self.domain_key)
            .field("pkru_supported", &self.pkru_supported)
            .finish_non_exhaustive()
    }
}

struct RuntimeSlot(UnsafeCell<MaybeUninit<IsolationRuntime>>);

// SAFETY: written exactly once by the bootstrapping thread before GATE
// publishes READY (release); only read after observing READY (acquire).
unsafe impl Sync for RuntimeSlot {}

static GATE: InitGate = InitGate::new();
static POST_INIT: InitGate = InitGate::new();
static RUNTIME: RuntimeSlot = RuntimeSlot(UnsafeCell::new(MaybeUninit::uninit()));
static SINK: OnceLock<DiagnosticSink> = OnceLock::new();

/// Serves allocations made while bootstrapping.
pub static SCRATCH: ScratchBuffer = ScratchBuffer::new();

/// How an entry point should proceed.
#[derive(Debug, Clone, Copy)]
pub enum Entry {
    Ready(&'static IsolationRuntime),
    /// The caller is the bootstrapping thread re-entering.
    Bootstrapping,
}

/// Pass the init gate, bootstrapping if this is the first call.
pub fn enter() -> Entry {
    match GATE.enter(bootstrap) {
        GateStatus::Bootstrapping => Entry::Bootstrapping,
        GateStatus::Ready => {
            // SAFETY: GATE is ready, so the slot is initialized.
            let runtime = unsafe { published() };
            // Reentry from post-init itself falls through with the runtime.
            let _ = POST_INIT.enter(|| post_init(runtime));
            Entry::Ready(runtime)
        }
    }
}

/// The runtime, bootstrapping if needed. Only for callers that cannot be
/// reached from inside bootstrap.
pub fn runtime() -> &'static IsolationRuntime {
    match enter() {
        Entry::Ready(runtime) => runtime,
        Entry::Bootstrapping => IsolationError::ReentrantInit.abort(),
    }
}

/// `ensure_initialized()`: idempotent, safe from any thread.
pub fn ensure_initialized() {
    let _ = enter();
}

#[must_use]
pub fn is_initialized() -> bool {
    GATE.is_ready()
}

/// # Safety
///
/// GATE must have reached READY.
unsafe fn published() -> &'static IsolationRuntime {
    // SAFETY: caller contract; the slot is never written again.
    unsafe { (*RUNTIME.0.get()).assume_init_ref() }
}

fn bootstrap() {
    let config = RuntimeConfig::from_process_env();
    diag::set_level(config.log_level);
    let resolver = NextObjectResolver;

    let safe = SafeBackend::resolve(&resolver).or_abort();
    diag!(LogLevel::Info, "safe backend resolved");

    let unsafe_backend = match config.unsafe_allocator {
        UnsafeAllocator::Region => {
            UnsafeBackend::Region(RegionHeap::reserve(UNSAFE_REGION).or_abort())
        }
        UnsafeAllocator::Family(family) => {
            let backend = UnsafeBackend::resolve_symbols(family, &resolver).or_abort();
            backend.verify_placement(&UNSAFE_REGION).or_abort();
            backend
        }
    };
    let backends = DualBackend::new(safe, unsafe_backend);
    diag!(
        LogLevel::Info,
        "unsafe backend: {}",
        mpkguard_membrane::AllocatorBackend::name(backends.unsafe_backend())
    );

    let primitives = RawPrimitives::resolve(&resolver).or_abort();
    let domain_key = domain_state::create_key().or_abort();
    let real_pthread_create = lookup(&resolver, c"pthread_create", "pthread_create")
        // SAFETY: the symbol is libc's pthread_create.
        .map(|sym| unsafe { std::mem::transmute::<NonNull<c_void>, PthreadCreateFn>(sym) })
        .or_abort();
    let real_pthread_join = lookup(&resolver, c"pthread_join", "pthread_join")
        // SAFETY: the symbol is libc's pthread_join.
        .map(|sym| unsafe { std::mem::transmute::<NonNull<c_void>, PthreadJoinFn>(sym) })
        .or_abort();
    let real_pthread_detach = lookup(&resolver, c"pthread_detach", "pthread_detach")
        // SAFETY: the symbol is libc's pthread_detach.
        .map(|sym| unsafe { std::mem::transmute::<NonNull<c_void>, PthreadDetachFn>(sym) })
        .or_abort();

    let runtime = IsolationRuntime {
        config,
        backends,
        primitives,
        domain_key,
        real_pthread_create,
        real_pthread_join,
        real_pthread_detach,
        pkru_supported: pkru::pku_supported(),
    };
    // SAFETY: only the gate owner reaches this point, once.
    let runtime = unsafe { (*RUNTIME.0.get()).write(runtime) };

    // The bootstrapping thread starts trusted; its descriptor comes from
    // the safe backend.
    domain_state::install_initial(runtime).or_abort();
    diag!(LogLevel::Info, "bootstrap complete");
}

fn post_init(runtime: &'static IsolationRuntime) {
    // SAFETY: `report_at_exit` is a plain extern "C" fn with no captures.
    if unsafe { libc::atexit(report_at_exit) } != 0 {
        diag!(LogLevel::Warn, "unable to register exit report");
    }
    if let Some(endpoint) = runtime.config.sink {
        let sink = DiagnosticSink::connect(endpoint).or_abort();
        sink.send_signal(Signal::BeginExecution, 0).or_abort();
        diag!(LogLevel::Info, "diagnostic sink connected to {endpoint}");
        let _ = SINK.set(sink);
    }
}

/// The connected diagnostic sink, if one was configured.
#[must_use]
pub fn sink() -> Option<&'static DiagnosticSink> {
    SINK.get()
}

extern "C" fn report_at_exit() {
    if !GATE.is_ready() {
        return;
    }
    // SAFETY: checked above.
    let runtime = unsafe { published() };
    let snapshot = global_counters().snapshot();
    let mut out = std::io::stdout().lock();
    if let Err(err) = snapshot
        .write_report(runtime.config.report, &mut out)
        .and_then(|()| out.flush())
    {
        diag!(LogLevel::Warn, "exit report failed: {err}");
    }
    if let Some(sink) = sink() {
        sink.send_final_report(&snapshot).or_abort();
    }
}
