//! The two allocator backends and how they are resolved.
//!
//! The safe backend is the process's original allocator, found by looking
//! up `malloc` and friends in the objects loaded after us. The unsafe
//! backend is either the built-in [`RegionHeap`] or an alternate allocator
//! family (mimalloc, tcmalloc, dlmalloc) resolved the same way. Both bundles
//! are immutable once bootstrap finishes.

use std::ffi::{CStr, c_void};
use std::ptr::NonNull;

use crate::domain::{BackendKind, Domain};
use crate::error::{IsolationError, IsolationResult};
use crate::region::ReservedRegion;
use crate::region_heap::RegionHeap;

/// Alignment every backend guarantees without the aligned path.
pub const MIN_ALIGN: usize = 16;

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
/// `memalign(alignment, size)`.
pub type MemalignFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;

/// Uniform interface over the safe and unsafe allocators.
pub trait AllocatorBackend: Sync {
    fn kind(&self) -> BackendKind;

    fn name(&self) -> &'static str;

    fn allocate(&self, size: usize) -> *mut u8;

    fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8;

    /// Returns null when the backend cannot honour `align`.
    fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must be null or a live block owned by this backend.
    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must be null or a live block owned by this backend.
    unsafe fn deallocate(&self, ptr: *mut u8);
}

/// Looks up exported symbols by name.
pub trait SymbolResolver {
    fn resolve(&self, name: &CStr) -> Option<NonNull<c_void>>;
}

/// Resolves symbols from the objects loaded after the caller (`RTLD_NEXT`),
/// which skips our own interposed definitions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NextObjectResolver;

impl SymbolResolver for NextObjectResolver {
    fn resolve(&self, name: &CStr) -> Option<NonNull<c_void>> {
        // SAFETY: `name` is NUL-terminated; RTLD_NEXT is a valid pseudo-handle.
        NonNull::new(unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr()) })
    }
}

/// Allocator families that can be resolved by symbol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolFamily {
    Libc,
    Mimalloc,
    Tcmalloc,
    Dlmalloc,
}

struct FamilyNames {
    malloc: &'static CStr,
    calloc: &'static CStr,
    realloc: &'static CStr,
    free: &'static CStr,
    memalign: &'static CStr,
}

impl SymbolFamily {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Libc => "libc",
            Self::Mimalloc => "mimalloc",
            Self::Tcmalloc => "tcmalloc",
            Self::Dlmalloc => "dlmalloc",
        }
    }

    const fn names(self) -> FamilyNames {
        match self {
            Self::Libc => FamilyNames {
                malloc: c"malloc",
                calloc: c"calloc",
                realloc: c"realloc",
                free: c"free",
                memalign: c"memalign",
            },
            Self::Mimalloc => FamilyNames {
                malloc: c"mi_malloc",
                calloc: c"mi_calloc",
                realloc: c"mi_realloc",
                free: c"mi_free",
                memalign: c"mi_memalign",
            },
            Self::Tcmalloc => FamilyNames {
                malloc: c"tc_malloc",
                calloc: c"tc_calloc",
                realloc: c"tc_realloc",
                free: c"tc_free",
                memalign: c"tc_memalign",
            },
            Self::Dlmalloc => FamilyNames {
                malloc: c"dl_malloc",
                calloc: c"dl_calloc",
                realloc: c"dl_realloc",
                free: c"dl_free",
                memalign: c"dl_memalign",
            },
        }
    }
}

fn static_name(name: &'static CStr) -> &'static str {
    name.to_str().unwrap_or("<non-utf8>")
}

fn require(
    resolver: &impl SymbolResolver,
    name: &'static CStr,
    backend: &'static str,
) -> IsolationResult<NonNull<c_void>> {
    resolver
        .resolve(name)
        .ok_or(IsolationError::AllocatorSymbol {
            symbol: static_name(name),
            backend,
        })
}

/// The resolved entry points of one allocator family.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorSymbols {
    family: SymbolFamily,
    malloc: MallocFn,
    calloc: CallocFn,
    realloc: ReallocFn,
    free: FreeFn,
    memalign: Option<MemalignFn>,
}

impl AllocatorSymbols {
    /// Resolve the four required entry points plus the optional aligned
    /// allocator. `backend` names the role for diagnostics.
    pub fn resolve(
        family: SymbolFamily,
        resolver: &impl SymbolResolver,
        backend: &'static str,
    ) -> IsolationResult<Self> {
        let names = family.names();
        let malloc = require(resolver, names.malloc, backend)?;
        let calloc = require(resolver, names.calloc, backend)?;
        let realloc = require(resolver, names.realloc, backend)?;
        let free = require(resolver, names.free, backend)?;
        let memalign = resolver.resolve(names.memalign);
        // SAFETY: each symbol was exported under the C signature named by its type.
        unsafe {
            Ok(Self {
                family,
                malloc: std::mem::transmute::<*mut c_void, MallocFn>(malloc.as_ptr()),
                calloc: std::mem::transmute::<*mut c_void, CallocFn>(calloc.as_ptr()),
                realloc: std::mem::transmute::<*mut c_void, ReallocFn>(realloc.as_ptr()),
                free: std::mem::transmute::<*mut c_void, FreeFn>(free.as_ptr()),
                memalign: memalign
                    .map(|sym| std::mem::transmute::<*mut c_void, MemalignFn>(sym.as_ptr())),
            })
        }
    }

    #[must_use]
    pub const fn family(&self) -> SymbolFamily {
        self.family
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        // SAFETY: resolved allocator entry point.
        unsafe { (self.malloc)(size).cast() }
    }

    fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        // SAFETY: resolved allocator entry point.
        unsafe { (self.calloc)(count, size).cast() }
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        if align <= MIN_ALIGN {
            return self.allocate(size);
        }
        match self.memalign {
            // SAFETY: resolved allocator entry point.
            Some(memalign) => unsafe { memalign(align, size).cast() },
            None => std::ptr::null_mut(),
        }
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: caller guarantees `ptr` belongs to this family.
        unsafe { (self.realloc)(ptr.cast(), size).cast() }
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        // SAFETY: caller guarantees `ptr` belongs to this family.
        unsafe { (self.free)(ptr.cast()) }
    }
}

/// The process's original allocator.
#[derive(Debug)]
pub struct SafeBackend {
    symbols: AllocatorSymbols,
}

impl SafeBackend {
    pub fn resolve(resolver: &impl SymbolResolver) -> IsolationResult<Self> {
        AllocatorSymbols::resolve(SymbolFamily::Libc, resolver, "safe").map(Self::from_symbols)
    }

    #[must_use]
    pub const fn from_symbols(symbols: AllocatorSymbols) -> Self {
        Self { symbols }
    }
}

impl AllocatorBackend for SafeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Safe
    }

    fn name(&self) -> &'static str {
        self.symbols.family.label()
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        self.symbols.allocate(size)
    }

    fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        self.symbols.allocate_zeroed(count, size)
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        self.symbols.allocate_aligned(size, align)
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        // SAFETY: forwarded caller contract.
        unsafe { self.symbols.reallocate(ptr, size) }
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        // SAFETY: forwarded caller contract.
        unsafe { self.symbols.deallocate(ptr) }
    }
}

/// Allocator for untrusted domains.
#[derive(Debug)]
pub enum UnsafeBackend {
    /// Built-in heap confined to the reserved unsafe region.
    Region(RegionHeap),
    /// An alternate allocator family; it must be configured to place its
    /// memory inside the reserved region for address routing to hold.
    Symbols(AllocatorSymbols),
}

impl UnsafeBackend {
    pub fn resolve_symbols(
        family: SymbolFamily,
        resolver: &impl SymbolResolver,
    ) -> IsolationResult<Self> {
        AllocatorSymbols::resolve(family, resolver, "unsafe").map(Self::Symbols)
    }

    /// Check that a trial block lands inside `region`. The built-in heap
    /// passes by construction; a symbol family is asked for one small block.
    pub fn verify_placement(&self, region: &ReservedRegion) -> IsolationResult<()> {
        let Self::Symbols(symbols) = self else {
            return Ok(());
        };
        let trial = symbols.allocate(MIN_ALIGN);
        if trial.is_null() {
            return Err(IsolationError::OutOfMemory {
                what: "placement check",
                size: MIN_ALIGN,
            });
        }
        let inside = region.contains_ptr(trial);
        // SAFETY: `trial` came from this family's malloc.
        unsafe { symbols.deallocate(trial) };
        if inside {
            Ok(())
        } else {
            Err(IsolationError::FamilyOutsideRegion {
                family: symbols.family.label(),
                addr: trial as usize,
            })
        }
    }

    #[must_use]
    pub fn region_heap(&self) -> Option<&RegionHeap> {
        match self {
            Self::Region(heap) => Some(heap),
            Self::Symbols(_) => None,
        }
    }
}

impl AllocatorBackend for UnsafeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Unsafe
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Region(_) => "region",
            Self::Symbols(symbols) => symbols.family.label(),
        }
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        match self {
            Self::Region(heap) => heap.allocate(size),
            Self::Symbols(symbols) => symbols.allocate(size),
        }
    }

    fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        match self {
            Self::Region(heap) => heap.allocate_zeroed(count, size),
            Self::Symbols(symbols) => symbols.allocate_zeroed(count, size),
        }
    }

    fn allocate_aligned(&self, size: usize, align: usize) -> *mut u8 {
        match self {
            Self::Region(heap) => heap.allocate_aligned(size, align),
            Self::Symbols(symbols) => symbols.allocate_aligned(size, align),
        }
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        match self {
            // SAFETY: forwarded caller contract.
            Self::Region(heap) => unsafe { heap.reallocate(ptr, size) },
            // SAFETY: forwarded caller contract.
            Self::Symbols(symbols) => unsafe { symbols.reallocate(ptr, size) },
        }
    }

    unsafe fn deallocate(&self, ptr: *mut u8) {
        match self {
            // SAFETY: forwarded caller contract.
            Self::Region(heap) => unsafe { heap.deallocate(ptr) },
            // SAFETY: forwarded caller contract.
            Self::Symbols(symbols) => unsafe { symbols.deallocate(ptr) },
        }
    }
}

/// Both backends, selected either by domain or by backend kind.
#[derive(Debug)]
pub struct DualBackend {
    safe: SafeBackend,
    unsafe_: UnsafeBackend,
}

impl DualBackend {
    #[must_use]
    pub const fn new(safe: SafeBackend, unsafe_: UnsafeBackend) -> Self {
        Self { safe, unsafe_ }
    }

    #[must_use]
    pub fn backend(&self, kind: BackendKind) -> &dyn AllocatorBackend {
        match kind {
            BackendKind::Safe => &self.safe,
            BackendKind::Unsafe => &self.unsafe_,
        }
    }

    #[must_use]
    pub fn for_domain(&self, domain: Domain) -> &dyn AllocatorBackend {
        self.backend(BackendKind::for_domain(domain))
    }

    #[must_use]
    pub const fn safe(&self) -> &SafeBackend {
        &self.safe
    }

    #[must_use]
    pub const fn unsafe_backend(&self) -> &UnsafeBackend {
        &self.unsafe_
    }
}
