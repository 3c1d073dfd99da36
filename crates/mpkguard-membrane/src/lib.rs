//! # mpkguard-membrane
//!
//! Core of the mpkguard isolation runtime: the domain model, the two
//! allocator backends, address-range classification and the routing logic
//! that the ABI layer drives from `malloc`, `free` and friends.
//!
//! # Architecture
//!
//! ```text
//! C caller -> mpkguard-abi entry -> InitGate -> Router -> Safe | Unsafe backend
//!                                              \-> IsolationCounters
//! ```
//!
//! New memory follows the calling thread's [`Domain`]; existing memory
//! follows its address ([`region::classify`]).

#[macro_use]
pub mod diag;

pub mod backend;
pub mod config;
pub mod counters;
pub mod domain;
pub mod error;
pub mod gate;
pub mod region;
pub mod region_heap;
pub mod routing;
pub mod scratch;
pub mod sink;
pub mod size_class;
pub mod spin;

pub use backend::{
    AllocatorBackend, DualBackend, NextObjectResolver, SafeBackend, SymbolFamily, SymbolResolver,
    UnsafeBackend,
};
pub use config::{RuntimeConfig, UnsafeAllocator};
pub use counters::{CountersSnapshot, IsolationCounters, ReportFormat, global_counters};
pub use domain::{BackendKind, Domain, DomainDescriptor};
pub use error::{ErrorCategory, IsolationError, IsolationResult, OrAbort};
pub use gate::{GateState, GateStatus, InitGate};
pub use region::{ReservedRegion, UNSAFE_REGION};
pub use region_heap::RegionHeap;
pub use routing::{Allocation, Provenance, Router};
pub use scratch::ScratchBuffer;
