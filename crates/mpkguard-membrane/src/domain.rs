//! Protection domains and the per-thread domain descriptor.
//!
//! Domain `0` is the trusted ("safe") domain. Every non-zero value names an
//! untrusted domain; when instrumented call stacks mix untrusted domains the
//! value is kept as a bitmask with one bit per domain.

use std::fmt;

/// A protection-domain identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Domain(u64);

impl Domain {
    /// Trusted code and data.
    pub const SAFE: Self = Self(0);
    /// Extern-unsafe: code reached across a foreign-function boundary.
    pub const EXTERN: Self = Self(1);
    /// Intern-unsafe: unsafe blocks inside trusted code.
    pub const INTERN: Self = Self(2);

    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Map the flag byte emitted by the code generator on tagged allocation
    /// calls: zero selects the safe domain, anything else the extern domain.
    #[must_use]
    pub const fn from_flag(flag: u8) -> Self {
        if flag == 0 { Self::SAFE } else { Self::EXTERN }
    }

    #[must_use]
    pub const fn is_safe(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_untrusted(self) -> bool {
        self.0 != 0
    }

    /// Combine two domains the way a mixed call stack does.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True when every untrusted bit of `other` is also set here.
    #[must_use]
    pub const fn includes(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Value handed back across the C ABI (`int`).
    #[must_use]
    pub const fn as_c_int(self) -> i32 {
        self.0 as i32
    }

    /// Build a domain from a C `int`; negative values keep their bit pattern.
    #[must_use]
    pub const fn from_c_int(value: i32) -> Self {
        Self(value as u32 as u64)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::SAFE => f.write_str("safe"),
            Self::EXTERN => f.write_str("extern"),
            Self::INTERN => f.write_str("intern"),
            Self(mask) => write!(f, "mask({mask:#x})"),
        }
    }
}

/// Which of the two allocator backends owns a request or an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Safe,
    Unsafe,
}

impl BackendKind {
    /// Domain-based selection used by allocation entry points.
    #[must_use]
    pub const fn for_domain(domain: Domain) -> Self {
        if domain.is_safe() {
            Self::Safe
        } else {
            Self::Unsafe
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Unsafe => "unsafe",
        }
    }
}

/// Per-thread record read and written by instrumented code at fixed offsets.
///
/// The layout is part of the ABI: generated code addresses these fields with
/// the `*_OFFSET` constants below, so fields must never be reordered.
#[derive(Debug)]
#[repr(C)]
pub struct DomainDescriptor {
    /// Top of the thread's extern stack, null until first requested.
    pub extern_stack_ptr: usize,
    /// Current domain value.
    pub domain: u64,
    /// Register spill slots used by the domain-switch sequence.
    pub eax_scrap: u64,
    pub edx_scrap: u64,
    pub ecx_scrap: u64,
    /// Saved safe stack pointer while running on the extern stack.
    pub safe_stack_ptr: usize,
    /// Non-zero while the thread executes untrusted code.
    pub unsafe_flag: u64,
}

pub const EXTERN_STACK_PTR_OFFSET: usize = 0;
pub const DOMAIN_OFFSET: usize = 8;
pub const EAX_SCRAP_OFFSET: usize = 16;
pub const EDX_SCRAP_OFFSET: usize = 24;
pub const ECX_SCRAP_OFFSET: usize = 32;
pub const SAFE_STACK_PTR_OFFSET: usize = 40;
pub const UNSAFE_FLAG_OFFSET: usize = 48;

impl DomainDescriptor {
    #[must_use]
    pub const fn new(domain: Domain) -> Self {
        Self {
            extern_stack_ptr: 0,
            domain: domain.raw(),
            eax_scrap: 0,
            edx_scrap: 0,
            ecx_scrap: 0,
            safe_stack_ptr: 0,
            unsafe_flag: 0,
        }
    }

    #[must_use]
    pub const fn domain(&self) -> Domain {
        Domain::from_raw(self.domain)
    }

    pub fn set_domain(&mut self, domain: Domain) {
        self.domain = domain.raw();
    }

    #[must_use]
    pub const fn has_extern_stack(&self) -> bool {
        self.extern_stack_ptr != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn descriptor_offsets_match_instrumentation_contract() {
        assert_eq!(
            offset_of!(DomainDescriptor, extern_stack_ptr),
            EXTERN_STACK_PTR_OFFSET
        );
        assert_eq!(offset_of!(DomainDescriptor, domain), DOMAIN_OFFSET);
        assert_eq!(offset_of!(DomainDescriptor, eax_scrap), EAX_SCRAP_OFFSET);
        assert_eq!(offset_of!(DomainDescriptor, edx_scrap), EDX_SCRAP_OFFSET);
        assert_eq!(offset_of!(DomainDescriptor, ecx_scrap), ECX_SCRAP_OFFSET);
        assert_eq!(
            offset_of!(DomainDescriptor, safe_stack_ptr),
            SAFE_STACK_PTR_OFFSET
        );
        assert_eq!(offset_of!(DomainDescriptor, unsafe_flag), UNSAFE_FLAG_OFFSET);
        assert_eq!(size_of::<DomainDescriptor>(), 56);
    }

    #[test]
    fn backend_selection_is_zero_versus_nonzero() {
        assert_eq!(BackendKind::for_domain(Domain::SAFE), BackendKind::Safe);
        assert_eq!(BackendKind::for_domain(Domain::EXTERN), BackendKind::Unsafe);
        assert_eq!(BackendKind::for_domain(Domain::INTERN), BackendKind::Unsafe);
        assert_eq!(
            BackendKind::for_domain(Domain::from_raw(0x80)),
            BackendKind::Unsafe
        );
    }

    #[test]
    fn flag_byte_maps_to_extern() {
        assert_eq!(Domain::from_flag(0), Domain::SAFE);
        assert_eq!(Domain::from_flag(1), Domain::EXTERN);
        assert_eq!(Domain::from_flag(0xff), Domain::EXTERN);
    }

    #[test]
    fn mixed_domains_form_a_mask() {
        let mixed = Domain::EXTERN.union(Domain::INTERN);
        assert_eq!(mixed.raw(), 3);
        assert!(mixed.includes(Domain::EXTERN));
        assert!(mixed.includes(Domain::INTERN));
        assert!(!Domain::EXTERN.includes(Domain::INTERN));
        assert!(mixed.is_untrusted());
        assert_eq!(mixed.to_string(), "mask(0x3)");
    }

    #[test]
    fn c_int_round_trip_keeps_value() {
        assert_eq!(Domain::from_c_int(2).as_c_int(), 2);
        assert_eq!(Domain::from_c_int(0), Domain::SAFE);
    }

    #[test]
    fn new_descriptor_has_no_extern_stack() {
        let mut desc = DomainDescriptor::new(Domain::INTERN);
        assert_eq!(desc.domain(), Domain::INTERN);
        assert!(!desc.has_extern_stack());
        desc.set_domain(Domain::SAFE);
        assert!(desc.domain().is_safe());
    }
}
