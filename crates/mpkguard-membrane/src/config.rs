//! Runtime configuration.
//!
//! Read once during bootstrap from the environment:
//! - `MPKGUARD_UNSAFE_ALLOCATOR`: `region` (default), `mimalloc`, `tcmalloc`
//!   or `dlmalloc`.
//! - `MPKGUARD_REPORT`: exit report format, `text` (default), `json`, `off`.
//! - `MPKGUARD_LOG`: diagnostic verbosity, `error` (default) through `debug`.
//! - `MPKGUARD_SINK`: `off` (default), `on` for `127.0.0.1:4636`, or an
//!   explicit `ip:port`.
//! - `MPKGUARD_PKRU`: write PKRU on domain changes when the CPU supports it.
//! - `MPKGUARD_REGISTER_MIRROR`: keep the descriptor address in `r15`.
//! - `MPKGUARD_EXTERN_STACK`: extern stack size in bytes (decimal or `0x`).
//!
//! Parsing works on raw bytes so it can run before the allocator is usable.

use std::ffi::{CStr, c_char};
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::backend::SymbolFamily;
use crate::counters::ReportFormat;
use crate::diag::LogLevel;

/// Smallest extern stack handed to a thread, also the default.
pub const DEFAULT_EXTERN_STACK_SIZE: usize = 0x100_0000;

/// Where the diagnostic sink connects when enabled without an address.
pub const DEFAULT_SINK_ENDPOINT: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4636);

pub const ENV_UNSAFE_ALLOCATOR: &CStr = c"MPKGUARD_UNSAFE_ALLOCATOR";
pub const ENV_REPORT: &CStr = c"MPKGUARD_REPORT";
pub const ENV_LOG: &CStr = c"MPKGUARD_LOG";
pub const ENV_SINK: &CStr = c"MPKGUARD_SINK";
pub const ENV_PKRU: &CStr = c"MPKGUARD_PKRU";
pub const ENV_REGISTER_MIRROR: &CStr = c"MPKGUARD_REGISTER_MIRROR";
pub const ENV_EXTERN_STACK: &CStr = c"MPKGUARD_EXTERN_STACK";

/// Which allocator serves untrusted domains.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnsafeAllocator {
    /// The built-in heap inside the reserved region.
    #[default]
    Region,
    /// An allocator family resolved by symbol prefix.
    Family(SymbolFamily),
}

impl UnsafeAllocator {
    /// Parse from bytes (case-insensitive). Unknown values keep the default.
    #[must_use]
    pub fn from_bytes_loose(raw: &[u8]) -> Self {
        let raw = raw.trim_ascii();
        if matches_any(raw, &[b"mimalloc", b"mi", b"mi_"]) {
            Self::Family(SymbolFamily::Mimalloc)
        } else if matches_any(raw, &[b"tcmalloc", b"tc", b"tc_"]) {
            Self::Family(SymbolFamily::Tcmalloc)
        } else if matches_any(raw, &[b"dlmalloc", b"dl", b"dl_"]) {
            Self::Family(SymbolFamily::Dlmalloc)
        } else {
            Self::Region
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub unsafe_allocator: UnsafeAllocator,
    pub report: ReportFormat,
    pub log_level: LogLevel,
    pub sink: Option<SocketAddrV4>,
    pub pkru_writes: bool,
    pub register_mirror: bool,
    pub extern_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            unsafe_allocator: UnsafeAllocator::Region,
            report: ReportFormat::Text,
            log_level: LogLevel::Error,
            sink: None,
            pkru_writes: false,
            register_mirror: cfg!(target_arch = "x86_64"),
            extern_stack_size: DEFAULT_EXTERN_STACK_SIZE,
        }
    }
}

impl RuntimeConfig {
    /// Build a configuration from a variable lookup. Missing or malformed
    /// values fall back to their defaults.
    #[must_use]
    pub fn from_lookup<'a>(lookup: impl Fn(&CStr) -> Option<&'a [u8]>) -> Self {
        let defaults = Self::default();
        Self {
            unsafe_allocator: lookup(ENV_UNSAFE_ALLOCATOR)
                .map(UnsafeAllocator::from_bytes_loose)
                .unwrap_or(defaults.unsafe_allocator),
            report: lookup(ENV_REPORT)
                .map(ReportFormat::from_bytes_loose)
                .unwrap_or(defaults.report),
            log_level: lookup(ENV_LOG)
                .map(LogLevel::from_bytes_loose)
                .unwrap_or(defaults.log_level),
            sink: lookup(ENV_SINK).map_or(defaults.sink, parse_sink),
            pkru_writes: lookup(ENV_PKRU)
                .and_then(parse_bool)
                .unwrap_or(defaults.pkru_writes),
            register_mirror: lookup(ENV_REGISTER_MIRROR)
                .and_then(parse_bool)
                .unwrap_or(defaults.register_mirror),
            extern_stack_size: lookup(ENV_EXTERN_STACK)
                .and_then(parse_size)
                .map_or(defaults.extern_stack_size, |size| {
                    size.max(DEFAULT_EXTERN_STACK_SIZE)
                }),
        }
    }

    /// Read the process environment without allocating.
    #[must_use]
    pub fn from_process_env() -> Self {
        Self::from_lookup(|name| {
            // SAFETY: `name` is NUL-terminated; the environment is not mutated
            // while the runtime bootstraps.
            let value: *const c_char = unsafe { libc::getenv(name.as_ptr()) };
            if value.is_null() {
                None
            } else {
                // SAFETY: getenv returns a NUL-terminated string that lives as
                // long as the environment entry.
                Some(unsafe { CStr::from_ptr(value) }.to_bytes())
            }
        })
    }
}

fn matches_any(raw: &[u8], names: &[&[u8]]) -> bool {
    names.iter().any(|name| raw.eq_ignore_ascii_case(name))
}

fn parse_bool(raw: &[u8]) -> Option<bool> {
    let raw = raw.trim_ascii();
    if matches_any(raw, &[b"1", b"on", b"yes", b"true", b"enabled"]) {
        Some(true)
    } else if matches_any(raw, &[b"0", b"off", b"no", b"false", b"disabled"]) {
        Some(false)
    } else {
        None
    }
}

fn parse_size(raw: &[u8]) -> Option<usize> {
    let text = std::str::from_utf8(raw.trim_ascii()).ok()?;
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_sink(raw: &[u8]) -> Option<SocketAddrV4> {
    match parse_bool(raw) {
        Some(true) => Some(DEFAULT_SINK_ENDPOINT),
        Some(false) => None,
        None => std::str::from_utf8(raw.trim_ascii()).ok()?.parse().ok(),
    }
}
