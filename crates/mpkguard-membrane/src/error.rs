//! Failure taxonomy for the isolation runtime.
//!
//! Every error here is terminal: the runtime has no degraded mode, so callers
//! that cannot report through a C return value end the process with
//! [`IsolationError::abort`].

use std::fmt::Write as _;

use thiserror::Error;

use crate::diag::{LineBuffer, write_stderr};

pub type IsolationResult<T> = Result<T, IsolationError>;

/// Coarse grouping used in diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Resolution,
    DomainState,
    ResourceExhaustion,
    Bookkeeping,
    Transport,
}

#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("unable to resolve `{symbol}` for the {backend} allocator")]
    AllocatorSymbol {
        symbol: &'static str,
        backend: &'static str,
    },
    #[error("unable to resolve primitive `{0}`")]
    MissingPrimitive(&'static str),
    #[error("unable to initialize domain key (errno {0})")]
    DomainKey(i32),
    #[error("unable to set domain value (errno {0})")]
    DomainStore(i32),
    #[error("Thread has no domain")]
    NoDomain,
    #[error("runtime used by its own bootstrap")]
    ReentrantInit,
    #[error("unable to query thread attributes: {call} failed with {code}")]
    ThreadAttributes { call: &'static str, code: i32 },
    #[error("out of memory allocating {what} ({size} bytes)")]
    OutOfMemory { what: &'static str, size: usize },
    #[error("unable to reserve unsafe region {start:#x}+{len:#x} (errno {errno})")]
    RegionReservation { start: usize, len: usize, errno: i32 },
    #[error("unsafe region placed at {actual:#x} instead of {requested:#x}")]
    RegionMisplaced { requested: usize, actual: usize },
    #[error("{family} allocator placed a block at {addr:#x}, outside the unsafe region")]
    FamilyOutsideRegion { family: &'static str, addr: usize },
    #[error("heap block {addr:#x} is corrupt or already released")]
    CorruptBlock { addr: usize },
    #[error("diagnostic sink {endpoint}: {source}")]
    Transport {
        endpoint: std::net::SocketAddrV4,
        #[source]
        source: std::io::Error,
    },
}

impl IsolationError {
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::AllocatorSymbol { .. } | Self::MissingPrimitive(_) => ErrorCategory::Resolution,
            Self::DomainKey(_)
            | Self::DomainStore(_)
            | Self::NoDomain
            | Self::ReentrantInit
            | Self::ThreadAttributes { .. } => ErrorCategory::DomainState,
            Self::OutOfMemory { .. }
            | Self::RegionReservation { .. }
            | Self::RegionMisplaced { .. }
            | Self::FamilyOutsideRegion { .. } => ErrorCategory::ResourceExhaustion,
            Self::CorruptBlock { .. } => ErrorCategory::Bookkeeping,
            Self::Transport { .. } => ErrorCategory::Transport,
        }
    }

    /// Print a one-line diagnostic and terminate the process.
    pub fn abort(&self) -> ! {
        let mut line = LineBuffer::new();
        let _ = write!(line, "mpkguard: fatal: {self}");
        line.finish_line();
        write_stderr(line.as_bytes());
        // SAFETY: abort(3) never returns and takes no arguments.
        unsafe { libc::abort() }
    }
}

/// Unwrap a runtime-internal result, aborting on failure.
pub trait OrAbort<T> {
    fn or_abort(self) -> T;
}

impl<T> OrAbort<T> for IsolationResult<T> {
    #[inline]
    fn or_abort(self) -> T {
        match self {
            Ok(value) => value,
            Err(err) => err.abort(),
        }
    }
}
