//! Leveled one-line diagnostics on stderr.
//!
//! Lines are formatted into a fixed stack buffer and written with a raw
//! `write(2)`, so this is usable from inside the allocator entry points and
//! before the runtime has finished bootstrapping.

use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU8, Ordering};

/// Diagnostic verbosity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    Off = 0,
    #[default]
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl LogLevel {
    /// Parse from bytes (case-insensitive). Unknown values keep the default.
    #[must_use]
    pub fn from_bytes_loose(raw: &[u8]) -> Self {
        let raw = raw.trim_ascii();
        if raw.eq_ignore_ascii_case(b"off") || raw.eq_ignore_ascii_case(b"none") || raw == b"0" {
            Self::Off
        } else if raw.eq_ignore_ascii_case(b"warn") || raw.eq_ignore_ascii_case(b"warning") {
            Self::Warn
        } else if raw.eq_ignore_ascii_case(b"info") {
            Self::Info
        } else if raw.eq_ignore_ascii_case(b"debug")
            || raw.eq_ignore_ascii_case(b"trace")
            || raw.eq_ignore_ascii_case(b"all")
        {
            Self::Debug
        } else {
            Self::Error
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Off,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            _ => Self::Debug,
        }
    }

    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Error as u8);

pub fn set_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

#[must_use]
pub fn level() -> LogLevel {
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

#[inline]
#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= self::level()
}

const LINE_CAPACITY: usize = 256;

/// Fixed-capacity line buffer; output past the capacity is dropped.
pub struct LineBuffer {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Terminate the line, overwriting the last byte when the buffer is full.
    pub fn finish_line(&mut self) {
        if self.len == LINE_CAPACITY {
            self.buf[LINE_CAPACITY - 1] = b'\n';
        } else {
            self.buf[self.len] = b'\n';
            self.len += 1;
        }
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

/// Write raw bytes to fd 2, retrying short writes.
pub fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: `bytes` is a live slice; fd 2 may be closed, which only yields an error.
        let written =
            unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

/// Format and emit one diagnostic line if `level` is enabled.
pub fn emit(level: LogLevel, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let mut line = LineBuffer::new();
    let _ = write!(line, "mpkguard[{}]: ", level.tag());
    let _ = line.write_fmt(args);
    line.finish_line();
    write_stderr(line.as_bytes());
}

/// `diag!(LogLevel::Info, "format", args...)`
#[macro_export]
macro_rules! diag {
    ($level:expr, $($arg:tt)*) => {
        $crate::diag::emit($level, format_args!($($arg)*))
    };
}
