//! Instrumentation counters.
//!
//! All counters use relaxed ordering; they are advisory statistics, not
//! synchronization, and only ever increase.

use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::region::ReservedRegion;

/// Process-wide isolation counters.
#[derive(Debug)]
pub struct IsolationCounters {
    /// Heap allocations of either domain.
    pub total_heap: AtomicU64,
    /// Heap allocations served by the unsafe backend.
    pub unsafe_heap: AtomicU64,
    /// Stack objects reported by instrumented functions.
    pub total_allocas: AtomicU64,
    /// Stack objects moved to the extern stack.
    pub unsafe_allocas: AtomicU64,
    /// Loads classified as unsafe by the analysis.
    pub total_unsafe_loads: AtomicU64,
    /// Of those, loads that actually hit safe memory.
    pub safe_loads_in_unsafe: AtomicU64,
    pub total_unsafe_stores: AtomicU64,
    pub safe_stores_in_unsafe: AtomicU64,
    /// Loads classified as safe by the analysis.
    pub total_safe_loads: AtomicU64,
    /// Of those, loads that actually hit the unsafe region.
    pub unsafe_loads_in_safe: AtomicU64,
    pub total_safe_stores: AtomicU64,
    pub unsafe_stores_in_safe: AtomicU64,
    /// Software fault-isolation exceptions raised by generated code.
    pub sfi_exceptions: AtomicU64,
    /// Times the register mirror had to be rewritten from thread-local state.
    pub mirror_resyncs: AtomicU64,
}

impl IsolationCounters {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            total_heap: AtomicU64::new(0),
            unsafe_heap: AtomicU64::new(0),
            total_allocas: AtomicU64::new(0),
            unsafe_allocas: AtomicU64::new(0),
            total_unsafe_loads: AtomicU64::new(0),
            safe_loads_in_unsafe: AtomicU64::new(0),
            total_unsafe_stores: AtomicU64::new(0),
            safe_stores_in_unsafe: AtomicU64::new(0),
            total_safe_loads: AtomicU64::new(0),
            unsafe_loads_in_safe: AtomicU64::new(0),
            total_safe_stores: AtomicU64::new(0),
            unsafe_stores_in_safe: AtomicU64::new(0),
            sfi_exceptions: AtomicU64::new(0),
            mirror_resyncs: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Record `count` heap allocations, `unsafe_side` of them in the unsafe
    /// backend.
    pub fn record_heap(&self, count: u64, unsafe_side: bool) {
        Self::add(&self.total_heap, count);
        if unsafe_side {
            Self::add(&self.unsafe_heap, count);
        }
    }

    /// An access classified unsafe loaded from `addr`.
    pub fn check_load_false_positive(&self, region: &ReservedRegion, addr: usize) {
        if !region.contains(addr) {
            Self::inc(&self.safe_loads_in_unsafe);
        }
        Self::inc(&self.total_unsafe_loads);
    }

    /// An access classified unsafe stored to `addr`.
    pub fn check_store_false_positive(&self, region: &ReservedRegion, addr: usize) {
        if !region.contains(addr) {
            Self::inc(&self.safe_stores_in_unsafe);
        }
        Self::inc(&self.total_unsafe_stores);
    }

    /// An access classified safe loaded from `addr`.
    pub fn check_load_false_negative(&self, region: &ReservedRegion, addr: usize) {
        if region.contains(addr) {
            Self::inc(&self.unsafe_loads_in_safe);
        }
        Self::inc(&self.total_safe_loads);
    }

    /// An access classified safe stored to `addr`.
    pub fn check_store_false_negative(&self, region: &ReservedRegion, addr: usize) {
        if region.contains(addr) {
            Self::inc(&self.unsafe_stores_in_safe);
        }
        Self::inc(&self.total_safe_stores);
    }

    pub fn count_allocas(&self, total: u64, unsafe_count: u64) {
        Self::add(&self.total_allocas, total);
        Self::add(&self.unsafe_allocas, unsafe_count);
    }

    pub fn sfi_exception(&self) {
        Self::inc(&self.sfi_exceptions);
    }

    #[must_use]
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            total_heap: Self::get(&self.total_heap),
            unsafe_heap: Self::get(&self.unsafe_heap),
            total_allocas: Self::get(&self.total_allocas),
            unsafe_allocas: Self::get(&self.unsafe_allocas),
            total_unsafe_loads: Self::get(&self.total_unsafe_loads),
            safe_loads_in_unsafe: Self::get(&self.safe_loads_in_unsafe),
            total_unsafe_stores: Self::get(&self.total_unsafe_stores),
            safe_stores_in_unsafe: Self::get(&self.safe_stores_in_unsafe),
            total_safe_loads: Self::get(&self.total_safe_loads),
            unsafe_loads_in_safe: Self::get(&self.unsafe_loads_in_safe),
            total_safe_stores: Self::get(&self.total_safe_stores),
            unsafe_stores_in_safe: Self::get(&self.unsafe_stores_in_safe),
            sfi_exceptions: Self::get(&self.sfi_exceptions),
            mirror_resyncs: Self::get(&self.mirror_resyncs),
        }
    }
}

impl Default for IsolationCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountersSnapshot {
    pub total_heap: u64,
    pub unsafe_heap: u64,
    pub total_allocas: u64,
    pub unsafe_allocas: u64,
    pub total_unsafe_loads: u64,
    pub safe_loads_in_unsafe: u64,
    pub total_unsafe_stores: u64,
    pub safe_stores_in_unsafe: u64,
    pub total_safe_loads: u64,
    pub unsafe_loads_in_safe: u64,
    pub total_safe_stores: u64,
    pub unsafe_stores_in_safe: u64,
    pub sfi_exceptions: u64,
    pub mirror_resyncs: u64,
}

/// Exit-report output format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
    Off,
}

impl ReportFormat {
    /// Parse from bytes (case-insensitive). Unknown values keep the default.
    #[must_use]
    pub fn from_bytes_loose(raw: &[u8]) -> Self {
        let raw = raw.trim_ascii();
        if raw.eq_ignore_ascii_case(b"json") || raw.eq_ignore_ascii_case(b"jsonl") {
            Self::Json
        } else if raw.eq_ignore_ascii_case(b"off")
            || raw.eq_ignore_ascii_case(b"none")
            || raw == b"0"
        {
            Self::Off
        } else {
            Self::Text
        }
    }
}

impl CountersSnapshot {
    /// Report lines in their fixed order.
    #[must_use]
    pub fn report_lines(&self) -> [(&'static str, u64); 13] {
        [
            ("Total heap", self.total_heap),
            ("Unsafe Heap", self.unsafe_heap),
            ("Total Stack", self.total_allocas),
            ("Unsafe Stack", self.unsafe_allocas),
            ("Total Unsafe Read", self.total_unsafe_loads),
            ("Safe Read In Unsafe", self.safe_loads_in_unsafe),
            ("Total Unsafe Write", self.total_unsafe_stores),
            ("Safe Write In Unsafe", self.safe_stores_in_unsafe),
            ("Total Safe Read", self.total_safe_loads),
            ("Unsafe Read In Safe", self.unsafe_loads_in_safe),
            ("Total Safe Write", self.total_safe_stores),
            ("Unsafe Write In Safe", self.unsafe_stores_in_safe),
            ("SFI Exceptions", self.sfi_exceptions),
        ]
    }

    pub fn write_text(&self, out: &mut impl Write) -> io::Result<()> {
        for (label, value) in self.report_lines() {
            writeln!(out, "{label}: {value}")?;
        }
        Ok(())
    }

    pub fn write_json(&self, out: &mut impl Write) -> io::Result<()> {
        serde_json::to_writer(&mut *out, self).map_err(io::Error::other)?;
        writeln!(out)
    }

    pub fn write_report(&self, format: ReportFormat, out: &mut impl Write) -> io::Result<()> {
        match format {
            ReportFormat::Text => self.write_text(out),
            ReportFormat::Json => self.write_json(out),
            ReportFormat::Off => Ok(()),
        }
    }
}

static GLOBAL_COUNTERS: IsolationCounters = IsolationCounters::new();

/// The process-wide counters.
#[must_use]
pub fn global_counters() -> &'static IsolationCounters {
    &GLOBAL_COUNTERS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::UNSAFE_REGION;

    const INSIDE: usize = 0x5100_0000_1000;
    const OUTSIDE: usize = 0x7f00_0000_1000;

    #[test]
    fn false_positive_checks_count_safe_addresses() {
        let counters = IsolationCounters::new();
        counters.check_load_false_positive(&UNSAFE_REGION, OUTSIDE);
        counters.check_load_false_positive(&UNSAFE_REGION, INSIDE);
        counters.check_store_false_positive(&UNSAFE_REGION, OUTSIDE);
        let snap = counters.snapshot();
        assert_eq!(snap.total_unsafe_loads, 2);
        assert_eq!(snap.safe_loads_in_unsafe, 1);
        assert_eq!(snap.total_unsafe_stores, 1);
        assert_eq!(snap.safe_stores_in_unsafe, 1);
    }

    #[test]
    fn false_negative_checks_count_region_addresses() {
        let counters = IsolationCounters::new();
        counters.check_load_false_negative(&UNSAFE_REGION, INSIDE);
        counters.check_store_false_negative(&UNSAFE_REGION, OUTSIDE);
        counters.check_store_false_negative(&UNSAFE_REGION, INSIDE);
        let snap = counters.snapshot();
        assert_eq!(snap.total_safe_loads, 1);
        assert_eq!(snap.unsafe_loads_in_safe, 1);
        assert_eq!(snap.total_safe_stores, 2);
        assert_eq!(snap.unsafe_stores_in_safe, 1);
    }

    #[test]
    fn heap_and_alloca_accounting() {
        let counters = IsolationCounters::new();
        counters.record_heap(1, false);
        counters.record_heap(4, true);
        counters.count_allocas(5, 2);
        counters.sfi_exception();
        let snap = counters.snapshot();
        assert_eq!(snap.total_heap, 5);
        assert_eq!(snap.unsafe_heap, 4);
        assert_eq!(snap.total_allocas, 5);
        assert_eq!(snap.unsafe_allocas, 2);
        assert_eq!(snap.sfi_exceptions, 1);
    }

    #[test]
    fn text_report_keeps_line_order() {
        let snap = CountersSnapshot {
            total_heap: 7,
            unsafe_heap: 3,
            ..CountersSnapshot::default()
        };
        let mut out = Vec::new();
        snap.write_text(&mut out).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Total heap: 7");
        assert_eq!(lines[1], "Unsafe Heap: 3");
        assert_eq!(lines[2], "Total Stack: 0");
        assert_eq!(lines[11], "Unsafe Write In Safe: 0");
        assert_eq!(lines.len(), 13);
    }

    #[test]
    fn json_report_is_one_object() {
        let snap = CountersSnapshot {
            unsafe_loads_in_safe: 9,
            ..CountersSnapshot::default()
        };
        let mut out = Vec::new();
        snap.write_report(ReportFormat::Json, &mut out).expect("write");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["unsafe_loads_in_safe"], 9);
        assert_eq!(value["total_heap"], 0);

        let mut silent = Vec::new();
        snap.write_report(ReportFormat::Off, &mut silent).expect("write");
        assert!(silent.is_empty());
    }

    #[test]
    fn parse_report_formats() {
        assert_eq!(ReportFormat::from_bytes_loose(b"JSON"), ReportFormat::Json);
        assert_eq!(ReportFormat::from_bytes_loose(b"off"), ReportFormat::Off);
        assert_eq!(ReportFormat::from_bytes_loose(b"text"), ReportFormat::Text);
        assert_eq!(ReportFormat::from_bytes_loose(b"???"), ReportFormat::Text);
    }
}
