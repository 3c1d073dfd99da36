//! Scenario runner for the mpkguard isolation runtime.
//!
//! This crate provides:
//! - Scenarios: in-process checks of routing, thread inheritance, counters
//!   and initialization against a live runtime
//! - Verdicts: one JSONL record per scenario, written to a file or stdout

pub mod error;
pub mod scenarios;
pub mod verdict;

pub use error::{HarnessError, HarnessResult};
pub use scenarios::{SCENARIOS, Scenario, find, run_all};
pub use verdict::{Outcome, Verdict, VerdictWriter};
