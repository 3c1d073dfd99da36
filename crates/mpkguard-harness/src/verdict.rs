//! JSONL verdict records.

use std::io::Write;
use std::time::Instant;

use mpkguard_membrane::CountersSnapshot;
use serde::{Deserialize, Serialize};

use crate::error::HarnessResult;

/// Scenario outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
}

/// One line of harness output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub scenario: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_us: u64,
    /// Counters after the scenario ran.
    pub counters: CountersSnapshot,
}

impl Verdict {
    #[must_use]
    pub fn new(scenario: &str, result: Result<(), String>, started: Instant) -> Self {
        let (outcome, detail) = match result {
            Ok(()) => (Outcome::Pass, None),
            Err(detail) => (Outcome::Fail, Some(detail)),
        };
        Self {
            scenario: scenario.to_owned(),
            outcome,
            detail,
            duration_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
            counters: mpkguard_membrane::global_counters().snapshot(),
        }
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.outcome == Outcome::Pass
    }
}

/// Writes verdicts as JSON lines.
pub struct VerdictWriter<W: Write> {
    out: W,
    written: usize,
    failed: usize,
}

impl<W: Write> VerdictWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            written: 0,
            failed: 0,
        }
    }

    pub fn emit(&mut self, verdict: &Verdict) -> HarnessResult<()> {
        serde_json::to_writer(&mut self.out, verdict)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        if !verdict.passed() {
            self.failed += 1;
        }
        Ok(())
    }

    /// `(written, failed)` so far.
    #[must_use]
    pub fn tally(&self) -> (usize, usize) {
        (self.written, self.failed)
    }

    pub fn finish(mut self) -> HarnessResult<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}
