//! CLI entrypoint for the mpkguard scenario harness.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mpkguard_harness::{HarnessError, SCENARIOS, VerdictWriter};

/// Scenario tooling for mpkguard.
#[derive(Debug, Parser)]
#[command(name = "mpkguard-harness")]
#[command(about = "In-process scenario runner for the mpkguard isolation runtime")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the available scenarios.
    List,
    /// Run scenarios and emit one JSONL verdict per scenario.
    Run {
        /// Scenario to run (repeatable); all scenarios when omitted.
        #[arg(long = "scenario")]
        scenarios: Vec<String>,
        /// Output JSONL path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Exit non-zero when any scenario fails.
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::List => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for scenario in SCENARIOS {
                writeln!(out, "{:<24} {}", scenario.name, scenario.summary)?;
            }
        }
        Command::Run {
            scenarios,
            output,
            strict,
        } => {
            let selected = if scenarios.is_empty() {
                SCENARIOS.iter().collect::<Vec<_>>()
            } else {
                scenarios
                    .iter()
                    .map(|name| mpkguard_harness::find(name))
                    .collect::<Result<Vec<_>, _>>()?
            };

            let sink: Box<dyn Write> = match &output {
                Some(path) => Box::new(BufWriter::new(File::create(path)?)),
                None => Box::new(io::stdout().lock()),
            };
            let mut writer = VerdictWriter::new(sink);
            for scenario in selected {
                writer.emit(&scenario.run())?;
            }
            let (total, failed) = writer.tally();
            writer.finish()?;
            if let Some(path) = &output {
                eprintln!("Wrote {total} verdicts to {}", path.display());
            }
            if strict && failed > 0 {
                return Err(HarnessError::Failures { failed, total }.into());
            }
        }
    }

    Ok(())
}
