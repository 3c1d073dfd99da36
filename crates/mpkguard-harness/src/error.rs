//! Errors raised by the harness itself, as opposed to failed scenarios.

use thiserror::Error;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),
    #[error("failed to write verdicts: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode verdict: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{failed} of {total} scenarios failed")]
    Failures { failed: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_summary_names_both_counts() {
        let err = HarnessError::Failures {
            failed: 2,
            total: 7,
        };
        assert_eq!(err.to_string(), "2 of 7 scenarios failed");
    }
}
