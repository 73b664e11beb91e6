use crate::config::AnomalyMode;
use crate::executor::ExecutionOutcome;
use crate::image::{Interval, PatchCandidate};
use serde::Serialize;
use std::fmt;

/// Which anomaly flags one execution raised. The flags are independent;
/// whether they count depends on the active [`AnomalyMode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AnomalyVerdict {
    pub timing_anomaly: bool,
    pub return_code_anomaly: bool,
}

impl AnomalyVerdict {
    pub fn any(&self) -> bool {
        self.timing_anomaly || self.return_code_anomaly
    }

    /// True if this verdict counts as a hit under `mode`.
    pub fn is_hit(&self, mode: AnomalyMode) -> bool {
        match mode {
            AnomalyMode::Continuous => self.any(),
            AnomalyMode::ReturnCode => self.return_code_anomaly,
            AnomalyMode::Time => self.timing_anomaly,
        }
    }
}

/// Compares execution outcomes against the calibrated baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnomalyOracle {
    expected_execution_ms: u64,
    ignored_return_codes: Vec<i32>,
}

impl AnomalyOracle {
    pub fn new(expected_execution_ms: u64, ignored_return_codes: Vec<i32>) -> Self {
        Self {
            expected_execution_ms,
            ignored_return_codes,
        }
    }

    pub fn classify(&self, outcome: &ExecutionOutcome) -> AnomalyVerdict {
        classify(
            outcome,
            self.expected_execution_ms,
            &self.ignored_return_codes,
        )
    }
}

/// Exit codes listed in `ignored_return_codes` are treated as expected.
pub fn classify(
    outcome: &ExecutionOutcome,
    expected_execution_ms: u64,
    ignored_return_codes: &[i32],
) -> AnomalyVerdict {
    AnomalyVerdict {
        timing_anomaly: outcome.elapsed_ms > expected_execution_ms,
        return_code_anomaly: outcome.return_code != 0
            && !ignored_return_codes.contains(&outcome.return_code),
    }
}

/// A patch that provoked an anomaly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnomalyReport {
    pub interval: Interval,
    pub bytes: Vec<u8>,
    pub outcome: ExecutionOutcome,
    pub verdict: AnomalyVerdict,
}

impl AnomalyReport {
    pub fn new(candidate: &PatchCandidate, outcome: ExecutionOutcome, verdict: AnomalyVerdict) -> Self {
        Self {
            interval: candidate.interval,
            bytes: candidate.bytes.clone(),
            outcome,
            verdict,
        }
    }

    /// `ret`, `time (<ms>ms)`, or both.
    pub fn tag(&self) -> String {
        let mut parts = Vec::with_capacity(2);
        if self.verdict.return_code_anomaly {
            parts.push("ret".to_string());
        }
        if self.verdict.timing_anomaly {
            parts.push(format!("time ({}ms)", self.outcome.elapsed_ms));
        }
        parts.join(", ")
    }
}

impl fmt::Display for AnomalyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} | {:<16} |", self.interval.start, self.tag())?;
        for byte in &self.bytes {
            write!(f, " {byte:02x}")?;
        }
        Ok(())
    }
}
