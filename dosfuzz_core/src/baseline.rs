use crate::executor::{ExecutionOutcome, Executor, ExecutorError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum BaselineError {
    #[error(
        "Baseline run {run} of the unmodified target exited with code {return_code}; the target must exit 0 to be fuzzed"
    )]
    Unstable { run: u32, return_code: i32 },
    #[error("Baseline run failed to execute: {0}")]
    Executor(#[from] ExecutorError),
}

/// Timing of the unmodified target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Baseline {
    pub runs: u32,
    pub longest_execution_ms: u64,
    /// Runs slower than this count as timing anomalies.
    pub expected_execution_ms: u64,
}

/// Runs the unmodified target `runs` times and derives the timing threshold
/// as `longest * variation_multiplier`.
///
/// Any non-zero exit aborts calibration: an unstable target cannot be compared against.
pub fn profile_baseline<E: Executor + ?Sized>(
    executor: &mut E,
    runs: u32,
    variation_multiplier: f64,
) -> Result<Baseline, BaselineError> {
    info!("testing normal execution time with {runs} runs");

    let mut longest_execution_ms = 0;
    for run in 1..=runs {
        let ExecutionOutcome {
            return_code,
            elapsed_ms,
        } = executor.execute_baseline()?;
        debug!(run, return_code, elapsed_ms, "baseline run");

        if return_code != 0 {
            return Err(BaselineError::Unstable { run, return_code });
        }
        longest_execution_ms = longest_execution_ms.max(elapsed_ms);
    }

    let expected_execution_ms = (longest_execution_ms as f64 * variation_multiplier) as u64;
    info!(
        "longest normal execution time: {longest_execution_ms}ms, execution time limit: {expected_execution_ms}ms"
    );

    Ok(Baseline {
        runs,
        longest_execution_ms,
        expected_execution_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct ScriptedBaseline {
        outcomes: VecDeque<ExecutionOutcome>,
        calls: u32,
    }

    impl ScriptedBaseline {
        fn new(outcomes: impl IntoIterator<Item = (i32, u64)>) -> Self {
            Self {
                outcomes: outcomes
                    .into_iter()
                    .map(|(return_code, elapsed_ms)| ExecutionOutcome {
                        return_code,
                        elapsed_ms,
                    })
                    .collect(),
                calls: 0,
            }
        }
    }

    impl Executor for ScriptedBaseline {
        fn execute_baseline(&mut self) -> Result<ExecutionOutcome, ExecutorError> {
            self.calls += 1;
            Ok(self.outcomes.pop_front().expect("script ran out"))
        }

        fn execute_patched(&mut self, _patched: &[u8]) -> Result<ExecutionOutcome, ExecutorError> {
            panic!("baseline must not run patched files");
        }
    }

    #[test]
    fn ten_runs_of_fifty_ms_give_250ms_threshold() {
        let mut executor = ScriptedBaseline::new(std::iter::repeat_n((0, 50), 10));
        let baseline = profile_baseline(&mut executor, 10, 5.0).unwrap();

        assert_eq!(executor.calls, 10);
        assert_eq!(baseline.longest_execution_ms, 50);
        assert_eq!(baseline.expected_execution_ms, 250);
    }

    #[test]
    fn threshold_uses_slowest_run() {
        let mut executor = ScriptedBaseline::new([(0, 10), (0, 40), (0, 20)]);
        let baseline = profile_baseline(&mut executor, 3, 2.5).unwrap();
        assert_eq!(baseline.longest_execution_ms, 40);
        assert_eq!(baseline.expected_execution_ms, 100);
    }

    #[test]
    fn non_zero_exit_aborts_immediately() {
        let mut executor = ScriptedBaseline::new([(0, 10), (3, 10), (0, 10)]);
        let err = profile_baseline(&mut executor, 3, 5.0).unwrap_err();

        assert!(matches!(
            err,
            BaselineError::Unstable {
                run: 2,
                return_code: 3
            }
        ));
        assert_eq!(executor.calls, 2);
    }
}
