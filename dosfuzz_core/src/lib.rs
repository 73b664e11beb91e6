pub mod baseline;
pub mod cache;
pub mod config;
pub mod counter;
pub mod executor;
pub mod fuzzer;
pub mod image;
pub mod logging;
pub mod mutator;
pub mod oracle;

pub use baseline::{Baseline, BaselineError, profile_baseline};
pub use cache::{ByteCache, TrialDedupCache};
pub use config::{AnomalyMode, ConfigError, FuzzConfig};
pub use counter::BoundedCounter;
pub use executor::{CommandExecutor, CommandExecutorConfig, ExecutionOutcome, Executor, ExecutorError};
pub use fuzzer::{FuzzError, FuzzSummary, Fuzzer, MinimizationOutcome, MinimizationStatus, SearchSettings};
pub use image::{BinaryImage, Interval, PatchCandidate, Section};
pub use mutator::{ExplorationMutator, MinimizationMutator};
pub use oracle::{AnomalyOracle, AnomalyReport, AnomalyVerdict};
