use crate::baseline::{Baseline, BaselineError, profile_baseline};
use crate::cache::{ByteCache, TrialDedupCache};
use crate::config::{AnomalyMode, FuzzConfig, MinimizerSettings};
use crate::counter::BoundedCounter;
use crate::executor::{ExecutionOutcome, Executor, ExecutorError};
use crate::image::{BinaryImage, Interval, PatchCandidate, Section};
use crate::mutator::{ExplorationMutator, MinimizationMutator, sample_subinterval};
use crate::oracle::{AnomalyOracle, AnomalyReport, AnomalyVerdict};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Executions between progress log lines.
pub const PROGRESS_INTERVAL: u64 = 1_000;

#[derive(Error, Debug)]
pub enum FuzzError {
    #[error("The binary file is empty")]
    EmptyImage,
    #[error("Section size must be greater than zero")]
    EmptySection,
    #[error(
        "Section {address:#x}+{size:#x} goes outside the bounds of the binary file ({image_len} bytes)"
    )]
    SectionOutOfBounds {
        address: u64,
        size: u64,
        image_len: usize,
    },
    #[error(transparent)]
    Baseline(#[from] BaselineError),
    #[error("Trial execution failed: {0}")]
    Executor(#[from] ExecutorError),
    #[error("Fuzzer used before the baseline was calibrated")]
    NotCalibrated,
}

/// Knobs for one search run.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub mode: AnomalyMode,
    /// 0 derives a seed from the clock.
    pub seed: u64,
    pub max_bytes_to_change: u64,
    /// Caps the exploration loop; `None` runs until a hit (or forever in continuous mode).
    pub max_iterations: Option<u64>,
    pub baseline_runs: u32,
    pub variation_multiplier: f64,
    pub ignored_return_codes: Vec<i32>,
    pub minimizer: MinimizerSettings,
}

impl SearchSettings {
    pub fn from_config(config: &FuzzConfig) -> Self {
        Self {
            mode: config.fuzzer.mode,
            seed: config.fuzzer.seed,
            max_bytes_to_change: config.fuzzer.max_bytes_to_change,
            max_iterations: config.fuzzer.max_iterations,
            baseline_runs: config.baseline.runs,
            variation_multiplier: config.baseline.variation_multiplier,
            ignored_return_codes: config.oracle.ignored_return_codes.clone(),
            minimizer: config.minimizer,
        }
    }
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self::from_config(&FuzzConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MinimizationStatus {
    /// Narrowing reached a single byte on its own.
    Converged,
    /// The exhaustive pass found a single byte inside the 2-byte interval.
    ResolvedSingleByte,
    /// Neither byte of the 2-byte interval reproduces alone.
    PairUnresolved,
    /// Backoff limits were hit; `best` is the narrowest confirmed patch.
    GaveUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MinimizationOutcome {
    pub status: MinimizationStatus,
    pub best: AnomalyReport,
    pub trials: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FuzzSummary {
    pub seed: u64,
    pub mode: AnomalyMode,
    pub baseline: Option<Baseline>,
    pub executions: u64,
    pub findings: Vec<AnomalyReport>,
    pub minimization: Option<MinimizationOutcome>,
}

impl FuzzSummary {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Backoff state for minimization. Each counter tracks one failure kind.
///
/// Only `patch_bytes_skip` ends minimization. Reaching the `single_byte_skip`
/// limit raises the minimum proposal width to 2 instead of stopping, and the
/// 2-byte resolver still covers single bytes afterwards.
#[derive(Debug)]
struct GiveUpPolicy {
    patch_bytes_skip: BoundedCounter,
    single_byte_skip: BoundedCounter,
}

impl GiveUpPolicy {
    fn new(settings: &MinimizerSettings) -> Self {
        Self {
            patch_bytes_skip: BoundedCounter::new(settings.patch_bytes_skip_limit),
            single_byte_skip: BoundedCounter::new(settings.single_byte_skip_limit),
        }
    }

    fn use_cache(&self) -> bool {
        !self.patch_bytes_skip.has_incremented()
    }

    fn min_width(&self) -> u64 {
        if self.single_byte_skip.is_at_limit() { 2 } else { 1 }
    }

    fn record_exhaustion(&mut self, width: u64) {
        if width > 1 {
            self.patch_bytes_skip.increment();
            warn!(
                width,
                count = self.patch_bytes_skip.value(),
                "no untried byte strings left; disabling cached bytes"
            );
        } else {
            self.single_byte_skip.increment();
            warn!(
                count = self.single_byte_skip.value(),
                "single-byte interval exhausted"
            );
        }
    }

    fn should_give_up(&self) -> bool {
        self.patch_bytes_skip.is_at_limit()
    }
}

/// Nudges the search bounds around a new winner: an edge that did not move
/// widens by one byte, clamped to the section.
fn nudge_bounds(previous: Interval, winner: Interval, section: Interval) -> Interval {
    let start = if winner.start == previous.start {
        winner.start.saturating_sub(1).max(section.start)
    } else {
        winner.start
    };
    let end = if winner.end == previous.end {
        winner.end.saturating_add(1).min(section.end)
    } else {
        winner.end
    };
    Interval::new(start, end)
}

fn resolve_seed(seed: u64) -> u64 {
    if seed != 0 {
        return seed;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
        .max(1)
}

type FindingHook = Box<dyn FnMut(&AnomalyReport)>;

/// Drives calibration, exploration, minimization and the 2-byte resolver.
///
/// Trials run one at a time: the target reads a single patched file, which
/// must be fully written before each run.
pub struct Fuzzer<E: Executor> {
    image: BinaryImage,
    section: Section,
    executor: E,
    settings: SearchSettings,
    seed: u64,
    rng: ChaCha8Rng,
    explorer: ExplorationMutator,
    minimizer: MinimizationMutator,
    byte_cache: ByteCache,
    dedup: TrialDedupCache,
    baseline: Option<Baseline>,
    oracle: Option<AnomalyOracle>,
    executions: u64,
    findings: Vec<AnomalyReport>,
    on_finding: FindingHook,
}

impl<E: Executor> Fuzzer<E> {
    pub fn new(
        image: BinaryImage,
        section: Section,
        executor: E,
        settings: SearchSettings,
    ) -> Result<Self, FuzzError> {
        if image.is_empty() {
            return Err(FuzzError::EmptyImage);
        }
        if section.size == 0 {
            return Err(FuzzError::EmptySection);
        }
        if !section.fits_within(image.len()) {
            return Err(FuzzError::SectionOutOfBounds {
                address: section.address,
                size: section.size,
                image_len: image.len(),
            });
        }

        let seed = resolve_seed(settings.seed);
        Ok(Self {
            explorer: ExplorationMutator::new(section, settings.max_bytes_to_change),
            minimizer: MinimizationMutator::new(
                settings.max_bytes_to_change,
                settings.minimizer.dedup_attempt_limit,
            ),
            image,
            section,
            executor,
            settings,
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            byte_cache: ByteCache::new(),
            dedup: TrialDedupCache::new(),
            baseline: None,
            oracle: None,
            executions: 0,
            findings: Vec::new(),
            on_finding: Box::new(|report| eprintln!("{report}")),
        })
    }

    /// Replaces the default hook, which prints each finding to stderr.
    pub fn with_finding_hook(mut self, hook: impl FnMut(&AnomalyReport) + 'static) -> Self {
        self.on_finding = Box::new(hook);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn findings(&self) -> &[AnomalyReport] {
        &self.findings
    }

    pub fn byte_cache(&self) -> &ByteCache {
        &self.byte_cache
    }

    pub fn dedup_cache(&self) -> &TrialDedupCache {
        &self.dedup
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Measures the unmodified target and sets the timing threshold.
    pub fn calibrate(&mut self) -> Result<Baseline, FuzzError> {
        let baseline = profile_baseline(
            &mut self.executor,
            self.settings.baseline_runs,
            self.settings.variation_multiplier,
        )?;
        self.executor
            .set_hang_threshold(Duration::from_millis(baseline.expected_execution_ms));
        self.oracle = Some(AnomalyOracle::new(
            baseline.expected_execution_ms,
            self.settings.ignored_return_codes.clone(),
        ));
        self.baseline = Some(baseline);
        Ok(baseline)
    }

    /// Calibrates if needed, explores, and minimizes the first hit.
    pub fn run(&mut self) -> Result<FuzzSummary, FuzzError> {
        if self.baseline.is_none() {
            self.calibrate()?;
        }
        info!(seed = self.seed, mode = self.settings.mode.as_str(), "starting search");

        let minimization = match self.explore()? {
            Some(hit) => {
                info!(
                    "{} was encountered; looking for the minimal change that reproduces it",
                    match self.settings.mode {
                        AnomalyMode::Time => "long execution time",
                        _ => "non-zero exit code",
                    }
                );
                Some(self.minimize(hit)?)
            }
            None => None,
        };

        Ok(FuzzSummary {
            seed: self.seed,
            mode: self.settings.mode,
            baseline: self.baseline,
            executions: self.executions,
            findings: self.findings.clone(),
            minimization,
        })
    }

    /// Tries random patches until one counts as a hit under the active mode.
    ///
    /// Every anomaly is reported. In continuous mode nothing stops the loop
    /// except `max_iterations`, and `None` is returned.
    pub fn explore(&mut self) -> Result<Option<AnomalyReport>, FuzzError> {
        info!(
            "fuzzing the binary section at {:#x} ({:#x} bytes)",
            self.section.address, self.section.size
        );
        let mut iteration: u64 = 0;
        loop {
            if self
                .settings
                .max_iterations
                .is_some_and(|max| iteration >= max)
            {
                info!(iteration, "exploration iteration limit reached");
                return Ok(None);
            }
            iteration += 1;

            let candidate = self.explorer.mutate(&mut self.rng);
            let (outcome, verdict) = self.trial(&candidate)?;
            if !verdict.any() {
                continue;
            }

            let report = AnomalyReport::new(&candidate, outcome, verdict);
            self.emit(&report);

            if self.settings.mode != AnomalyMode::Continuous && verdict.is_hit(self.settings.mode)
            {
                self.byte_cache.record_hit(&candidate);
                return Ok(Some(report));
            }
        }
    }

    /// Narrows `hit` down to the smallest interval that still reproduces it.
    pub fn minimize(&mut self, hit: AnomalyReport) -> Result<MinimizationOutcome, FuzzError> {
        let section = self.section.interval();
        let mut policy = GiveUpPolicy::new(&self.settings.minimizer);
        let mut bounds = hit.interval;
        let mut best = hit;
        let mut trials: u64 = 0;

        while best.interval.width() > 2 {
            debug_assert!(bounds.contains_interval(&best.interval));
            // Bounds always hold `best`, which is wider than the minimum width,
            // so `None` only follows a broken bounds update.
            let Some(interval) = sample_subinterval(
                bounds,
                best.interval.width(),
                policy.min_width(),
                &mut self.rng,
            ) else {
                warn!("could not find further reductions");
                return Ok(MinimizationOutcome {
                    status: MinimizationStatus::GaveUp,
                    best,
                    trials,
                });
            };

            let Some(candidate) = self.minimizer.propose(
                interval,
                &self.byte_cache,
                &mut self.dedup,
                policy.use_cache(),
                &mut self.rng,
            ) else {
                policy.record_exhaustion(interval.width());
                if policy.should_give_up() {
                    warn!("could not find further reductions");
                    return Ok(MinimizationOutcome {
                        status: MinimizationStatus::GaveUp,
                        best,
                        trials,
                    });
                }
                continue;
            };

            trials += 1;
            let (outcome, verdict) = self.trial(&candidate)?;
            if !verdict.is_hit(self.settings.mode) {
                continue;
            }

            let report = AnomalyReport::new(&candidate, outcome, verdict);
            self.emit(&report);
            self.byte_cache.record_hit(&candidate);

            bounds = if candidate.width() <= 2 {
                candidate.interval
            } else {
                nudge_bounds(bounds, candidate.interval, section)
            };
            info!(width = candidate.width(), "search area: {bounds}");
            best = report;
        }

        if best.interval.width() < 2 {
            return Ok(MinimizationOutcome {
                status: MinimizationStatus::Converged,
                best,
                trials,
            });
        }

        let pair = best.interval;
        let before = self.executions;
        let resolved = self.resolve_pair(pair)?;
        trials += self.executions - before;
        Ok(match resolved {
            Some(single) => MinimizationOutcome {
                status: MinimizationStatus::ResolvedSingleByte,
                best: single,
                trials,
            },
            None => {
                info!("no single byte reproduces alone; minimal patch stays {pair}");
                MinimizationOutcome {
                    status: MinimizationStatus::PairUnresolved,
                    best,
                    trials,
                }
            }
        })
    }

    /// Tries every value at each address of `pair` in turn, skipping values
    /// already tried there, and stops at the first hit.
    pub fn resolve_pair(&mut self, pair: Interval) -> Result<Option<AnomalyReport>, FuzzError> {
        info!("trying every byte value inside {pair}");
        for address in pair.addresses() {
            let interval = Interval::single(address);
            for value in 0..=u8::MAX {
                if !self.dedup.insert(interval, &[value]) {
                    continue;
                }
                let candidate = PatchCandidate::new(interval, vec![value]);
                let (outcome, verdict) = self.trial(&candidate)?;
                if verdict.is_hit(self.settings.mode) {
                    let report = AnomalyReport::new(&candidate, outcome, verdict);
                    self.emit(&report);
                    self.byte_cache.record_hit(&candidate);
                    return Ok(Some(report));
                }
            }
        }
        Ok(None)
    }

    fn trial(
        &mut self,
        candidate: &PatchCandidate,
    ) -> Result<(ExecutionOutcome, AnomalyVerdict), FuzzError> {
        let oracle = self.oracle.as_ref().ok_or(FuzzError::NotCalibrated)?;
        let patched = candidate.apply(&self.image);
        let outcome = self.executor.execute_patched(&patched)?;
        let verdict = oracle.classify(&outcome);
        self.executions += 1;

        debug!(
            interval = %candidate.interval,
            return_code = outcome.return_code,
            elapsed_ms = outcome.elapsed_ms,
            "trial"
        );
        if self.executions % PROGRESS_INTERVAL == 0 {
            info!(
                executions = self.executions,
                findings = self.findings.len(),
                "progress"
            );
        }
        Ok((outcome, verdict))
    }

    fn emit(&mut self, report: &AnomalyReport) {
        (self.on_finding)(report);
        self.findings.push(report.clone());
    }
}
