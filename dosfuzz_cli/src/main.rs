use dosfuzz_core::config::{AnomalyMode, FuzzConfig};
use dosfuzz_core::executor::{CommandExecutor, CommandExecutorConfig};
use dosfuzz_core::fuzzer::{FuzzSummary, Fuzzer, MinimizationStatus, SearchSettings};
use dosfuzz_core::image::{BinaryImage, Section};
use dosfuzz_core::logging;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_CONFIG_PATH: &str = "dosfuzz.toml";

/// Flips random bytes inside a section of a file, reruns a command against
/// the patched copy, and shrinks any patch that breaks it.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Command to run; %c is replaced with the path of the file under test
    #[clap(short, long)]
    cmd: Option<String>,
    /// File to fuzz; patched copies are written to <file>.patched
    #[clap(short, long)]
    file: Option<PathBuf>,
    /// Start of the section to fuzz, in hex
    #[clap(short, long)]
    addr: Option<String>,
    /// Size of the section to fuzz, in hex
    #[clap(short, long)]
    size: Option<String>,
    /// Stop at the first non-zero exit code and minimize it
    #[clap(short, long, conflicts_with = "time")]
    ret: bool,
    /// Stop at the first abnormally long run and minimize it
    #[clap(short, long)]
    time: bool,
    /// Multiplier applied to the slowest baseline run
    #[clap(short = 'v', long = "exec-time-variation")]
    exec_time_variation: Option<f64>,
    /// Most bytes changed by one exploratory patch
    #[clap(short = 'b', long)]
    max_bytes_to_change: Option<u64>,
    /// Number of baseline runs
    #[clap(short = 'n', long)]
    test_runs: Option<u32>,
    /// RNG seed; 0 derives one from the clock
    #[clap(long)]
    seed: Option<u64>,
    /// Exit code to treat as normal (repeatable)
    #[clap(short = 'i', long = "ignore-code", allow_negative_numbers = true)]
    ignore_codes: Vec<i32>,
    /// Stop exploring after this many patches
    #[clap(long)]
    max_iterations: Option<u64>,
    /// TOML config file
    #[clap(long)]
    config: Option<PathBuf>,
    /// Write a JSON run summary here
    #[clap(long)]
    summary: Option<PathBuf>,
    /// Log every trial
    #[clap(long)]
    verbose: bool,
}

fn parse_hex(field: &str, value: &str) -> anyhow::Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u64::from_str_radix(digits, 16)
        .with_context(|| format!("{field} is not a valid hex number: {value:?}"))
}

fn load_config(config_path: Option<&PathBuf>) -> anyhow::Result<FuzzConfig> {
    match config_path {
        Some(path) => {
            info!("loading configuration from {path:?}");
            FuzzConfig::load_from_file(path)
        }
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                info!("no config file specified, loading default: {default_path:?}");
                FuzzConfig::load_from_file(&default_path)
            } else {
                Ok(FuzzConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut FuzzConfig, cli: &Cli) -> anyhow::Result<()> {
    if let Some(cmd) = &cli.cmd {
        config.target.command = Some(cmd.clone());
    }
    if let Some(file) = &cli.file {
        config.target.file = Some(file.clone());
    }
    if let Some(addr) = &cli.addr {
        config.section.address = Some(parse_hex("section address", addr)?);
    }
    if let Some(size) = &cli.size {
        config.section.size = Some(parse_hex("section size", size)?);
    }
    if cli.ret {
        config.fuzzer.mode = AnomalyMode::ReturnCode;
    } else if cli.time {
        config.fuzzer.mode = AnomalyMode::Time;
    }
    if let Some(multiplier) = cli.exec_time_variation {
        config.baseline.variation_multiplier = multiplier;
    }
    if let Some(max_bytes) = cli.max_bytes_to_change {
        config.fuzzer.max_bytes_to_change = max_bytes;
    }
    if let Some(runs) = cli.test_runs {
        config.baseline.runs = runs;
    }
    if let Some(seed) = cli.seed {
        config.fuzzer.seed = seed;
    }
    if !cli.ignore_codes.is_empty() {
        config.oracle.ignored_return_codes = cli.ignore_codes.clone();
    }
    if let Some(max_iterations) = cli.max_iterations {
        config.fuzzer.max_iterations = Some(max_iterations);
    }
    Ok(())
}

fn run(config: &FuzzConfig) -> anyhow::Result<FuzzSummary> {
    let command = config
        .target
        .command
        .as_deref()
        .context("no command configured")?;
    let file: &Path = config.target.file.as_deref().context("no file configured")?;
    let section = Section::new(
        config.section.address.context("no section address configured")?,
        config.section.size.context("no section size configured")?,
    );

    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {file:?}"))?;

    let exec_config = CommandExecutorConfig::from_template(
        command,
        file,
        Duration::from_millis(config.executor.hang_report_interval_ms),
    );
    debug!("original command: {}", exec_config.original_command);
    debug!("patched command: {}", exec_config.patched_command);
    let executor = CommandExecutor::new(exec_config);

    let mut fuzzer = Fuzzer::new(
        BinaryImage::new(bytes),
        section,
        executor,
        SearchSettings::from_config(config),
    )?;
    info!(seed = fuzzer.seed(), "pass --seed to replay this run");

    Ok(fuzzer.run()?)
}

fn report_outcome(summary: &FuzzSummary) {
    info!(
        "{} executions, {} anomalies reported",
        summary.executions,
        summary.findings.len()
    );
    let Some(minimization) = &summary.minimization else {
        return;
    };
    let best = &minimization.best;
    match minimization.status {
        MinimizationStatus::Converged | MinimizationStatus::ResolvedSingleByte => {
            info!("minimal reproduction is a single byte: {best}");
        }
        MinimizationStatus::PairUnresolved => {
            info!("no single byte reproduces alone; minimal patch: {best}");
        }
        MinimizationStatus::GaveUp => {
            warn!("could not find further reductions; minimal patch found: {best}");
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(if cli.verbose { "debug" } else { "info" });

    let mut config = load_config(cli.config.as_ref())?;
    apply_overrides(&mut config, &cli)?;
    config.validate()?;
    debug!("effective configuration: {config:#?}");

    let summary = run(&config)?;

    if let Some(path) = &cli.summary {
        std::fs::write(path, summary.to_json_pretty()?)
            .with_context(|| format!("Failed to write summary to {path:?}"))?;
        info!("summary written to {path:?}");
    }
    report_outcome(&summary);
    Ok(())
}
