use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Placeholder in the command template that is replaced with a file path.
pub const FILE_PLACEHOLDER: &str = "%c";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),
    #[error("Command template does not contain the '%c' placeholder: {0}")]
    MissingPlaceholder(String),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which kind of anomaly ends exploration and gets minimized.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyMode {
    /// Report every anomaly and keep exploring.
    #[default]
    Continuous,
    /// Stop at the first non-zero exit code.
    #[serde(alias = "ret")]
    ReturnCode,
    /// Stop at the first run that exceeds the expected execution time.
    Time,
}

impl AnomalyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyMode::Continuous => "continuous",
            AnomalyMode::ReturnCode => "ret",
            AnomalyMode::Time => "time",
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub command: Option<String>,
    pub file: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SectionSettings {
    pub address: Option<u64>,
    pub size: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default)]
    pub mode: AnomalyMode,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_max_bytes_to_change")]
    pub max_bytes_to_change: u64,
    #[serde(default)]
    pub max_iterations: Option<u64>,
}

pub fn default_max_bytes_to_change() -> u64 {
    32
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            mode: AnomalyMode::default(),
            seed: 0,
            max_bytes_to_change: default_max_bytes_to_change(),
            max_iterations: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BaselineSettings {
    #[serde(default = "default_test_runs")]
    pub runs: u32,
    #[serde(default = "default_variation_multiplier")]
    pub variation_multiplier: f64,
}

pub fn default_test_runs() -> u32 {
    10
}

pub fn default_variation_multiplier() -> f64 {
    5.0
}

impl Default for BaselineSettings {
    fn default() -> Self {
        Self {
            runs: default_test_runs(),
            variation_multiplier: default_variation_multiplier(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct OracleSettings {
    #[serde(default)]
    pub ignored_return_codes: Vec<i32>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MinimizerSettings {
    /// Resample budget for finding an untried byte string for one interval.
    #[serde(default = "default_dedup_attempt_limit")]
    pub dedup_attempt_limit: u64,
    /// Multi-byte exhaustion events before minimization gives up.
    #[serde(default = "default_patch_bytes_skip_limit")]
    pub patch_bytes_skip_limit: u64,
    /// Single-byte exhaustion events before 1-byte proposals stop.
    #[serde(default = "default_single_byte_skip_limit")]
    pub single_byte_skip_limit: u64,
}

pub fn default_dedup_attempt_limit() -> u64 {
    100_000
}
pub fn default_patch_bytes_skip_limit() -> u64 {
    2
}
pub fn default_single_byte_skip_limit() -> u64 {
    4
}

impl Default for MinimizerSettings {
    fn default() -> Self {
        Self {
            dedup_attempt_limit: default_dedup_attempt_limit(),
            patch_bytes_skip_limit: default_patch_bytes_skip_limit(),
            single_byte_skip_limit: default_single_byte_skip_limit(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default = "default_hang_report_interval_ms")]
    pub hang_report_interval_ms: u64,
}

pub fn default_hang_report_interval_ms() -> u64 {
    250
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            hang_report_interval_ms: default_hang_report_interval_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzConfig {
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub section: SectionSettings,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub baseline: BaselineSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
    #[serde(default)]
    pub minimizer: MinimizerSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
}

impl FuzzConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: FuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks that every setting the run needs is present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let command = self
            .target
            .command
            .as_deref()
            .ok_or(ConfigError::Missing("target.command"))?;
        if !command.contains(FILE_PLACEHOLDER) {
            return Err(ConfigError::MissingPlaceholder(command.to_string()));
        }
        if self.target.file.is_none() {
            return Err(ConfigError::Missing("target.file"));
        }
        if self.section.address.is_none() {
            return Err(ConfigError::Missing("section.address"));
        }
        match self.section.size {
            None => return Err(ConfigError::Missing("section.size")),
            Some(0) => {
                return Err(ConfigError::Invalid {
                    field: "section.size",
                    reason: "must be greater than zero".to_string(),
                });
            }
            Some(_) => {}
        }
        if self.fuzzer.max_bytes_to_change == 0 {
            return Err(ConfigError::Invalid {
                field: "fuzzer.max-bytes-to-change",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.baseline.runs == 0 {
            return Err(ConfigError::Invalid {
                field: "baseline.runs",
                reason: "at least one baseline run is required".to_string(),
            });
        }
        let multiplier = self.baseline.variation_multiplier;
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "baseline.variation-multiplier",
                reason: format!("must be a positive number, got {multiplier}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_config() -> FuzzConfig {
        let mut config = FuzzConfig::default();
        config.target.command = Some("./parse %c".to_string());
        config.target.file = Some(PathBuf::from("sample.bin"));
        config.section.address = Some(0x100);
        config.section.size = Some(0x10);
        config
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = FuzzConfig::default();
        assert_eq!(config.fuzzer.mode, AnomalyMode::Continuous);
        assert_eq!(config.fuzzer.max_bytes_to_change, 32);
        assert_eq!(config.fuzzer.seed, 0);
        assert_eq!(config.baseline.runs, 10);
        assert_eq!(config.baseline.variation_multiplier, 5.0);
        assert_eq!(config.minimizer.dedup_attempt_limit, 100_000);
        assert_eq!(config.executor.hang_report_interval_ms, 250);
        assert!(config.oracle.ignored_return_codes.is_empty());
    }

    #[test]
    fn parses_toml_with_hex_section() {
        let toml_src = r#"
            [target]
            command = "objdump -d %c"
            file = "a.out"

            [section]
            address = 0x1040
            size = 0x200

            [fuzzer]
            mode = "ret"
            seed = 7

            [oracle]
            ignored-return-codes = [3, 4]

            [minimizer]
            patch-bytes-skip-limit = 5
        "#;
        let config: FuzzConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.section.address, Some(0x1040));
        assert_eq!(config.section.size, Some(0x200));
        assert_eq!(config.fuzzer.mode, AnomalyMode::ReturnCode);
        assert_eq!(config.fuzzer.seed, 7);
        assert_eq!(config.oracle.ignored_return_codes, vec![3, 4]);
        assert_eq!(config.minimizer.patch_bytes_skip_limit, 5);
        assert_eq!(config.minimizer.single_byte_skip_limit, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<FuzzConfig, _> = toml::from_str("[fuzzer]\nthreads = 4\n");
        assert!(result.is_err());
    }

    #[test]
    fn load_from_file_reports_missing_path() {
        let err = FuzzConfig::load_from_file(&PathBuf::from("/nonexistent/dosfuzz.toml"))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read config file"), "{err}");
    }

    #[test]
    fn validate_catches_bad_settings() {
        assert!(complete_config().validate().is_ok());

        let mut config = complete_config();
        config.target.command = Some("./parse input.bin".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPlaceholder(_))
        ));

        let mut config = complete_config();
        config.section.size = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "section.size", .. })
        ));

        let mut config = complete_config();
        config.target.file = None;
        assert_eq!(config.validate(), Err(ConfigError::Missing("target.file")));

        let mut config = complete_config();
        config.baseline.variation_multiplier = f64::NAN;
        assert!(config.validate().is_err());

        let mut config = complete_config();
        config.baseline.runs = 0;
        assert!(config.validate().is_err());
    }
}
