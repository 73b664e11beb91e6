use crate::config::FILE_PLACEHOLDER;
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Suffix appended to the original path to get the patched file path.
pub const PATCHED_SUFFIX: &str = ".patched";

/// Reported when the target is terminated without an exit code and no signal is known.
const ABNORMAL_EXIT_CODE: i32 = -1;

/// What one run of the target looked like from the outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub return_code: i32,
    pub elapsed_ms: u64,
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Error waiting for command '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("Waiter thread for command '{0}' exited without reporting a status")]
    WaiterLost(String),
    #[error("{0:?} exists and is not a regular file")]
    PatchedPathNotFile(PathBuf),
    #[error("Failed to write patched file {path:?}: {source}")]
    WritePatched {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Runs the target, either unmodified or against a patched copy of the image.
///
/// Implementations must block until the target exits; a run is never
/// cancelled, so a hung target stalls the caller.
pub trait Executor {
    /// Runs the target against the original, unmodified file.
    fn execute_baseline(&mut self) -> Result<ExecutionOutcome, ExecutorError>;

    /// Runs the target against `patched`, a full copy of the image with a patch applied.
    fn execute_patched(&mut self, patched: &[u8]) -> Result<ExecutionOutcome, ExecutorError>;

    /// Sets how long a run may take before liveness reports start.
    fn set_hang_threshold(&mut self, _threshold: Duration) {}
}

/// Substitutes every `%c` in `template` with `path`.
pub fn expand_command(template: &str, path: &Path) -> String {
    template.replace(FILE_PLACEHOLDER, &path.to_string_lossy())
}

/// `<original>.patched`
pub fn patched_path_for(original: &Path) -> PathBuf {
    let mut name: OsString = original.as_os_str().to_owned();
    name.push(PATCHED_SUFFIX);
    PathBuf::from(name)
}

/// Replaces whatever file sits at `path` with `bytes`.
///
/// The file is fully written and closed before this returns.
pub fn write_patched(path: &Path, bytes: &[u8]) -> Result<(), ExecutorError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_file() => {
            return Err(ExecutorError::PatchedPathNotFile(path.to_path_buf()));
        }
        Ok(_) => fs::remove_file(path).map_err(|source| ExecutorError::WritePatched {
            path: path.to_path_buf(),
            source,
        })?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ExecutorError::WritePatched {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    fs::write(path, bytes).map_err(|source| ExecutorError::WritePatched {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone)]
pub struct CommandExecutorConfig {
    pub original_command: String,
    pub patched_command: String,
    pub patched_path: PathBuf,
    pub hang_threshold: Duration,
    pub hang_report_interval: Duration,
}

impl CommandExecutorConfig {
    /// Builds both concrete commands from a `%c` template.
    pub fn from_template(
        template: &str,
        original_path: &Path,
        hang_report_interval: Duration,
    ) -> Self {
        let patched_path = patched_path_for(original_path);
        Self {
            original_command: expand_command(template, original_path),
            patched_command: expand_command(template, &patched_path),
            patched_path,
            hang_threshold: Duration::from_secs(1),
            hang_report_interval,
        }
    }
}

/// Runs shell commands and times them.
pub struct CommandExecutor {
    config: CommandExecutorConfig,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self { config }
    }

    fn run_command(&self, command: &str) -> Result<ExecutionOutcome, ExecutorError> {
        let start_time = Instant::now();
        let mut child = shell(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                command: command.to_string(),
                source,
            })?;

        // The child is waited on from its own thread so this one can report
        // liveness; the elapsed time is taken where the wait returns.
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let status = child.wait();
            let _ = tx.send((status, start_time.elapsed()));
        });

        let mut timeout = self.config.hang_threshold;
        let (status, elapsed) = loop {
            match rx.recv_timeout(timeout) {
                Ok(result) => break result,
                Err(RecvTimeoutError::Timeout) => {
                    warn!(
                        "command has been hanging for {:.1}s",
                        start_time.elapsed().as_secs_f32()
                    );
                    timeout = self.config.hang_report_interval;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ExecutorError::WaiterLost(command.to_string()));
                }
            }
        };

        let status = status.map_err(|source| ExecutorError::Wait {
            command: command.to_string(),
            source,
        })?;

        Ok(ExecutionOutcome {
            return_code: return_code_of(status),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        })
    }
}

impl Executor for CommandExecutor {
    fn execute_baseline(&mut self) -> Result<ExecutionOutcome, ExecutorError> {
        self.run_command(&self.config.original_command)
    }

    fn execute_patched(&mut self, patched: &[u8]) -> Result<ExecutionOutcome, ExecutorError> {
        write_patched(&self.config.patched_path, patched)?;
        self.run_command(&self.config.patched_command)
    }

    fn set_hang_threshold(&mut self, threshold: Duration) {
        self.config.hang_threshold = threshold;
    }
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn return_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    ABNORMAL_EXIT_CODE
}
