#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_POLL_INTERVAL_MILLIS: u64 = 50;

/// Exit record of a child process that ran to completion with status zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub program: PathBuf,
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Error)]
pub enum ProcessFailure {
    #[error("failed to launch {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting on {}: {source}", .program.display())]
    Wait {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} exceeded the {timeout_ms} ms timeout and was killed", .program.display())]
    TimeoutExceeded { program: PathBuf, timeout_ms: u64 },
    #[error("{} exited with {}", .program.display(), describe_exit(.exit_code))]
    NonZeroExit {
        program: PathBuf,
        exit_code: Option<i32>,
        elapsed_ms: u64,
    },
}

fn describe_exit(code: &Option<i32>) -> String {
    code.map_or_else(|| "no exit code (signal)".to_string(), |code| format!("status {code}"))
}

impl ProcessFailure {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "process_spawn_failed",
            Self::Wait { .. } => "process_wait_failed",
            Self::TimeoutExceeded { .. } => "process_timeout_exceeded",
            Self::NonZeroExit { .. } => "process_nonzero_exit",
        }
    }

    /// A non-zero exit still leaves whatever the process wrote on disk, so
    /// callers may carry on and inspect it.
    #[must_use]
    pub fn produced_output(&self) -> bool {
        matches!(self, Self::NonZeroExit { .. })
    }

    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::NonZeroExit { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Seam between the orchestrator and the pipeline executables.
pub trait ProcessRunner {
    fn run(
        &self,
        program: &Path,
        args: &[&str],
        cwd: &Path,
    ) -> Result<ProcessOutcome, ProcessFailure>;
}

impl<R: ProcessRunner + ?Sized> ProcessRunner for &R {
    fn run(
        &self,
        program: &Path,
        args: &[&str],
        cwd: &Path,
    ) -> Result<ProcessOutcome, ProcessFailure> {
        (**self).run(program, args, cwd)
    }
}

/// Blocking child-process runner with an optional bounded wait.
///
/// Children inherit stdout/stderr so solver progress stays visible.
#[derive(Debug, Clone, Copy)]
pub struct ChildProcessRunner {
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl Default for ChildProcessRunner {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MILLIS),
        }
    }
}

impl ChildProcessRunner {
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

fn elapsed_ms_u64(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

impl ProcessRunner for ChildProcessRunner {
    fn run(
        &self,
        program: &Path,
        args: &[&str],
        cwd: &Path,
    ) -> Result<ProcessOutcome, ProcessFailure> {
        debug!(program = %program.display(), ?args, cwd = %cwd.display(), "launching child process");
        let started_at = Instant::now();
        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ProcessFailure::Spawn {
                program: program.to_path_buf(),
                source,
            })?;

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if let Some(timeout) = self.timeout
                        && started_at.elapsed() >= timeout
                    {
                        warn!(program = %program.display(), timeout_ms = elapsed_ms_u64(timeout), "killing child after timeout");
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(ProcessFailure::TimeoutExceeded {
                            program: program.to_path_buf(),
                            timeout_ms: elapsed_ms_u64(timeout),
                        });
                    }
                    thread::sleep(self.poll_interval);
                }
                Err(source) => {
                    let _ = child.kill();
                    return Err(ProcessFailure::Wait {
                        program: program.to_path_buf(),
                        source,
                    });
                }
            }
        };

        let elapsed_ms = elapsed_ms_u64(started_at.elapsed());
        if !status.success() {
            return Err(ProcessFailure::NonZeroExit {
                program: program.to_path_buf(),
                exit_code: status.code(),
                elapsed_ms,
            });
        }
        Ok(ProcessOutcome {
            program: program.to_path_buf(),
            exit_code: status.code(),
            elapsed_ms,
        })
    }
}
