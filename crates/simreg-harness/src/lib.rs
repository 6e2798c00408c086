#![forbid(unsafe_code)]

//! Regression harness for the pre-processor/solver/post-processor simulation
//! pipeline.
//!
//! A run resolves the requested release to its reference files, runs the
//! pre-processor once and the solver once per test case inside the suite
//! directory, compares every configured dataset of the solver output with the
//! reference by relative L2 error, removes generated artifacts and judges the
//! resulting error matrix against a tolerance.

pub mod case_runner;
pub mod cleaner;
pub mod compare;
pub mod orchestrator;
pub mod process;
pub mod release;
pub mod report;
pub mod run_log;
pub mod suite;
pub mod verdict;
pub mod workdir;

pub use case_runner::{CaseError, CaseResult, CaseRunner, DatasetCell, DatasetError};
pub use cleaner::{CleanupError, CleanupReport, clean_artifacts, remove_artifact};
pub use compare::{CompareError, relative_error};
pub use orchestrator::{DEFAULT_TOLERANCE, PipelineOrchestrator, RunOptions, RunOutcome};
pub use process::{ChildProcessRunner, ProcessFailure, ProcessOutcome, ProcessRunner};
pub use release::{ReferenceSuffix, ReleaseRegistry, UnknownRelease};
pub use report::{ErrorMatrix, RunReport, print_report, render_report, write_run_report};
pub use run_log::{RunLog, RunLogEntry};
pub use suite::{DatasetSpec, SuiteConfig, SuiteConfigError, TestCase};
pub use verdict::{Verdict, evaluate, render_verdict};
pub use workdir::{WorkdirError, WorkingContext};

use thiserror::Error;

/// Conditions that stop a run before it can produce an error matrix.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    UnknownRelease(#[from] UnknownRelease),
    #[error(transparent)]
    SuiteConfig(#[from] SuiteConfigError),
    #[error(transparent)]
    Workdir(#[from] WorkdirError),
    #[error("tolerance must be a finite non-negative number, got {0}")]
    InvalidTolerance(f64),
    #[error("suite output format unavailable: {0}")]
    FormatUnavailable(#[source] simreg_io::IOError),
    #[error(transparent)]
    ReportWrite(#[from] report::ReportWriteError),
}

impl HarnessError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnknownRelease(_) => "harness_unknown_release",
            Self::SuiteConfig(err) => err.reason_code(),
            Self::Workdir(_) => "harness_workdir_unavailable",
            Self::InvalidTolerance(_) => "harness_invalid_tolerance",
            Self::FormatUnavailable(_) => "harness_format_unavailable",
            Self::ReportWrite(_) => "harness_report_write_failed",
        }
    }
}
