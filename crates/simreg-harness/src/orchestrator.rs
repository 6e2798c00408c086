#![forbid(unsafe_code)]

use crate::HarnessError;
use crate::case_runner::{CaseResult, CaseRunner};
use crate::cleaner::{CleanupReport, clean_artifacts};
use crate::process::ProcessRunner;
use crate::release::{ReferenceSuffix, ReleaseRegistry, UnknownRelease};
use crate::report::{ErrorMatrix, ReportContext, RunReport};
use crate::run_log::{RunLog, RunLogEntry};
use crate::suite::{PipelineExecutables, SuiteConfig, SuiteConfigError};
use crate::verdict::{Verdict, evaluate};
use crate::workdir::WorkingContext;
use simreg_io::ArchiveFormat;
use std::path::PathBuf;
use tracing::{info, warn};

pub const DEFAULT_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    WorkingDirSet,
    PreprocessRan,
    CaseRunning,
    Cleaned,
    Judged,
    Restored,
}

impl RunPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::WorkingDirSet => "working_dir_set",
            Self::PreprocessRan => "preprocess_ran",
            Self::CaseRunning => "case_running",
            Self::Cleaned => "cleaned",
            Self::Judged => "judged",
            Self::Restored => "restored",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub exe_dir: PathBuf,
    /// Newest registered release when absent.
    pub release: Option<String>,
    pub tolerance: f64,
}

impl RunOptions {
    #[must_use]
    pub fn new(exe_dir: impl Into<PathBuf>) -> Self {
        Self {
            exe_dir: exe_dir.into(),
            release: None,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub release: String,
    pub suffix: ReferenceSuffix,
    pub executables: PipelineExecutables,
    pub matrix: ErrorMatrix,
    pub warnings: Vec<String>,
    pub cleanup: CleanupReport,
    pub verdict: Verdict,
}

impl RunOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }

    #[must_use]
    pub fn run_report(&self) -> RunReport {
        RunReport::build(
            &self.matrix,
            &self.verdict,
            ReportContext {
                release: &self.release,
                reference_suffix: self.suffix.as_str(),
                executables: &self.executables,
                warnings: &self.warnings,
            },
        )
    }
}

/// Drives one suite through pre-processing, every case, cleanup and the
/// tolerance verdict.
#[derive(Debug)]
pub struct PipelineOrchestrator<R> {
    suite: SuiteConfig,
    registry: ReleaseRegistry,
    runner: R,
    run_log: RunLog,
}

impl<R: ProcessRunner> PipelineOrchestrator<R> {
    pub fn new(suite: SuiteConfig, runner: R) -> Result<Self, HarnessError> {
        suite.validate()?;
        let registry = suite.registry().map_err(SuiteConfigError::from)?;
        Ok(Self {
            suite,
            registry,
            runner,
            run_log: RunLog::disabled(),
        })
    }

    #[must_use]
    pub fn with_run_log(mut self, run_log: RunLog) -> Self {
        self.run_log = run_log;
        self
    }

    #[must_use]
    pub fn suite(&self) -> &SuiteConfig {
        &self.suite
    }

    #[must_use]
    pub fn registry(&self) -> &ReleaseRegistry {
        &self.registry
    }

    pub fn resolve_release(
        &self,
        requested: Option<&str>,
    ) -> Result<(String, ReferenceSuffix), UnknownRelease> {
        let tag = requested.map_or_else(|| self.registry.newest().tag.clone(), str::to_string);
        let suffix = self.registry.resolve(&tag)?;
        Ok((tag, suffix))
    }

    fn record(&self, entry: RunLogEntry) {
        if let Err(err) = self.run_log.append(&entry) {
            warn!(error = %err, "run log entry dropped");
        }
    }

    fn enter_phase(&self, phase: RunPhase) {
        info!(phase = phase.as_str(), "regression phase");
    }

    pub fn run(&self, options: &RunOptions) -> Result<RunOutcome, HarnessError> {
        self.enter_phase(RunPhase::Init);
        if !options.tolerance.is_finite() || options.tolerance < 0.0 {
            return Err(HarnessError::InvalidTolerance(options.tolerance));
        }
        let (release, suffix) = self.resolve_release(options.release.as_deref())?;
        info!(release = %release, suffix = %suffix, "resolved reference release");
        let executables = self.suite.executables.resolve(&options.exe_dir);

        let ctx = WorkingContext::enter(&self.suite.suite_dir)?;
        let format = self
            .suite
            .layout
            .format()
            .and_then(ArchiveFormat::ensure_available)
            .map_err(HarnessError::FormatUnavailable)?;
        self.enter_phase(RunPhase::WorkingDirSet);
        info!(root = %ctx.root().display(), format = format.as_str(), "suite working directory");

        let mut warnings = Vec::new();
        match self.runner.run(&executables.preprocessor, &[], ctx.root()) {
            Ok(outcome) => {
                self.record(RunLogEntry::new(RunPhase::PreprocessRan.as_str(), "ok"));
                info!(elapsed_ms = outcome.elapsed_ms, "pre-processor finished");
            }
            Err(failure) => {
                warn!(error = %failure, "pre-processor failed; continuing with existing geometry");
                self.record(
                    RunLogEntry::new(RunPhase::PreprocessRan.as_str(), "failed")
                        .failure(failure.reason_code(), failure.to_string()),
                );
                warnings.push(format!("pre-processor: {failure}"));
            }
        }
        self.enter_phase(RunPhase::PreprocessRan);

        let case_runner = CaseRunner::new(&ctx, &self.suite.layout, &self.runner);
        let mut rows = Vec::with_capacity(self.suite.cases.len());
        for case in &self.suite.cases {
            self.enter_phase(RunPhase::CaseRunning);
            let row = case_runner.run_case(case, &executables.solver, &self.suite.datasets, &suffix);
            self.record_case(&row);
            rows.push(row);
        }

        let cleanup = self.cleanup(&ctx, &mut warnings);
        self.enter_phase(RunPhase::Cleaned);

        let matrix = ErrorMatrix {
            description: self.suite.description.clone(),
            datasets: self.suite.datasets.clone(),
            rows,
        };
        let verdict = evaluate(&matrix, options.tolerance);
        self.enter_phase(RunPhase::Judged);
        info!(
            status = verdict.status(),
            failures = verdict.failures.len(),
            "regression verdict"
        );

        info!(invoking_dir = %ctx.invoking_dir().display(), "working context released");
        self.enter_phase(RunPhase::Restored);

        Ok(RunOutcome {
            release,
            suffix,
            executables,
            matrix,
            warnings,
            cleanup,
            verdict,
        })
    }

    fn record_case(&self, row: &CaseResult) {
        let case_id = row.case.output_basename.as_str();
        match &row.outcome {
            Ok(compared) => {
                self.record(RunLogEntry::new("case", "completed").case(case_id));
                for cell in &compared.cells {
                    let entry = match &cell.outcome {
                        Ok(value) => RunLogEntry::new("dataset", "measured").relative_error(*value),
                        Err(err) => RunLogEntry::new("dataset", "failed")
                            .failure(err.reason_code(), err.to_string()),
                    };
                    self.record(entry.case(case_id).dataset(&cell.dataset.path));
                }
            }
            Err(err) => self.record(
                RunLogEntry::new("case", "failed")
                    .case(case_id)
                    .failure(err.reason_code(), err.to_string()),
            ),
        }
    }

    fn cleanup(&self, ctx: &WorkingContext, warnings: &mut Vec<String>) -> CleanupReport {
        let layout = &self.suite.layout;
        let extra_files: Vec<PathBuf> = self
            .suite
            .cleanup_files
            .iter()
            .map(|file| ctx.resolve(file))
            .collect();
        let report = clean_artifacts(
            &ctx.resolve(&layout.output_dir),
            &layout.generated_prefix,
            &extra_files,
        );
        info!(
            removed = report.removed.len(),
            failed = report.failures.len(),
            "generated artifacts removed"
        );
        let entry = match report.failures.first() {
            None => RunLogEntry::new(RunPhase::Cleaned.as_str(), "ok"),
            Some(first) => {
                let detail = report
                    .failures
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                RunLogEntry::new(RunPhase::Cleaned.as_str(), "failed")
                    .failure(first.reason_code(), detail)
            }
        };
        self.record(entry);
        warnings.extend(report.failures.iter().map(|err| format!("cleanup: {err}")));
        report
    }
}

#[cfg(test)]
mod tests {
    use super::{PipelineOrchestrator, RunOptions, RunPhase};
    use crate::HarnessError;
    use crate::process::{ProcessFailure, ProcessOutcome, ProcessRunner};
    use crate::suite::SuiteConfig;
    use std::cell::Cell;
    use std::path::Path;

    #[derive(Default)]
    struct CountingRunner {
        launches: Cell<usize>,
    }

    impl ProcessRunner for CountingRunner {
        fn run(
            &self,
            program: &Path,
            _args: &[&str],
            _cwd: &Path,
        ) -> Result<ProcessOutcome, ProcessFailure> {
            self.launches.set(self.launches.get() + 1);
            Ok(ProcessOutcome {
                program: program.to_path_buf(),
                exit_code: Some(0),
                elapsed_ms: 0,
            })
        }
    }

    #[test]
    fn phase_names_are_stable() {
        assert_eq!(RunPhase::WorkingDirSet.as_str(), "working_dir_set");
        assert_eq!(RunPhase::Judged.as_str(), "judged");
        assert_eq!(RunPhase::Restored.as_str(), "restored");
    }

    #[test]
    fn default_release_is_newest() {
        let orchestrator =
            PipelineOrchestrator::new(SuiteConfig::builtin(), CountingRunner::default())
                .expect("valid suite");
        let (tag, suffix) = orchestrator.resolve_release(None).expect("newest");
        assert_eq!(tag, "0.6.0");
        assert_eq!(suffix.as_str(), "0-6-0");
    }

    #[test]
    fn unknown_release_launches_nothing() {
        let runner = CountingRunner::default();
        let orchestrator =
            PipelineOrchestrator::new(SuiteConfig::builtin(), &runner).expect("valid suite");
        let options = RunOptions {
            release: Some("9.9.9".to_string()),
            ..RunOptions::new("/nonexistent/bin")
        };
        let err = orchestrator.run(&options).expect_err("unknown release");
        assert!(matches!(err, HarnessError::UnknownRelease(_)));
        assert_eq!(err.reason_code(), "harness_unknown_release");
        assert_eq!(runner.launches.get(), 0);
    }

    #[test]
    fn invalid_tolerance_is_rejected_before_launch() {
        let runner = CountingRunner::default();
        let orchestrator =
            PipelineOrchestrator::new(SuiteConfig::builtin(), &runner).expect("valid suite");
        for tolerance in [-1.0, f64::NAN, f64::INFINITY] {
            let options = RunOptions {
                tolerance,
                ..RunOptions::new("/nonexistent/bin")
            };
            assert!(matches!(
                orchestrator.run(&options),
                Err(HarnessError::InvalidTolerance(_))
            ));
        }
        assert_eq!(runner.launches.get(), 0);
    }

    #[cfg(not(feature = "hdf5"))]
    #[test]
    fn hdf5_suite_without_backend_stops_before_launch() {
        let runner = CountingRunner::default();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut suite = SuiteConfig::builtin();
        suite.suite_dir = dir.path().to_path_buf();
        let orchestrator = PipelineOrchestrator::new(suite, &runner).expect("valid suite");
        let err = orchestrator
            .run(&RunOptions::new("/nonexistent/bin"))
            .expect_err("no hdf5 backend");
        assert_eq!(err.reason_code(), "harness_format_unavailable");
        assert!(err.to_string().contains("hdf5"));
        assert_eq!(runner.launches.get(), 0);
    }

    #[test]
    fn missing_suite_directory_is_a_harness_error() {
        let runner = CountingRunner::default();
        let mut suite = SuiteConfig::builtin();
        suite.suite_dir = "/nonexistent/suite/dir".into();
        let orchestrator = PipelineOrchestrator::new(suite, &runner).expect("valid suite");
        let err = orchestrator
            .run(&RunOptions::new("/nonexistent/bin"))
            .expect_err("no suite dir");
        assert_eq!(err.reason_code(), "harness_workdir_unavailable");
        assert_eq!(runner.launches.get(), 0);
    }
}
