#![forbid(unsafe_code)]

use crate::cleaner::{CleanupError, remove_artifact};
use crate::compare::{ArraySide, CompareError, relative_error};
use crate::process::{ProcessFailure, ProcessRunner};
use crate::release::ReferenceSuffix;
use crate::suite::{DatasetSpec, OutputLayout, TestCase};
use crate::workdir::WorkingContext;
use sha2::{Digest, Sha256};
use simreg_io::{DatasetArchive, IOError};
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failure that prevents any dataset of a case from being compared.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("solver did not produce a result: {0}")]
    Solver(#[source] ProcessFailure),
    #[error("output left by an earlier run could not be cleared: {0}")]
    StaleOutput(#[source] CleanupError),
    #[error("candidate output {} was not produced", .path.display())]
    OutputNotFound { path: PathBuf },
    #[error("reference file {} is missing", .path.display())]
    ReferenceNotFound { path: PathBuf },
    #[error("cannot read {} file {}: {source}", .side.as_str(), .path.display())]
    ArchiveUnreadable {
        side: ArraySide,
        path: PathBuf,
        #[source]
        source: IOError,
    },
}

impl CaseError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Solver(failure) => failure.reason_code(),
            Self::StaleOutput(_) => "case_stale_output",
            Self::OutputNotFound { .. } => "case_output_not_found",
            Self::ReferenceNotFound { .. } => "case_reference_not_found",
            Self::ArchiveUnreadable { .. } => "case_archive_unreadable",
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Solver(_) => "Solver",
            Self::StaleOutput(_) => "StaleOutput",
            Self::OutputNotFound { .. } => "OutputNotFound",
            Self::ReferenceNotFound { .. } => "ReferenceNotFound",
            Self::ArchiveUnreadable { .. } => "ArchiveUnreadable",
        }
    }
}

/// Failure confined to a single dataset cell.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DatasetError {
    #[error("dataset '{dataset}' not found in {} file", .side.as_str())]
    NotFound { dataset: String, side: ArraySide },
    #[error("dataset '{dataset}' in {} file is unreadable: {source}", .side.as_str())]
    Unreadable {
        dataset: String,
        side: ArraySide,
        #[source]
        source: IOError,
    },
    #[error(transparent)]
    Compare(#[from] CompareError),
}

impl DatasetError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "dataset_not_found",
            Self::Unreadable { .. } => "dataset_unreadable",
            Self::Compare(err) => err.reason_code(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "DatasetNotFound",
            Self::Unreadable { .. } => "DatasetUnreadable",
            Self::Compare(CompareError::ShapeMismatch { .. }) => "ShapeMismatch",
            Self::Compare(CompareError::DegenerateReference { .. }) => "DegenerateReference",
            Self::Compare(CompareError::NonFiniteValues { .. }) => "NonFiniteValues",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetCell {
    pub dataset: DatasetSpec,
    pub outcome: Result<f64, DatasetError>,
}

impl DatasetCell {
    #[must_use]
    pub fn relative_error(&self) -> Option<f64> {
        self.outcome.as_ref().ok().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDigest {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComparedCase {
    pub candidate: ArtifactDigest,
    pub reference: ArtifactDigest,
    pub cells: Vec<DatasetCell>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SolverRecord {
    pub exit_code: Option<i32>,
    pub elapsed_ms: u64,
}

/// One row of the error matrix.
#[derive(Debug)]
pub struct CaseResult {
    pub case: TestCase,
    pub solver: Option<SolverRecord>,
    pub warnings: Vec<String>,
    pub outcome: Result<ComparedCase, CaseError>,
}

impl CaseResult {
    #[must_use]
    pub fn cells(&self) -> &[DatasetCell] {
        match &self.outcome {
            Ok(compared) => &compared.cells,
            Err(_) => &[],
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

/// Runs the solver for one case and compares its output file with the
/// release reference, dataset by dataset.
#[derive(Debug)]
pub struct CaseRunner<'a, R> {
    ctx: &'a WorkingContext,
    layout: &'a OutputLayout,
    runner: R,
}

impl<'a, R: ProcessRunner> CaseRunner<'a, R> {
    pub fn new(ctx: &'a WorkingContext, layout: &'a OutputLayout, runner: R) -> Self {
        Self {
            ctx,
            layout,
            runner,
        }
    }

    pub fn run_case(
        &self,
        case: &TestCase,
        solver: &Path,
        datasets: &[DatasetSpec],
        suffix: &ReferenceSuffix,
    ) -> CaseResult {
        let candidate_path = self
            .ctx
            .resolve(self.layout.candidate_file(&case.output_basename));
        match remove_artifact(&candidate_path) {
            Ok(true) => {
                debug!(case = %case.output_basename, path = %candidate_path.display(), "removed stale candidate output");
            }
            Ok(false) => {}
            Err(err) => {
                warn!(case = %case.output_basename, error = %err, "stale candidate output left in place");
                return CaseResult {
                    case: case.clone(),
                    solver: None,
                    warnings: Vec::new(),
                    outcome: Err(CaseError::StaleOutput(err)),
                };
            }
        }

        info!(case = %case.output_basename, input = %case.input_file, "running solver");
        let mut warnings = Vec::new();
        let solver_record = match self
            .runner
            .run(solver, &[case.input_file.as_str()], self.ctx.root())
        {
            Ok(outcome) => SolverRecord {
                exit_code: outcome.exit_code,
                elapsed_ms: outcome.elapsed_ms,
            },
            Err(failure) if failure.produced_output() => {
                warn!(case = %case.output_basename, error = %failure, "solver exited abnormally; comparing whatever it wrote");
                warnings.push(failure.to_string());
                let elapsed_ms = match &failure {
                    ProcessFailure::NonZeroExit { elapsed_ms, .. } => *elapsed_ms,
                    _ => 0,
                };
                SolverRecord {
                    exit_code: failure.exit_code(),
                    elapsed_ms,
                }
            }
            Err(failure) => {
                warn!(case = %case.output_basename, error = %failure, "solver failed");
                return CaseResult {
                    case: case.clone(),
                    solver: None,
                    warnings,
                    outcome: Err(CaseError::Solver(failure)),
                };
            }
        };

        let outcome = self.compare_outputs(case, candidate_path, datasets, suffix);
        if let Err(err) = &outcome {
            warn!(case = %case.output_basename, reason_code = err.reason_code(), error = %err, "case failed");
        }
        CaseResult {
            case: case.clone(),
            solver: Some(solver_record),
            warnings,
            outcome,
        }
    }

    fn compare_outputs(
        &self,
        case: &TestCase,
        candidate_path: PathBuf,
        datasets: &[DatasetSpec],
        suffix: &ReferenceSuffix,
    ) -> Result<ComparedCase, CaseError> {
        let reference_path = self
            .ctx
            .resolve(self.layout.reference_file(&case.output_basename, suffix));

        let candidate = open_archive(ArraySide::Candidate, &candidate_path)?;
        let reference = open_archive(ArraySide::Reference, &reference_path)?;

        let cells = datasets
            .iter()
            .map(|dataset| {
                let outcome = compare_dataset(&reference, &candidate, &dataset.path);
                match &outcome {
                    Ok(value) => {
                        debug!(case = %case.output_basename, dataset = %dataset.path, relative_error = value, "dataset compared");
                    }
                    Err(err) => {
                        warn!(case = %case.output_basename, dataset = %dataset.path, reason_code = err.reason_code(), error = %err, "dataset comparison failed");
                    }
                }
                DatasetCell {
                    dataset: dataset.clone(),
                    outcome,
                }
            })
            .collect();

        Ok(ComparedCase {
            candidate: ArtifactDigest {
                path: candidate_path,
                sha256: sha256_hex(candidate.raw_bytes()),
            },
            reference: ArtifactDigest {
                path: reference_path,
                sha256: sha256_hex(reference.raw_bytes()),
            },
            cells,
        })
    }
}

fn open_archive(side: ArraySide, path: &Path) -> Result<DatasetArchive, CaseError> {
    DatasetArchive::open(path).map_err(|source| {
        let missing = matches!(
            &source,
            IOError::FileAccess { kind, .. } if *kind == ErrorKind::NotFound
        );
        let path = path.to_path_buf();
        match (missing, side) {
            (true, ArraySide::Candidate) => CaseError::OutputNotFound { path },
            (true, ArraySide::Reference) => CaseError::ReferenceNotFound { path },
            (false, _) => CaseError::ArchiveUnreadable { side, path, source },
        }
    })
}

fn read_dataset(
    archive: &DatasetArchive,
    side: ArraySide,
    dataset: &str,
) -> Result<simreg_ndarray::NumericArray, DatasetError> {
    archive.dataset(dataset).map_err(|source| match source {
        IOError::MemberNotFound(_) => DatasetError::NotFound {
            dataset: dataset.to_string(),
            side,
        },
        source => DatasetError::Unreadable {
            dataset: dataset.to_string(),
            side,
            source,
        },
    })
}

fn compare_dataset(
    reference: &DatasetArchive,
    candidate: &DatasetArchive,
    dataset: &str,
) -> Result<f64, DatasetError> {
    let reference_values = read_dataset(reference, ArraySide::Reference, dataset)?;
    let candidate_values = read_dataset(candidate, ArraySide::Candidate, dataset)?;
    Ok(relative_error(&reference_values, &candidate_values)?)
}
