#![forbid(unsafe_code)]

use crate::case_runner::CaseResult;
use crate::suite::{DatasetSpec, PipelineExecutables};
use crate::verdict::{Verdict, VerdictFailure, within_tolerance};
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const RUN_REPORT_SCHEMA_VERSION: u32 = 1;

/// Rows are cases in declaration order; every row holds one cell per
/// dataset unless the whole case failed.
#[derive(Debug)]
pub struct ErrorMatrix {
    pub description: String,
    pub datasets: Vec<DatasetSpec>,
    pub rows: Vec<CaseResult>,
}

fn label_width(datasets: &[DatasetSpec]) -> usize {
    datasets
        .iter()
        .map(|dataset| dataset.description.chars().count())
        .max()
        .unwrap_or(0)
}

/// Plain-text rendering of the matrix. Values are printed as measured; the
/// tolerance verdict is rendered separately.
#[must_use]
pub fn render_report(matrix: &ErrorMatrix) -> String {
    let mut out = String::new();
    if !matrix.description.is_empty() {
        let _ = writeln!(out, "{}", matrix.description);
    }
    let _ = writeln!(out, "Difference w.r.t. reference:");
    let width = label_width(&matrix.datasets);

    for row in &matrix.rows {
        let _ = writeln!(out, "In run {} :", row.case.description);
        for warning in &row.warnings {
            let _ = writeln!(out, "  warning: {warning}");
        }
        let compared = match &row.outcome {
            Ok(compared) => compared,
            Err(err) => {
                let _ = writeln!(out, "  FAILED ({}): {err}", err.kind());
                continue;
            }
        };
        for cell in &compared.cells {
            let label = &cell.dataset.description;
            let _ = match &cell.outcome {
                Ok(value) => writeln!(out, "  Difference on {label:<width$} : {value:e}"),
                Err(err) => writeln!(
                    out,
                    "  Difference on {label:<width$} : FAILED ({}): {err}",
                    err.kind()
                ),
            };
        }
    }
    out
}

pub fn print_report(matrix: &ErrorMatrix) {
    print!("{}", render_report(matrix));
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellReport {
    pub dataset: String,
    pub description: String,
    pub relative_error: Option<f64>,
    pub pass: bool,
    pub reason_code: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub input_file: String,
    pub description: String,
    pub output_basename: String,
    pub status: &'static str,
    pub reason_code: Option<String>,
    pub detail: Option<String>,
    pub solver_exit_code: Option<i32>,
    pub solver_elapsed_ms: Option<u64>,
    pub candidate_path: Option<PathBuf>,
    pub candidate_sha256: Option<String>,
    pub reference_path: Option<PathBuf>,
    pub reference_sha256: Option<String>,
    pub warnings: Vec<String>,
    pub cells: Vec<CellReport>,
}

impl CaseReport {
    fn from_result(row: &CaseResult, tolerance: f64) -> Self {
        let mut report = Self {
            input_file: row.case.input_file.clone(),
            description: row.case.description.clone(),
            output_basename: row.case.output_basename.clone(),
            status: "completed",
            reason_code: None,
            detail: None,
            solver_exit_code: row.solver.and_then(|solver| solver.exit_code),
            solver_elapsed_ms: row.solver.map(|solver| solver.elapsed_ms),
            candidate_path: None,
            candidate_sha256: None,
            reference_path: None,
            reference_sha256: None,
            warnings: row.warnings.clone(),
            cells: Vec::new(),
        };
        match &row.outcome {
            Ok(compared) => {
                report.candidate_path = Some(compared.candidate.path.clone());
                report.candidate_sha256 = Some(compared.candidate.sha256.clone());
                report.reference_path = Some(compared.reference.path.clone());
                report.reference_sha256 = Some(compared.reference.sha256.clone());
                report.cells = compared
                    .cells
                    .iter()
                    .map(|cell| match &cell.outcome {
                        Ok(value) => CellReport {
                            dataset: cell.dataset.path.clone(),
                            description: cell.dataset.description.clone(),
                            relative_error: Some(*value),
                            pass: within_tolerance(*value, tolerance),
                            reason_code: None,
                            detail: None,
                        },
                        Err(err) => CellReport {
                            dataset: cell.dataset.path.clone(),
                            description: cell.dataset.description.clone(),
                            relative_error: None,
                            pass: false,
                            reason_code: Some(err.reason_code().to_string()),
                            detail: Some(err.to_string()),
                        },
                    })
                    .collect();
            }
            Err(err) => {
                report.status = "failed";
                report.reason_code = Some(err.reason_code().to_string());
                report.detail = Some(err.to_string());
            }
        }
        report
    }
}

/// Machine-readable record of one regression run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub generated_at_unix_ms: u128,
    pub suite: String,
    pub release: String,
    pub reference_suffix: String,
    pub tolerance: f64,
    pub status: &'static str,
    pub executables: PipelineExecutables,
    pub warnings: Vec<String>,
    pub total_cases: usize,
    pub completed_cases: usize,
    pub total_cells: usize,
    pub passed_cells: usize,
    pub failed_cells: usize,
    pub cases: Vec<CaseReport>,
    pub failures: Vec<VerdictFailure>,
}

fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

#[derive(Debug, Clone, Copy)]
pub struct ReportContext<'a> {
    pub release: &'a str,
    pub reference_suffix: &'a str,
    pub executables: &'a PipelineExecutables,
    pub warnings: &'a [String],
}

impl RunReport {
    #[must_use]
    pub fn build(matrix: &ErrorMatrix, verdict: &Verdict, context: ReportContext<'_>) -> Self {
        let cases: Vec<CaseReport> = matrix
            .rows
            .iter()
            .map(|row| CaseReport::from_result(row, verdict.tolerance))
            .collect();
        let total_cells = matrix.rows.len() * matrix.datasets.len();
        let passed_cells = cases
            .iter()
            .flat_map(|case| &case.cells)
            .filter(|cell| cell.pass)
            .count();

        Self {
            schema_version: RUN_REPORT_SCHEMA_VERSION,
            generated_at_unix_ms: now_unix_ms(),
            suite: matrix.description.clone(),
            release: context.release.to_string(),
            reference_suffix: context.reference_suffix.to_string(),
            tolerance: verdict.tolerance,
            status: if verdict.passed { "pass" } else { "fail" },
            executables: context.executables.clone(),
            warnings: context.warnings.to_vec(),
            total_cases: matrix.rows.len(),
            completed_cases: matrix.rows.iter().filter(|row| row.is_completed()).count(),
            total_cells,
            passed_cells,
            failed_cells: total_cells - passed_cells,
            cases,
            failures: verdict.failures.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportWriteError {
    #[error("failed creating {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to serialize run report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed writing {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub fn write_run_report(path: &Path, report: &RunReport) -> Result<(), ReportWriteError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ReportWriteError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let raw = serde_json::to_string_pretty(report)?;
    fs::write(path, raw).map_err(|source| ReportWriteError::Write {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::{ErrorMatrix, ReportContext, RunReport, render_report, write_run_report};
    use crate::case_runner::{
        ArtifactDigest, CaseError, CaseResult, ComparedCase, DatasetCell, DatasetError,
        SolverRecord,
    };
    use crate::compare::CompareError;
    use crate::process::ProcessFailure;
    use crate::suite::{DatasetSpec, ExecutableNames, TestCase};
    use crate::verdict::evaluate;
    use std::path::{Path, PathBuf};

    fn datasets() -> Vec<DatasetSpec> {
        vec![
            DatasetSpec::new("/ParticleWake/WakePoints", "Particles position"),
            DatasetSpec::new("/Components/Comp001/Solution/Pres", "Component 1 Pressure"),
        ]
    }

    fn sample_matrix() -> ErrorMatrix {
        let specs = datasets();
        let completed = CaseResult {
            case: TestCase::new("dust_static_base.in", "static, basic configuration", "static_base"),
            solver: Some(SolverRecord {
                exit_code: Some(1),
                elapsed_ms: 12,
            }),
            warnings: vec!["dust exited with status 1".to_string()],
            outcome: Ok(ComparedCase {
                candidate: ArtifactDigest {
                    path: PathBuf::from("Output/test_static_base_res_0011.npz"),
                    sha256: "aa".to_string(),
                },
                reference: ArtifactDigest {
                    path: PathBuf::from("Output/ref_static_base_0-6-0_res_0011.npz"),
                    sha256: "bb".to_string(),
                },
                cells: vec![
                    DatasetCell {
                        dataset: specs[0].clone(),
                        outcome: Ok(0.0),
                    },
                    DatasetCell {
                        dataset: specs[1].clone(),
                        outcome: Err(DatasetError::Compare(CompareError::ShapeMismatch {
                            reference: vec![3],
                            candidate: vec![4],
                        })),
                    },
                ],
            }),
        };
        let failed = CaseResult {
            case: TestCase::new("dust_dynamic_base.in", "dynamic, basic configuration", "dynamic_base"),
            solver: None,
            warnings: Vec::new(),
            outcome: Err(CaseError::Solver(ProcessFailure::TimeoutExceeded {
                program: PathBuf::from("dust"),
                timeout_ms: 5000,
            })),
        };
        ErrorMatrix {
            description: "Basic wing with mirror".to_string(),
            datasets: specs,
            rows: vec![completed, failed],
        }
    }

    #[test]
    fn text_report_keeps_declaration_order_and_marks_failures() {
        let rendered = render_report(&sample_matrix());
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "Basic wing with mirror");
        assert_eq!(lines[1], "Difference w.r.t. reference:");
        assert_eq!(lines[2], "In run static, basic configuration :");
        assert_eq!(lines[3], "  warning: dust exited with status 1");
        assert_eq!(lines[4], "  Difference on Particles position   : 0e0");
        assert!(lines[5].starts_with("  Difference on Component 1 Pressure : FAILED (ShapeMismatch)"));
        assert_eq!(lines[6], "In run dynamic, basic configuration :");
        assert!(lines[7].starts_with("  FAILED (Solver): "));
    }

    #[test]
    fn run_report_counts_and_serializes() {
        let matrix = sample_matrix();
        let verdict = evaluate(&matrix, 1e-10);
        let executables = ExecutableNames::default().resolve(Path::new("/opt/bin"));
        let warnings = vec!["pre-processor: dust_pre exited with status 2".to_string()];
        let report = RunReport::build(
            &matrix,
            &verdict,
            ReportContext {
                release: "0.6.0",
                reference_suffix: "0-6-0",
                executables: &executables,
                warnings: &warnings,
            },
        );
        assert_eq!(report.status, "fail");
        assert_eq!(report.total_cases, 2);
        assert_eq!(report.completed_cases, 1);
        assert_eq!(report.total_cells, 4);
        assert_eq!(report.passed_cells, 1);
        assert_eq!(report.failed_cells, 3);
        assert_eq!(report.cases[0].cells[1].reason_code.as_deref(), Some("compare_shape_mismatch"));
        assert_eq!(report.cases[1].reason_code.as_deref(), Some("process_timeout_exceeded"));

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports/run.json");
        write_run_report(&path, &report).expect("write");
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value["schema_version"], 1);
        assert_eq!(value["reference_suffix"], "0-6-0");
        assert_eq!(value["cases"][0]["candidate_sha256"], "aa");
        assert_eq!(value["executables"]["postprocessor"], "/opt/bin/dust_post");
        assert_eq!(value["failures"][0]["kind"], "cell_failed");
    }
}
