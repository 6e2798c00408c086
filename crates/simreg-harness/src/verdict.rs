#![forbid(unsafe_code)]

use crate::report::ErrorMatrix;
use serde::Serialize;
use std::fmt::Write as _;

/// A measured error passes when it does not exceed the tolerance.
#[must_use]
pub fn within_tolerance(relative_error: f64, tolerance: f64) -> bool {
    relative_error <= tolerance
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    CaseFailed { reason_code: String, detail: String },
    CellFailed { reason_code: String, detail: String },
    ToleranceExceeded { relative_error: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerdictFailure {
    pub case: String,
    pub dataset: Option<String>,
    #[serde(flatten)]
    pub kind: FailureKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub tolerance: f64,
    pub passed: bool,
    pub measured_cells: usize,
    pub cells_within_tolerance: usize,
    pub failures: Vec<VerdictFailure>,
}

impl Verdict {
    #[must_use]
    pub fn status(&self) -> &'static str {
        if self.passed { "PASS" } else { "FAIL" }
    }
}

/// Judges every cell of a fully populated matrix.
///
/// The run passes only when every case completed, every cell was measured and
/// no measured error exceeds `tolerance`.
#[must_use]
pub fn evaluate(matrix: &ErrorMatrix, tolerance: f64) -> Verdict {
    let mut failures = Vec::new();
    let mut measured_cells = 0;
    let mut cells_within_tolerance = 0;

    for row in &matrix.rows {
        let case = row.case.output_basename.clone();
        let compared = match &row.outcome {
            Ok(compared) => compared,
            Err(err) => {
                failures.push(VerdictFailure {
                    case,
                    dataset: None,
                    kind: FailureKind::CaseFailed {
                        reason_code: err.reason_code().to_string(),
                        detail: err.to_string(),
                    },
                });
                continue;
            }
        };
        for cell in &compared.cells {
            match &cell.outcome {
                Ok(value) => {
                    measured_cells += 1;
                    if within_tolerance(*value, tolerance) {
                        cells_within_tolerance += 1;
                    } else {
                        failures.push(VerdictFailure {
                            case: case.clone(),
                            dataset: Some(cell.dataset.path.clone()),
                            kind: FailureKind::ToleranceExceeded {
                                relative_error: *value,
                            },
                        });
                    }
                }
                Err(err) => failures.push(VerdictFailure {
                    case: case.clone(),
                    dataset: Some(cell.dataset.path.clone()),
                    kind: FailureKind::CellFailed {
                        reason_code: err.reason_code().to_string(),
                        detail: err.to_string(),
                    },
                }),
            }
        }
    }

    Verdict {
        tolerance,
        passed: failures.is_empty(),
        measured_cells,
        cells_within_tolerance,
        failures,
    }
}

#[must_use]
pub fn render_verdict(verdict: &Verdict) -> String {
    let mut out = format!(
        "Regression status: {} (tolerance {:e}, {}/{} measured cells within tolerance)\n",
        verdict.status(),
        verdict.tolerance,
        verdict.cells_within_tolerance,
        verdict.measured_cells
    );
    for failure in &verdict.failures {
        let location = match &failure.dataset {
            Some(dataset) => format!("{} {dataset}", failure.case),
            None => failure.case.clone(),
        };
        let _ = match &failure.kind {
            FailureKind::CaseFailed { reason_code, .. } | FailureKind::CellFailed { reason_code, .. } => {
                writeln!(out, "  {location}: {reason_code}")
            }
            FailureKind::ToleranceExceeded { relative_error } => {
                writeln!(out, "  {location}: {relative_error:e} > {:e}", verdict.tolerance)
            }
        };
    }
    out
}
