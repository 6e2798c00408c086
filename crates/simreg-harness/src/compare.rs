#![forbid(unsafe_code)]

use simreg_ndarray::{NumericArray, ensure_same_shape};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArraySide {
    Reference,
    Candidate,
}

impl ArraySide {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::Candidate => "candidate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompareError {
    #[error("shape mismatch reference={reference:?} candidate={candidate:?}")]
    ShapeMismatch {
        reference: Vec<usize>,
        candidate: Vec<usize>,
    },
    #[error("reference norm is zero but candidate differs (difference norm {difference_norm:e})")]
    DegenerateReference { difference_norm: f64 },
    #[error("{} array contains a non-finite value at index {index}", .side.as_str())]
    NonFiniteValues { side: ArraySide, index: usize },
}

impl CompareError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::ShapeMismatch { .. } => "compare_shape_mismatch",
            Self::DegenerateReference { .. } => "compare_degenerate_reference",
            Self::NonFiniteValues { .. } => "compare_non_finite_values",
        }
    }
}

/// Euclidean norm with running rescaling, so values near `f64::MAX` do not
/// overflow the sum of squares.
fn l2_norm(values: impl Iterator<Item = f64>) -> f64 {
    let mut scale = 0.0_f64;
    let mut sum_sq = 1.0_f64;
    for value in values {
        if value == 0.0 {
            continue;
        }
        let magnitude = value.abs();
        if scale < magnitude {
            let ratio = scale / magnitude;
            sum_sq = ratio.mul_add(ratio * sum_sq, 1.0);
            scale = magnitude;
        } else {
            let ratio = magnitude / scale;
            sum_sq = ratio.mul_add(ratio, sum_sq);
        }
    }
    scale * sum_sq.sqrt()
}

fn first_non_finite(values: &[f64]) -> Option<usize> {
    values.iter().position(|value| !value.is_finite())
}

/// Relative error `‖candidate − reference‖₂ / ‖reference‖₂`.
///
/// A zero reference is only accepted when the candidate is zero as well, in
/// which case the error is `0.0`.
pub fn relative_error(
    reference: &NumericArray,
    candidate: &NumericArray,
) -> Result<f64, CompareError> {
    ensure_same_shape(reference.shape(), candidate.shape()).map_err(|_| {
        CompareError::ShapeMismatch {
            reference: reference.shape().to_vec(),
            candidate: candidate.shape().to_vec(),
        }
    })?;

    for (side, values) in [
        (ArraySide::Reference, reference.values()),
        (ArraySide::Candidate, candidate.values()),
    ] {
        if let Some(index) = first_non_finite(values) {
            return Err(CompareError::NonFiniteValues { side, index });
        }
    }

    let difference_norm = l2_norm(
        candidate
            .values()
            .iter()
            .zip(reference.values())
            .map(|(cand, refv)| cand - refv),
    );
    let reference_norm = l2_norm(reference.values().iter().copied());

    if reference_norm == 0.0 {
        return if difference_norm == 0.0 {
            Ok(0.0)
        } else {
            Err(CompareError::DegenerateReference { difference_norm })
        };
    }
    Ok(difference_norm / reference_norm)
}

#[cfg(test)]
mod tests {
    use super::{ArraySide, CompareError, l2_norm, relative_error};
    use simreg_ndarray::NumericArray;

    fn field() -> NumericArray {
        NumericArray::new(
            vec![2, 3],
            vec![0.25, -1.5, 3.0, 1e-3, 42.0, -7.125],
        )
        .expect("field")
    }

    #[test]
    fn norm_matches_textbook_and_survives_large_values() {
        assert_eq!(l2_norm([3.0, 4.0].into_iter()), 5.0);
        assert_eq!(l2_norm(std::iter::empty()), 0.0);
        let huge = l2_norm([1e300, 1e300].into_iter());
        assert!(huge.is_finite());
        assert!((huge / 1e300 - 2.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn array_against_itself_is_exactly_zero() {
        let array = field();
        assert_eq!(relative_error(&array, &array).expect("self compare"), 0.0);
    }

    #[test]
    fn uniform_offset_is_measured_against_reference_norm() {
        let reference = NumericArray::vector(vec![3.0, 4.0]);
        let candidate = reference.map(|v| v + 1.0);
        let err = relative_error(&reference, &candidate).expect("offset");
        assert!((err - 2.0_f64.sqrt() / 5.0).abs() < 1e-15);
    }

    #[test]
    fn error_is_invariant_under_common_scaling() {
        let reference = field();
        let candidate = reference.map(|v| v * 1.001 + 0.01);
        let base = relative_error(&reference, &candidate).expect("base");

        // Power-of-two scaling is exact in binary floating point.
        let exact = relative_error(&reference.map(|v| v * 4.0), &candidate.map(|v| v * 4.0))
            .expect("scaled by 4");
        assert_eq!(base, exact);

        for factor in [3.7, 1e-6, 2.5e8] {
            let scaled = relative_error(
                &reference.map(|v| v * factor),
                &candidate.map(|v| v * factor),
            )
            .expect("scaled");
            assert!(
                ((scaled - base) / base).abs() < 1e-10,
                "factor {factor}: {scaled} vs {base}"
            );
        }
    }

    #[test]
    fn mismatched_shapes_do_not_broadcast() {
        let reference = NumericArray::vector(vec![1.0, 2.0, 3.0]);
        let candidate = NumericArray::new(vec![1, 3], vec![1.0, 2.0, 3.0]).expect("row");
        let err = relative_error(&reference, &candidate).expect_err("rank differs");
        assert_eq!(
            err,
            CompareError::ShapeMismatch {
                reference: vec![3],
                candidate: vec![1, 3],
            }
        );
        assert_eq!(err.reason_code(), "compare_shape_mismatch");
    }

    #[test]
    fn zero_reference_policy_is_explicit() {
        let zeros = NumericArray::vector(vec![0.0; 4]);
        assert_eq!(relative_error(&zeros, &zeros).expect("0/0"), 0.0);

        let candidate = NumericArray::vector(vec![0.0, 0.0, 1e-9, 0.0]);
        let err = relative_error(&zeros, &candidate).expect_err("x/0");
        assert!(matches!(err, CompareError::DegenerateReference { .. }));
        assert_eq!(err.reason_code(), "compare_degenerate_reference");

        let empty = NumericArray::vector(Vec::new());
        assert_eq!(relative_error(&empty, &empty).expect("empty"), 0.0);
    }

    #[test]
    fn non_finite_inputs_never_reach_the_report() {
        let reference = NumericArray::vector(vec![1.0, 2.0]);
        let candidate = NumericArray::vector(vec![1.0, f64::NAN]);
        let err = relative_error(&reference, &candidate).expect_err("nan");
        assert_eq!(
            err,
            CompareError::NonFiniteValues {
                side: ArraySide::Candidate,
                index: 1,
            }
        );
        assert!(err.to_string().starts_with("candidate array"));

        let reference = NumericArray::vector(vec![f64::INFINITY, 2.0]);
        let err = relative_error(&reference, &reference).expect_err("inf");
        assert!(matches!(
            err,
            CompareError::NonFiniteValues {
                side: ArraySide::Reference,
                index: 0,
            }
        ));
    }
}
