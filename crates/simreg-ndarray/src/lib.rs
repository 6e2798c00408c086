#![forbid(unsafe_code)]

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    Overflow,
    ValueCountMismatch { shape: Vec<usize>, expected: usize, actual: usize },
    RankMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
    DimensionMismatch { lhs: Vec<usize>, rhs: Vec<usize> },
}

impl ShapeError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Overflow => "shape_overflow",
            Self::ValueCountMismatch { .. } => "shape_value_count_mismatch",
            Self::RankMismatch { .. } => "shape_rank_mismatch",
            Self::DimensionMismatch { .. } => "shape_dimension_mismatch",
        }
    }
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Overflow => write!(f, "size arithmetic overflow"),
            Self::ValueCountMismatch {
                shape,
                expected,
                actual,
            } => write!(
                f,
                "shape {shape:?} requires {expected} values but {actual} were supplied"
            ),
            Self::RankMismatch { lhs, rhs } => {
                write!(f, "rank mismatch {:?} vs {:?}", lhs, rhs)
            }
            Self::DimensionMismatch { lhs, rhs } => {
                write!(f, "dimension mismatch {:?} vs {:?}", lhs, rhs)
            }
        }
    }
}

impl std::error::Error for ShapeError {}

pub fn element_count(shape: &[usize]) -> Result<usize, ShapeError> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        acc.checked_mul(dim).ok_or(ShapeError::Overflow)
    })
}

/// Strict shape equality. Unlike broadcasting, a `[3]` never matches a `[1, 3]`.
pub fn ensure_same_shape(lhs: &[usize], rhs: &[usize]) -> Result<(), ShapeError> {
    if lhs.len() != rhs.len() {
        return Err(ShapeError::RankMismatch {
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        });
    }
    if lhs != rhs {
        return Err(ShapeError::DimensionMismatch {
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        });
    }
    Ok(())
}

/// Row-major `f64` buffer with an explicit shape.
///
/// Every dataset read from a structured output file is widened to `f64`
/// before it reaches the comparator, whatever its on-disk element type.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    shape: Vec<usize>,
    values: Vec<f64>,
}

impl NumericArray {
    pub fn new(shape: Vec<usize>, values: Vec<f64>) -> Result<Self, ShapeError> {
        let expected = element_count(&shape)?;
        if expected != values.len() {
            return Err(ShapeError::ValueCountMismatch {
                shape,
                expected,
                actual: values.len(),
            });
        }
        Ok(Self { shape, values })
    }

    #[must_use]
    pub fn vector(values: Vec<f64>) -> Self {
        Self {
            shape: vec![values.len()],
            values,
        }
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            shape: self.shape.clone(),
            values: self.values.iter().copied().map(f).collect(),
        }
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<usize>, Vec<f64>) {
        (self.shape, self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::{NumericArray, ShapeError, element_count, ensure_same_shape};

    #[test]
    fn element_count_handles_scalars_and_overflow() {
        assert_eq!(element_count(&[]).expect("scalar"), 1);
        assert_eq!(element_count(&[2, 3, 4]).expect("rank 3"), 24);
        assert_eq!(element_count(&[5, 0]).expect("empty"), 0);
        let err = element_count(&[usize::MAX, 2]).expect_err("should overflow");
        assert_eq!(err, ShapeError::Overflow);
    }

    #[test]
    fn new_rejects_value_count_mismatch() {
        let err = NumericArray::new(vec![2, 2], vec![1.0, 2.0, 3.0]).expect_err("3 != 4");
        assert_eq!(err.reason_code(), "shape_value_count_mismatch");
        assert!(err.to_string().contains("requires 4 values"));
    }

    #[test]
    fn same_shape_is_strict() {
        ensure_same_shape(&[3, 2], &[3, 2]).expect("identical shapes");

        let err = ensure_same_shape(&[3], &[1, 3]).expect_err("no broadcasting");
        assert!(matches!(err, ShapeError::RankMismatch { .. }));

        let err = ensure_same_shape(&[3, 2], &[2, 3]).expect_err("transposed");
        assert!(matches!(err, ShapeError::DimensionMismatch { .. }));
    }

    #[test]
    fn map_preserves_shape() {
        let array = NumericArray::new(vec![2, 1], vec![1.0, -2.0]).expect("array");
        let scaled = array.map(|v| v * 3.0);
        assert_eq!(scaled.shape(), &[2, 1]);
        assert_eq!(scaled.values(), &[3.0, -6.0]);
        assert_eq!(scaled.ndim(), 2);
        assert_eq!(scaled.len(), 2);
    }
}
