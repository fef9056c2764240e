//! One least-squares solve for all pixels at once.

use nalgebra::DMatrix;
use ndarray::Array2;

/// Singular values below this fraction of the largest one mark the basis as rank deficient.
const RANK_TOLERANCE: f64 = 1e-10;

/// Convergence threshold of the iterative SVD. Exactly `f64::EPSILON` breaks rank-deficient inputs.
pub const SVD_EPSILON: f64 = f64::EPSILON * 5.0;

/// Result of solving `basis · coefficients ≈ targets`.
///
/// # Fields
/// - `coefficients`: `(terms × pixels)`; all zero when the basis could not be inverted.
/// - `residual`: `basis · coefficients − targets`, shaped like `targets`.
/// - `solved`: `false` when the zero fallback was used.
#[derive(Debug, Clone)]
pub struct LeastSquares {
    pub coefficients: Array2<f64>,
    pub residual: Array2<f64>,
    pub solved: bool,
}

impl LeastSquares {
    fn fallback(terms: usize, targets: &Array2<f64>) -> Self {
        LeastSquares {
            coefficients: Array2::zeros((terms, targets.ncols())),
            residual: -targets,
            solved: false,
        }
    }
}

fn to_dmatrix(array: &Array2<f64>) -> DMatrix<f64> {
    let (rows, cols) = array.dim();
    DMatrix::from_fn(rows, cols, |i, j| array[(i, j)])
}

/// Solves the shared basis against every target column.
///
/// The basis is decomposed once with an SVD. When it has fewer rows than columns or is
/// numerically rank deficient, the zero coefficient matrix is returned instead of an error so
/// that callers fall back to "no background".
///
/// # Arguments
/// - `basis`: `(channels × terms)` basis matrix.
/// - `targets`: `(channels × pixels)` linearized observations.
pub fn solve(basis: &Array2<f64>, targets: &Array2<f64>) -> LeastSquares {
    let (rows, terms) = basis.dim();
    if terms == 0 || rows < terms || targets.nrows() != rows {
        return LeastSquares::fallback(terms, targets);
    }
    if basis.iter().any(|v| !v.is_finite()) {
        log::warn!("background basis contains non-finite values, skipping fit");
        return LeastSquares::fallback(terms, targets);
    }

    let svd = match to_dmatrix(basis).try_svd(true, true, SVD_EPSILON, 0) {
        Some(svd) => svd,
        None => return LeastSquares::fallback(terms, targets),
    };
    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();
    if max_sv <= 0.0 || min_sv <= max_sv * RANK_TOLERANCE {
        log::warn!(
            "background basis is singular (condition {:.3e}), using zero background",
            max_sv / min_sv
        );
        return LeastSquares::fallback(terms, targets);
    }

    let solution = match svd.solve(&to_dmatrix(targets), max_sv * RANK_TOLERANCE) {
        Ok(solution) => solution,
        Err(err) => {
            log::warn!("least squares solve failed: {err}");
            return LeastSquares::fallback(terms, targets);
        }
    };

    let coefficients = Array2::from_shape_fn((terms, targets.ncols()), |(i, j)| solution[(i, j)]);
    let residual = basis.dot(&coefficients) - targets;
    LeastSquares {
        coefficients,
        residual,
        solved: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_solves_every_column() {
        let basis = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        // columns: 2 + 3x and -1 + 0.5x
        let targets = array![[2.0, -1.0], [5.0, -0.5], [8.0, 0.0], [11.0, 0.5]];
        let result = solve(&basis, &targets);
        assert!(result.solved);
        assert_relative_eq!(result.coefficients[(0, 0)], 2.0, epsilon = 1e-10);
        assert_relative_eq!(result.coefficients[(1, 0)], 3.0, epsilon = 1e-10);
        assert_relative_eq!(result.coefficients[(0, 1)], -1.0, epsilon = 1e-10);
        assert_relative_eq!(result.coefficients[(1, 1)], 0.5, epsilon = 1e-10);
        for r in result.residual.iter() {
            assert!(r.abs() < 1e-10);
        }
    }

    #[test]
    fn test_singular_basis_falls_back_to_zero() {
        let basis = array![[1.0, 2.0], [1.0, 2.0], [1.0, 2.0]];
        let targets = array![[1.0], [2.0], [3.0]];
        let result = solve(&basis, &targets);
        assert!(!result.solved);
        assert!(result.coefficients.iter().all(|c| *c == 0.0));
        assert_eq!(result.residual, -&targets);
    }

    #[test]
    fn test_underdetermined_basis_falls_back_to_zero() {
        let basis = array![[1.0, 5.0]];
        let targets = array![[3.0, 4.0]];
        let result = solve(&basis, &targets);
        assert!(!result.solved);
        assert_eq!(result.coefficients.dim(), (2, 2));
    }
}
