use crate::design::{DesignMatrix, LinearSystem};
use crate::linalg::{
    CholeskyFactor, FaerLinalgError, SparseCholeskyFactor, gram, one_norm, singular_values,
    symmetric_from_upper, transpose_product,
};
use crate::penalty::{identity_penalty, tensor_difference_penalty, tensor_difference_penalty_upper};
use crate::types::{PSPLINE_DIFFERENCE_ORDER, Smoothing};
use ndarray::{Array1, Array2, Axis};
use std::collections::BTreeMap;
use thiserror::Error;

/// Relative rank tolerance multiplier applied to `p · ε · σ_max`.
const RANK_TOL_FACTOR: f64 = 64.0;
/// Condition estimate above which a full-rank system is reported as fragile.
const CONDITION_WARN_THRESHOLD: f64 = 1e12;

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Regularization factor alpha must be finite and non-negative, got {0}.")]
    InvalidAlpha(f64),

    #[error("Coefficient layout has {found} entries but the design matrix has {expected} columns.")]
    ShapeMismatch { expected: usize, found: usize },

    #[error(
        "Basis function {column} has no support in the data and is not penalized; add samples, reduce the basis-function count, or use P-spline smoothing."
    )]
    EmptySupport { column: usize },

    #[error(
        "Least-squares system is rank deficient (numerical rank {rank} of {columns}); add samples, reduce the basis-function count, or increase regularization."
    )]
    RankDeficient { rank: usize, columns: usize },

    #[error(
        "Least-squares system is numerically singular (condition estimate {condition_estimate:.3e}); add samples, reduce the basis-function count, or increase regularization."
    )]
    Singular { condition_estimate: f64 },

    #[error("Linear algebra backend failed: {0}")]
    Linalg(#[from] FaerLinalgError),
}

/// `AᵀA` stored to match the design it came from.
#[derive(Debug, Clone)]
pub enum NormalMatrix {
    Dense(Array2<f64>),
    /// Upper triangle keyed by `(row, col)` with `row <= col`; only pairs of
    /// basis functions that share a sample are present.
    SparseUpper(BTreeMap<(usize, usize), f64>),
}

/// Forms `AᵀA` and `AᵀB`. Sparse designs are accumulated row by row in row
/// order so the result is independent of how the rows were produced.
pub fn normal_equations(design: &DesignMatrix, targets: &Array2<f64>) -> (NormalMatrix, Array2<f64>) {
    match design {
        DesignMatrix::Dense(a) => (NormalMatrix::Dense(gram(a)), transpose_product(a, targets)),
        DesignMatrix::Sparse(_) => {
            let mut upper = BTreeMap::new();
            let mut rhs = Array2::<f64>::zeros((design.ncols(), targets.ncols()));
            design.for_each_row(|row, entries| {
                let target = targets.row(row);
                for (pos, &(i, vi)) in entries.iter().enumerate() {
                    for &(j, vj) in &entries[pos..] {
                        *upper.entry((i, j)).or_insert(0.0) += vi * vj;
                    }
                    rhs.row_mut(i).scaled_add(vi, &target);
                }
            });
            (NormalMatrix::SparseUpper(upper), rhs)
        }
    }
}

/// Solves the (optionally regularized) least-squares problem
/// `min ||A c - B||² + alpha cᵀ P c` for every column of `B`.
///
/// `basis_shape` is the per-dimension basis-function count used to lay out the
/// P-spline difference penalty. Returns the `p × dim_y` coefficient matrix.
///
/// A dense design goes through a dense Cholesky factorization guarded by an
/// SVD rank check. A sparse design keeps `AᵀA + alpha P` sparse, factors it
/// with a sparse Cholesky and rejects it when the 1-norm condition estimate
/// exceeds what double precision can resolve.
pub fn solve(
    system: &LinearSystem,
    smoothing: Smoothing,
    alpha: f64,
    basis_shape: &[usize],
) -> Result<Array2<f64>, SolverError> {
    if !alpha.is_finite() || alpha < 0.0 {
        return Err(SolverError::InvalidAlpha(alpha));
    }
    let p = system.design.ncols();
    let layout: usize = basis_shape.iter().product();
    if layout != p {
        return Err(SolverError::ShapeMismatch {
            expected: p,
            found: layout,
        });
    }
    let penalty_weight = if smoothing.is_regularized() { alpha } else { 0.0 };

    let (normal, rhs) = normal_equations(&system.design, &system.targets);
    match normal {
        NormalMatrix::Dense(normal) => {
            solve_dense(normal, rhs, smoothing, penalty_weight, basis_shape)
        }
        NormalMatrix::SparseUpper(upper) => {
            solve_sparse(upper, rhs, smoothing, penalty_weight, basis_shape)
        }
    }
}

/// Jacobi scaling `diag(N)^{-1/2}`; a non-positive diagonal means the column
/// is neither supported by data nor penalized.
fn jacobi_scales(diagonal: impl Iterator<Item = f64>) -> Result<Array1<f64>, SolverError> {
    diagonal
        .enumerate()
        .map(|(column, d)| {
            if d <= 0.0 || !d.is_finite() {
                Err(SolverError::EmptySupport { column })
            } else {
                Ok(d.sqrt().recip())
            }
        })
        .collect()
}

fn scale_rows(matrix: &mut Array2<f64>, scale: &Array1<f64>) {
    for (mut row, &s) in matrix.axis_iter_mut(Axis(0)).zip(scale.iter()) {
        row *= s;
    }
}

fn report_condition(condition: f64) {
    if condition > CONDITION_WARN_THRESHOLD {
        log::warn!(
            "least-squares system is poorly conditioned (condition estimate {condition:.3e}); \
             consider fewer basis functions or stronger regularization"
        );
    } else {
        log::debug!("equilibrated normal matrix condition estimate {condition:.3e}");
    }
}

fn solve_dense(
    mut normal: Array2<f64>,
    mut rhs: Array2<f64>,
    smoothing: Smoothing,
    penalty_weight: f64,
    basis_shape: &[usize],
) -> Result<Array2<f64>, SolverError> {
    let p = normal.nrows();
    if penalty_weight > 0.0 {
        let penalty = match smoothing {
            Smoothing::Identity => identity_penalty(p),
            Smoothing::PSpline => tensor_difference_penalty(basis_shape, PSPLINE_DIFFERENCE_ORDER),
            Smoothing::None => Array2::zeros((p, p)),
        };
        normal.scaled_add(penalty_weight, &penalty);
    }

    // Jacobi equilibration: solve (S N S) y = S R, then c = S y.
    let scale = jacobi_scales(normal.diag().iter().copied())?;
    for ((i, j), v) in normal.indexed_iter_mut() {
        *v *= scale[i] * scale[j];
    }

    let sigma = singular_values(&normal)?;
    let sigma_max = sigma.iter().next().copied().unwrap_or(0.0);
    let tol = p as f64 * f64::EPSILON * sigma_max * RANK_TOL_FACTOR;
    let rank = sigma.iter().filter(|&&s| s > tol).count();
    if rank < p {
        log::debug!("rank check failed: rank {rank} of {p}, tolerance {tol:.3e}");
        return Err(SolverError::RankDeficient { rank, columns: p });
    }
    let sigma_min = sigma.iter().last().copied().unwrap_or(0.0);
    report_condition(sigma_max / sigma_min);

    scale_rows(&mut rhs, &scale);
    let factor = CholeskyFactor::new(&normal)?;
    let mut coefficients = factor.solve_mat(&rhs);
    scale_rows(&mut coefficients, &scale);
    Ok(coefficients)
}

fn solve_sparse(
    mut upper: BTreeMap<(usize, usize), f64>,
    mut rhs: Array2<f64>,
    smoothing: Smoothing,
    penalty_weight: f64,
    basis_shape: &[usize],
) -> Result<Array2<f64>, SolverError> {
    let p = rhs.nrows();
    if penalty_weight > 0.0 {
        let penalty = match smoothing {
            Smoothing::Identity => (0..p).map(|i| (i, i, 1.0)).collect(),
            Smoothing::PSpline => {
                tensor_difference_penalty_upper(basis_shape, PSPLINE_DIFFERENCE_ORDER)
            }
            Smoothing::None => Vec::new(),
        };
        for (row, col, v) in penalty {
            *upper.entry((row, col)).or_insert(0.0) += penalty_weight * v;
        }
    }

    let scale = jacobi_scales((0..p).map(|j| upper.get(&(j, j)).copied().unwrap_or(0.0)))?;
    let entries: Vec<(usize, usize, f64)> = upper
        .into_iter()
        .map(|((row, col), v)| (row, col, v * scale[row] * scale[col]))
        .collect();
    log::debug!(
        "sparse normal matrix: {p} columns, {} upper-triangle entries",
        entries.len()
    );
    let normal = symmetric_from_upper(p, &entries)?;

    let factor = match SparseCholeskyFactor::new(&normal) {
        Ok(factor) => factor,
        Err(FaerLinalgError::SparseCholesky) => {
            log::debug!("sparse Cholesky hit a non-positive pivot");
            return Err(SolverError::Singular {
                condition_estimate: f64::INFINITY,
            });
        }
        Err(err) => return Err(err.into()),
    };
    // Same resolution limit as the dense rank tolerance: σ_min > p·ε·σ_max·64.
    let condition = one_norm(&normal) * factor.inverse_one_norm_estimate();
    let limit = (p as f64 * f64::EPSILON * RANK_TOL_FACTOR).recip();
    if !condition.is_finite() || condition > limit {
        return Err(SolverError::Singular {
            condition_estimate: condition,
        });
    }
    report_condition(condition);

    scale_rows(&mut rhs, &scale);
    let mut coefficients = factor.solve_mat(&rhs);
    scale_rows(&mut coefficients, &scale);
    Ok(coefficients)
}

/// Sum over samples and outputs of the squared (weighted) residuals
/// `||A C - B||²`.
pub fn residual_sum_of_squares(
    system: &LinearSystem,
    coefficients: &Array2<f64>,
) -> Result<f64, SolverError> {
    if coefficients.nrows() != system.design.ncols() {
        return Err(SolverError::ShapeMismatch {
            expected: system.design.ncols(),
            found: coefficients.nrows(),
        });
    }
    let fitted = system.design.dot(coefficients);
    Ok(fitted
        .iter()
        .zip(system.targets.iter())
        .map(|(f, y)| (f - y) * (f - y))
        .sum())
}
