use super::faer_ndarray::{FaerArrayView, FaerLinalgError};
use faer::Side;
use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::Llt as SparseLlt;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::Array2;

/// Iterations of the inverse 1-norm estimator; it usually settles in two.
const NORM_ESTIMATE_ITERS: usize = 5;

/// Full symmetric CSC matrix from unique upper-triangle entries
/// `(row, col, value)` with `row <= col`.
pub fn symmetric_from_upper(
    n: usize,
    upper: &[(usize, usize, f64)],
) -> Result<SparseColMat<usize, f64>, FaerLinalgError> {
    let mut triplets = Vec::with_capacity(2 * upper.len());
    for &(row, col, value) in upper {
        if !value.is_finite() {
            return Err(FaerLinalgError::NonFinite);
        }
        triplets.push(Triplet::new(row, col, value));
        if row != col {
            triplets.push(Triplet::new(col, row, value));
        }
    }
    SparseColMat::try_new_from_triplets(n, n, &triplets)
        .map_err(|_| FaerLinalgError::SparseCreation { rows: n, cols: n })
}

/// Largest absolute column sum.
pub fn one_norm(matrix: &SparseColMat<usize, f64>) -> f64 {
    let (symbolic, values) = matrix.parts();
    let col_ptr = symbolic.col_ptr();
    (0..matrix.ncols())
        .map(|col| {
            values[col_ptr[col]..col_ptr[col + 1]]
                .iter()
                .map(|v| v.abs())
                .sum::<f64>()
        })
        .fold(0.0, f64::max)
}

/// Sparse LLᵀ of a symmetric positive-definite matrix, with a fill-reducing
/// ordering chosen by faer; reused for every right-hand side.
pub struct SparseCholeskyFactor {
    factor: SparseLlt<usize, f64>,
    n: usize,
}

impl SparseCholeskyFactor {
    pub fn new(matrix: &SparseColMat<usize, f64>) -> Result<Self, FaerLinalgError> {
        let (rows, cols) = (matrix.nrows(), matrix.ncols());
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        let factor = matrix
            .as_ref()
            .sp_cholesky(Side::Upper)
            .map_err(|_| FaerLinalgError::SparseCholesky)?;
        Ok(Self { factor, n: rows })
    }

    /// Solves `M X = rhs` for all columns of `rhs` at once.
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let rhs_view = FaerArrayView::new(rhs);
        let out = self.factor.solve(rhs_view.as_ref());
        Array2::from_shape_fn(rhs.dim(), |(i, j)| out[(i, j)])
    }

    /// Lower bound on `||M⁻¹||₁` from Hager's estimator, using two solves per
    /// iteration. `M` is symmetric, so `M⁻ᵀ` solves reuse the same factor.
    pub fn inverse_one_norm_estimate(&self) -> f64 {
        let n = self.n;
        if n == 0 {
            return 0.0;
        }
        let mut x = Array2::from_elem((n, 1), 1.0 / n as f64);
        let mut estimate = 0.0;
        for _ in 0..NORM_ESTIMATE_ITERS {
            let y = self.solve_mat(&x);
            let norm: f64 = y.iter().map(|v| v.abs()).sum();
            if !norm.is_finite() {
                return f64::INFINITY;
            }
            estimate = f64::max(estimate, norm);

            let signs = y.mapv(|v| if v >= 0.0 { 1.0 } else { -1.0 });
            let z = self.solve_mat(&signs);
            let (best, z_max) = z
                .iter()
                .map(|v| v.abs())
                .enumerate()
                .fold((0, 0.0), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc });
            let z_dot_x: f64 = z.iter().zip(x.iter()).map(|(a, b)| a * b).sum();
            if z_max <= z_dot_x {
                break;
            }
            x.fill(0.0);
            x[[best, 0]] = 1.0;
        }
        estimate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn tridiagonal(n: usize, diag: f64, off: f64) -> Vec<(usize, usize, f64)> {
        let mut upper = Vec::new();
        for i in 0..n {
            upper.push((i, i, diag));
            if i + 1 < n {
                upper.push((i, i + 1, off));
            }
        }
        upper
    }

    #[test]
    fn mirrors_the_upper_triangle() {
        let m = symmetric_from_upper(3, &[(0, 0, 2.0), (0, 2, -1.0), (1, 1, 3.0), (2, 2, 4.0)])
            .unwrap();
        let (symbolic, values) = m.parts();
        let col_ptr = symbolic.col_ptr();
        let row_idx = symbolic.row_idx();
        let mut dense = Array2::<f64>::zeros((3, 3));
        for col in 0..3 {
            for idx in col_ptr[col]..col_ptr[col + 1] {
                dense[[row_idx[idx], col]] = values[idx];
            }
        }
        assert_eq!(dense, array![[2.0, 0.0, -1.0], [0.0, 3.0, 0.0], [-1.0, 0.0, 4.0]]);
        assert_abs_diff_eq!(one_norm(&m), 5.0, epsilon = 1e-15);
    }

    #[test]
    fn rejects_non_finite_entries() {
        assert!(matches!(
            symmetric_from_upper(2, &[(0, 0, f64::INFINITY), (1, 1, 1.0)]),
            Err(FaerLinalgError::NonFinite)
        ));
    }

    #[test]
    fn solves_multiple_right_hand_sides() {
        let n = 50;
        let m = symmetric_from_upper(n, &tridiagonal(n, 4.0, -1.0)).unwrap();
        let factor = SparseCholeskyFactor::new(&m).unwrap();
        let rhs = Array2::from_shape_fn((n, 2), |(i, j)| (i as f64 * 0.3).sin() + j as f64);
        let x = factor.solve_mat(&rhs);
        for j in 0..2 {
            for i in 0..n {
                let mut back = 4.0 * x[[i, j]];
                if i > 0 {
                    back -= x[[i - 1, j]];
                }
                if i + 1 < n {
                    back -= x[[i + 1, j]];
                }
                assert_abs_diff_eq!(back, rhs[[i, j]], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn inverse_norm_estimate_tracks_conditioning() {
        // diag(1, 1e-9): ||M⁻¹||₁ = 1e9.
        let m = symmetric_from_upper(2, &[(0, 0, 1.0), (1, 1, 1e-9)]).unwrap();
        let factor = SparseCholeskyFactor::new(&m).unwrap();
        let estimate = factor.inverse_one_norm_estimate();
        assert!(estimate > 1e8 && estimate <= 1e9 * (1.0 + 1e-12), "{estimate}");

        let well = symmetric_from_upper(40, &tridiagonal(40, 4.0, -1.0)).unwrap();
        let estimate = SparseCholeskyFactor::new(&well)
            .unwrap()
            .inverse_one_norm_estimate();
        assert!(estimate > 0.25 && estimate < 1.0, "{estimate}");
    }

    #[test]
    fn indefinite_matrix_fails_to_factor() {
        let m = symmetric_from_upper(2, &[(0, 0, 1.0), (0, 1, 2.0), (1, 1, 1.0)]).unwrap();
        assert!(matches!(
            SparseCholeskyFactor::new(&m),
            Err(FaerLinalgError::SparseCholesky)
        ));
    }
}
