use crate::basis::{BasisError, TensorBasis, TensorScratch};
use crate::data::DataTable;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::ParallelSlice;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::sync::OnceLock;
use thiserror::Error;

/// Row count from which basis rows are evaluated on the thread pool.
const PAR_THRESHOLD: usize = 256;
const CHUNK_SIZE: usize = 1024;

fn bspline_thread_pool() -> Option<&'static ThreadPool> {
    static POOL: OnceLock<Option<ThreadPool>> = OnceLock::new();
    POOL.get_or_init(|| {
        ThreadPoolBuilder::new()
            .thread_name(|i| format!("bspline-fit-{i}"))
            .build()
            .ok()
    })
    .as_ref()
}

/// Runs `op` on the crate's thread pool, or on the caller's thread when the
/// pool could not be created.
pub(crate) fn run_in_pool<R, F>(op: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match bspline_thread_pool() {
        Some(pool) => pool.install(op),
        None => op(),
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DesignError {
    #[error(transparent)]
    Basis(#[from] BasisError),

    #[error("Cannot assemble a least-squares system from an empty sample table.")]
    EmptyData,

    #[error("Samples have {found} input dimensions but the basis expects {expected}.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Got {found} weights for {expected} samples.")]
    WeightLengthMismatch { expected: usize, found: usize },

    #[error("Weight {index} is {value}; weights must be finite and non-negative.")]
    InvalidWeight { index: usize, value: f64 },

    #[error("Failed to build sparse design matrix: {0}")]
    SparseCreation(String),
}

/// Basis-function values of every sample, one row per sample and one column
/// per multivariate basis function.
#[derive(Debug, Clone)]
pub enum DesignMatrix {
    Dense(Array2<f64>),
    Sparse(SparseColMat<usize, f64>),
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            DesignMatrix::Dense(m) => m.nrows(),
            DesignMatrix::Sparse(m) => m.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            DesignMatrix::Dense(m) => m.ncols(),
            DesignMatrix::Sparse(m) => m.ncols(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, DesignMatrix::Sparse(_))
    }

    /// Number of stored non-zero entries.
    pub fn nnz(&self) -> usize {
        match self {
            DesignMatrix::Dense(m) => m.iter().filter(|v| **v != 0.0).count(),
            DesignMatrix::Sparse(m) => {
                let (_, values) = m.parts();
                values.iter().filter(|v| **v != 0.0).count()
            }
        }
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            DesignMatrix::Dense(m) => m.clone(),
            DesignMatrix::Sparse(sparse) => {
                let mut dense = Array2::<f64>::zeros((sparse.nrows(), sparse.ncols()));
                let (symbolic, values) = sparse.parts();
                let col_ptr = symbolic.col_ptr();
                let row_idx = symbolic.row_idx();
                for col in 0..sparse.ncols() {
                    for idx in col_ptr[col]..col_ptr[col + 1] {
                        dense[[row_idx[idx], col]] += values[idx];
                    }
                }
                dense
            }
        }
    }

    /// Calls `f(row, entries)` for every row in order, with the row's non-zero
    /// `(column, value)` pairs sorted by column.
    pub fn for_each_row<F>(&self, mut f: F)
    where
        F: FnMut(usize, &[(usize, f64)]),
    {
        match self {
            DesignMatrix::Dense(m) => {
                let mut entries = Vec::new();
                for (row_idx, row) in m.axis_iter(Axis(0)).enumerate() {
                    entries.clear();
                    entries.extend(
                        row.iter()
                            .enumerate()
                            .filter(|(_, v)| **v != 0.0)
                            .map(|(col, &v)| (col, v)),
                    );
                    f(row_idx, &entries);
                }
            }
            DesignMatrix::Sparse(sparse) => {
                let nrows = sparse.nrows();
                let (symbolic, values) = sparse.parts();
                let col_ptr = symbolic.col_ptr();
                let row_idx = symbolic.row_idx();

                // Transpose CSC into row-major order; columns stay ascending
                // inside each row because they are visited in order.
                let mut row_ptr = vec![0usize; nrows + 1];
                for &r in row_idx {
                    row_ptr[r + 1] += 1;
                }
                for r in 0..nrows {
                    row_ptr[r + 1] += row_ptr[r];
                }
                let mut next = row_ptr.clone();
                let mut entries = vec![(0usize, 0.0f64); row_idx.len()];
                for col in 0..sparse.ncols() {
                    for idx in col_ptr[col]..col_ptr[col + 1] {
                        let r = row_idx[idx];
                        entries[next[r]] = (col, values[idx]);
                        next[r] += 1;
                    }
                }
                for r in 0..nrows {
                    f(r, &entries[row_ptr[r]..row_ptr[r + 1]]);
                }
            }
        }
    }

    /// `A C` for a `ncols × k` coefficient matrix.
    pub fn dot(&self, coefficients: &Array2<f64>) -> Array2<f64> {
        match self {
            DesignMatrix::Dense(m) => m.dot(coefficients),
            DesignMatrix::Sparse(sparse) => {
                let mut out = Array2::<f64>::zeros((sparse.nrows(), coefficients.ncols()));
                let (symbolic, values) = sparse.parts();
                let col_ptr = symbolic.col_ptr();
                let row_idx = symbolic.row_idx();
                for col in 0..sparse.ncols() {
                    let coef_row = coefficients.row(col);
                    for idx in col_ptr[col]..col_ptr[col + 1] {
                        out.row_mut(row_idx[idx])
                            .scaled_add(values[idx], &coef_row);
                    }
                }
                out
            }
        }
    }
}

/// Weighted least-squares system `A c ≈ B` with rows already scaled by the
/// square roots of the sample weights.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    pub design: DesignMatrix,
    /// `n × dim_y` right-hand sides, one column per output dimension.
    pub targets: Array2<f64>,
}

/// Returns true if the design matrix should be stored sparse, based on the
/// share of columns a single row can touch.
pub fn should_use_sparse_design(total_basis: usize, support_per_row: usize) -> bool {
    if total_basis == 0 {
        return false;
    }
    let density = support_per_row as f64 / total_basis as f64;
    density < 0.20 && total_basis > 32
}

/// Checks one finite, non-negative weight per sample.
pub(crate) fn check_weights(weights: ArrayView1<'_, f64>, num_samples: usize) -> Result<(), DesignError> {
    if weights.len() != num_samples {
        return Err(DesignError::WeightLengthMismatch {
            expected: num_samples,
            found: weights.len(),
        });
    }
    if let Some((index, &value)) = weights
        .iter()
        .enumerate()
        .find(|(_, w)| !w.is_finite() || **w < 0.0)
    {
        return Err(DesignError::InvalidWeight { index, value });
    }
    Ok(())
}

fn weight_scales(
    weights: Option<ArrayView1<'_, f64>>,
    num_samples: usize,
) -> Result<Option<Array1<f64>>, DesignError> {
    let Some(weights) = weights else {
        return Ok(None);
    };
    check_weights(weights, num_samples)?;
    Ok(Some(weights.mapv(f64::sqrt)))
}

/// Evaluates the tensor-product basis at every sample and returns the
/// (optionally weighted) least-squares system.
pub fn assemble_system(
    data: &DataTable,
    basis: &TensorBasis,
    weights: Option<ArrayView1<'_, f64>>,
) -> Result<LinearSystem, DesignError> {
    if data.is_empty() {
        return Err(DesignError::EmptyData);
    }
    if data.dim_x() != basis.dim() {
        return Err(DesignError::DimensionMismatch {
            expected: basis.dim(),
            found: data.dim_x(),
        });
    }
    let nrows = data.num_samples();
    let scales = weight_scales(weights, nrows)?;
    let scale_of = |row: usize| scales.as_ref().map_or(1.0, |s| s[row]);

    let points: Vec<&[f64]> = data.samples().map(|s| s.x()).collect();
    let total = basis.total_basis_functions();
    let use_sparse = should_use_sparse_design(total, basis.support_size());
    log::debug!(
        "assembling {} design matrix: {} rows x {} columns (support {} per row)",
        if use_sparse { "sparse" } else { "dense" },
        nrows,
        total,
        basis.support_size()
    );

    let design = if use_sparse {
        DesignMatrix::Sparse(assemble_sparse(&points, basis, &scale_of)?)
    } else {
        DesignMatrix::Dense(assemble_dense(&points, basis, &scale_of)?)
    };

    let mut targets = data.y_matrix();
    if let Some(scales) = &scales {
        for (mut row, &s) in targets.axis_iter_mut(Axis(0)).zip(scales.iter()) {
            row *= s;
        }
    }

    Ok(LinearSystem { design, targets })
}

fn assemble_dense<W>(
    points: &[&[f64]],
    basis: &TensorBasis,
    scale_of: &W,
) -> Result<Array2<f64>, DesignError>
where
    W: Fn(usize) -> f64 + Sync,
{
    let mut design = Array2::zeros((points.len(), basis.total_basis_functions()));

    if points.len() >= PAR_THRESHOLD {
        run_in_pool(|| {
            design
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(points.par_iter())
                .enumerate()
                .try_for_each_init(
                    || TensorScratch::new(basis),
                    |scratch, (row_idx, (mut row, x))| {
                        let scale = scale_of(row_idx);
                        basis.for_each_nonzero(x, None, scratch, |col, v| row[col] = scale * v)
                    },
                )
        })?;
    } else {
        let mut scratch = TensorScratch::new(basis);
        for (row_idx, (mut row, x)) in design.axis_iter_mut(Axis(0)).zip(points).enumerate() {
            let scale = scale_of(row_idx);
            basis.for_each_nonzero(x, None, &mut scratch, |col, v| row[col] = scale * v)?;
        }
    }

    Ok(design)
}

fn assemble_sparse<W>(
    points: &[&[f64]],
    basis: &TensorBasis,
    scale_of: &W,
) -> Result<SparseColMat<usize, f64>, DesignError>
where
    W: Fn(usize) -> f64 + Sync,
{
    let nrows = points.len();
    let support = basis.support_size();

    let fill_rows = |scratch: &mut TensorScratch,
                     row_start: usize,
                     rows: &[&[f64]]|
     -> Result<Vec<Triplet<usize, usize, f64>>, BasisError> {
        let mut local = Vec::with_capacity(rows.len().saturating_mul(support));
        for (offset, x) in rows.iter().enumerate() {
            let row_idx = row_start + offset;
            let scale = scale_of(row_idx);
            basis.for_each_nonzero(x, None, scratch, |col, v| {
                local.push(Triplet::new(row_idx, col, scale * v))
            })?;
        }
        Ok(local)
    };

    let triplets: Vec<Triplet<usize, usize, f64>> = if nrows >= PAR_THRESHOLD {
        let chunks: Vec<Vec<Triplet<usize, usize, f64>>> = run_in_pool(|| {
            points
                .par_chunks(CHUNK_SIZE)
                .enumerate()
                .map_init(
                    || TensorScratch::new(basis),
                    |scratch, (chunk_idx, chunk)| {
                        fill_rows(scratch, chunk_idx * CHUNK_SIZE, chunk)
                    },
                )
                .collect::<Result<Vec<_>, BasisError>>()
        })?;
        chunks.into_iter().flatten().collect()
    } else {
        let mut scratch = TensorScratch::new(basis);
        fill_rows(&mut scratch, 0, points)?
    };

    SparseColMat::try_new_from_triplets(nrows, basis.total_basis_functions(), &triplets)
        .map_err(|err| DesignError::SparseCreation(format!("{err:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn linear_basis() -> TensorBasis {
        TensorBasis::new(vec![array![0.0, 0.0, 1.0, 2.0, 2.0]], vec![1]).unwrap()
    }

    fn table(points: &[(f64, f64)]) -> DataTable {
        let mut data = DataTable::new();
        for &(x, y) in points {
            data.add_sample_scalar(x, y).unwrap();
        }
        data
    }

    #[test]
    fn rows_hold_basis_values_and_targets_follow_samples() {
        let data = table(&[(0.0, 1.0), (0.5, 2.0), (2.0, 3.0)]);
        let system = assemble_system(&data, &linear_basis(), None).unwrap();
        let a = system.design.to_dense();
        assert_eq!(a.shape(), &[3, 3]);
        assert_abs_diff_eq!(a[[0, 0]], 1.0);
        assert_abs_diff_eq!(a[[1, 0]], 0.5);
        assert_abs_diff_eq!(a[[1, 1]], 0.5);
        assert_abs_diff_eq!(a[[2, 2]], 1.0);
        assert_eq!(system.targets.column(0).to_vec(), vec![1.0, 2.0, 3.0]);
        for row in a.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-14);
        }
    }

    #[test]
    fn weights_scale_rows_by_square_root() {
        let data = table(&[(0.0, 1.0), (0.5, 2.0)]);
        let weights = array![4.0, 0.25];
        let system = assemble_system(&data, &linear_basis(), Some(weights.view())).unwrap();
        let a = system.design.to_dense();
        assert_abs_diff_eq!(a[[0, 0]], 2.0);
        assert_abs_diff_eq!(a[[1, 1]], 0.25);
        assert_abs_diff_eq!(system.targets[[0, 0]], 2.0);
        assert_abs_diff_eq!(system.targets[[1, 0]], 1.0);
    }

    #[test]
    fn weight_validation() {
        let data = table(&[(0.0, 1.0), (0.5, 2.0)]);
        let basis = linear_basis();
        let short = array![1.0];
        assert_eq!(
            assemble_system(&data, &basis, Some(short.view())).unwrap_err(),
            DesignError::WeightLengthMismatch {
                expected: 2,
                found: 1
            }
        );
        let negative = array![1.0, -1.0];
        assert!(matches!(
            assemble_system(&data, &basis, Some(negative.view())),
            Err(DesignError::InvalidWeight { index: 1, .. })
        ));
        let nan = array![f64::NAN, 1.0];
        assert!(matches!(
            assemble_system(&data, &basis, Some(nan.view())),
            Err(DesignError::InvalidWeight { index: 0, .. })
        ));
    }

    #[test]
    fn dimension_mismatch_is_rejected_before_assembly() {
        let mut data = DataTable::new();
        data.add_sample(vec![0.0, 1.0], vec![1.0]).unwrap();
        assert_eq!(
            assemble_system(&data, &linear_basis(), None).unwrap_err(),
            DesignError::DimensionMismatch {
                expected: 1,
                found: 2
            }
        );
        assert_eq!(
            assemble_system(&DataTable::new(), &linear_basis(), None).unwrap_err(),
            DesignError::EmptyData
        );
    }

    #[test]
    fn sparse_and_parallel_paths_match_sequential_dense() {
        // 60 linear basis functions gives density 2/60, so storage is sparse.
        let interior: Vec<f64> = (1..59).map(|i| i as f64 / 59.0).collect();
        let mut knots = vec![0.0, 0.0];
        knots.extend(interior);
        knots.extend([1.0, 1.0]);
        let basis = TensorBasis::new(vec![Array1::from(knots)], vec![1]).unwrap();
        assert!(should_use_sparse_design(basis.total_basis_functions(), 2));

        let n = 700;
        let data = table(
            &(0..n)
                .map(|i| {
                    let x = i as f64 / (n - 1) as f64;
                    (x, (3.0 * x).sin())
                })
                .collect::<Vec<_>>(),
        );
        let system = assemble_system(&data, &basis, None).unwrap();
        assert!(system.design.is_sparse());
        assert_eq!(system.design.nrows(), n);

        let points: Vec<&[f64]> = data.samples().map(|s| s.x()).collect();
        let mut reference = Array2::zeros((n, basis.total_basis_functions()));
        let mut scratch = TensorScratch::new(&basis);
        for (row, x) in points.iter().enumerate() {
            basis
                .for_each_nonzero(x, None, &mut scratch, |col, v| reference[[row, col]] = v)
                .unwrap();
        }
        assert_eq!(system.design.to_dense(), reference);

        let dense = assemble_dense(&points, &basis, &|_| 1.0).unwrap();
        assert_eq!(dense, reference);
    }

    #[test]
    fn row_iteration_and_product_agree_across_storage() {
        let interior: Vec<f64> = (1..39).map(|i| i as f64 / 39.0).collect();
        let mut knots = vec![0.0, 0.0];
        knots.extend(interior);
        knots.extend([1.0, 1.0]);
        let basis = TensorBasis::new(vec![Array1::from(knots)], vec![1]).unwrap();
        let data = table(
            &(0..50)
                .map(|i| (i as f64 / 49.0, i as f64))
                .collect::<Vec<_>>(),
        );
        let system = assemble_system(&data, &basis, None).unwrap();
        assert!(system.design.is_sparse());
        let dense = DesignMatrix::Dense(system.design.to_dense());

        let coefficients = Array2::from_shape_fn((40, 2), |(i, j)| (i * (j + 1)) as f64);
        let sparse_product = system.design.dot(&coefficients);
        let dense_product = dense.dot(&coefficients);
        assert_abs_diff_eq!(
            sparse_product.as_slice().unwrap(),
            dense_product.as_slice().unwrap(),
            epsilon = 1e-12
        );

        let mut sparse_rows = Vec::new();
        system
            .design
            .for_each_row(|r, entries| sparse_rows.push((r, entries.to_vec())));
        let mut dense_rows = Vec::new();
        dense.for_each_row(|r, entries| dense_rows.push((r, entries.to_vec())));
        assert_eq!(sparse_rows, dense_rows);
        assert_eq!(system.design.nnz(), dense.nnz());
    }
}
