use dyn_stack::{MemBuffer, MemStack};
use faer::diag::{Diag, DiagRef};
use faer::linalg::matmul::matmul;
use faer::linalg::solvers::{self, Solve};
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{Accum, Mat, MatMut, MatRef, Par, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Matrix is not square: {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("Matrix contains non-finite entries")]
    NonFinite,
    #[error("SVD failed to converge")]
    SvdNoConvergence,
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Sparse Cholesky factorization failed; matrix is not numerically positive definite")]
    SparseCholesky,
    #[error("Failed to assemble a {rows}x{cols} sparse matrix")]
    SparseCreation { rows: usize, cols: usize },
}

#[inline]
fn should_use_faer_matmul(m: usize, n: usize, k: usize) -> bool {
    // ndarray for tiny products, faer GEMM for moderate+ sizes.
    const MIN_DIM: usize = 32;
    const MIN_FLOP_SCALE: usize = 64 * 64;
    (m >= MIN_DIM || n >= MIN_DIM || k >= MIN_DIM)
        && m.saturating_mul(n).saturating_mul(k) >= MIN_FLOP_SCALE
}

#[inline]
fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];

    // SAFETY: dimensions and strides come straight from the live Array2, which
    // stays mutably borrowed for the lifetime of the returned view.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    let mut out = Array2::<f64>::zeros((mat.nrows(), mat.ncols()));
    for j in 0..mat.ncols() {
        for i in 0..mat.nrows() {
            out[[i, j]] = mat[(i, j)];
        }
    }
    out
}

fn diag_to_array(diag: DiagRef<'_, f64>) -> Array1<f64> {
    let mat = diag.column_vector().as_mat();
    let mut out = Array1::<f64>::zeros(mat.nrows());
    for i in 0..mat.nrows() {
        out[i] = mat[(i, 0)];
    }
    out
}

/// Borrowed faer view over an ndarray matrix. Layouts with non-positive strides
/// are copied into a compact owned buffer first.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: pointer, shape and strides either describe a live ndarray view
        // with positive strides or the owned copy held by this wrapper.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

/// Computes `AᵀB` for `A: n×p`, `B: n×q`.
///
/// The faer path always runs sequentially so the summation order (and with it
/// every bit of the result) does not depend on the size of the thread pool.
pub fn transpose_product<S1: Data<Elem = f64>, S2: Data<Elem = f64>>(
    a: &ArrayBase<S1, Ix2>,
    b: &ArrayBase<S2, Ix2>,
) -> Array2<f64> {
    let (n_a, p) = a.dim();
    let (n_b, q) = b.dim();
    debug_assert_eq!(n_a, n_b, "A and B must have the same number of rows");

    if !should_use_faer_matmul(p, q, n_a) {
        return a.t().dot(b);
    }

    let mut result = Mat::<f64>::zeros(p, q);
    let a_view = FaerArrayView::new(a);
    let b_view = FaerArrayView::new(b);
    matmul(
        result.as_mut(),
        Accum::Replace,
        a_view.as_ref().transpose(),
        b_view.as_ref(),
        1.0,
        Par::Seq,
    );
    mat_to_array(result.as_ref())
}

/// Computes the Gram matrix `AᵀA`.
#[inline]
pub fn gram<S: Data<Elem = f64>>(a: &ArrayBase<S, Ix2>) -> Array2<f64> {
    transpose_product(a, a)
}

/// Singular values of `matrix` in non-increasing order.
pub fn singular_values<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
) -> Result<Array1<f64>, FaerLinalgError> {
    if matrix.iter().any(|v| !v.is_finite()) {
        return Err(FaerLinalgError::NonFinite);
    }
    let faer_view = FaerArrayView::new(matrix);
    let faer_mat = faer_view.as_ref();
    let (rows, cols) = faer_mat.shape();
    let mut singular = Diag::<f64>::zeros(rows.min(cols));
    let par = Par::Seq;
    let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
        rows,
        cols,
        ComputeSvdVectors::No,
        ComputeSvdVectors::No,
        par,
        Default::default(),
    ));
    let stack = MemStack::new(&mut mem);
    svd::svd(
        faer_mat,
        singular.as_mut(),
        None,
        None,
        par,
        stack,
        Default::default(),
    )
    .map_err(|_| FaerLinalgError::SvdNoConvergence)?;

    let mut values = diag_to_array(singular.as_ref()).to_vec();
    values.sort_by(|a, b| b.total_cmp(a));
    Ok(Array1::from_vec(values))
}

/// Lower Cholesky factor of a symmetric positive-definite matrix; reused for
/// every right-hand side.
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl CholeskyFactor {
    pub fn new(matrix: &Array2<f64>) -> Result<Self, FaerLinalgError> {
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(FaerLinalgError::NotSquare { rows, cols });
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(FaerLinalgError::NonFinite);
        }
        let faer_view = FaerArrayView::new(matrix);
        let factor = faer_view
            .as_ref()
            .llt(Side::Lower)
            .map_err(FaerLinalgError::Cholesky)?;
        Ok(Self { factor })
    }

    /// Solves `M X = rhs` for all columns of `rhs` at once.
    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut out = rhs.to_owned();
        let mut out_view = array2_to_mat_mut(&mut out);
        self.factor.solve_in_place(out_view.as_mut());
        out
    }
}
