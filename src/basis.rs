use crate::knots::{KnotError, num_basis_functions, validate_knot_vector};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Knot spans narrower than this are treated as empty in the recursions.
const ZERO_SPAN_TOL: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BasisError {
    #[error(transparent)]
    InvalidKnots(#[from] KnotError),

    #[error("A tensor-product basis needs at least one input dimension.")]
    NoDimensions,

    #[error(
        "Got {knot_vectors} knot vectors but {degrees} degrees; one of each is needed per input dimension."
    )]
    ShapeMismatch { knot_vectors: usize, degrees: usize },

    #[error("Point has {found} coordinates but the basis has {expected} input dimensions.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Tensor-product basis is too large: the basis-function count overflows usize.")]
    TooLarge,
}

/// Scratch buffers for span-local evaluation, reused across points.
#[derive(Clone, Debug)]
pub struct BsplineScratch {
    left: Vec<f64>,
    right: Vec<f64>,
    lower: Vec<f64>,
}

impl BsplineScratch {
    pub fn new(degree: usize) -> Self {
        let len = degree + 1;
        Self {
            left: vec![0.0; len],
            right: vec![0.0; len],
            lower: vec![0.0; len],
        }
    }

    fn ensure_degree(&mut self, degree: usize) {
        let len = degree + 1;
        if self.left.len() < len {
            self.left.resize(len, 0.0);
            self.right.resize(len, 0.0);
            self.lower.resize(len, 0.0);
        }
    }
}

/// Index `mu` of the knot span `[t_mu, t_mu+1)` used to evaluate at `x`.
///
/// `x` at or beyond the upper boundary maps to the last non-empty span, so the
/// last basis function is 1 at the right end of the domain. Points outside the
/// domain map to the boundary spans and extrapolate their polynomial pieces.
#[inline]
pub fn find_span(knots: ArrayView1<'_, f64>, degree: usize, x: f64) -> usize {
    let num_basis = num_basis_functions(knots, degree);
    if x >= knots[num_basis] {
        return num_basis - 1;
    }
    if x < knots[degree] {
        return degree;
    }
    // Largest mu in [degree, num_basis - 1] with knots[mu] <= x.
    let mut low = degree;
    let mut high = num_basis;
    while high - low > 1 {
        let mid = (low + high) / 2;
        if x < knots[mid] {
            high = mid;
        } else {
            low = mid;
        }
    }
    low
}

/// Cox-de Boor triangle (NURBS Book A2.2) for the `degree + 1` functions that
/// are non-zero on span `mu`, written to `out[..=degree]`.
#[inline]
fn basis_functions_on_span(
    mu: usize,
    x: f64,
    degree: usize,
    knots: ArrayView1<'_, f64>,
    out: &mut [f64],
    left: &mut [f64],
    right: &mut [f64],
) {
    out[0] = 1.0;
    for d in 1..=degree {
        left[d] = x - knots[mu + 1 - d];
        right[d] = knots[mu + d] - x;

        let mut saved = 0.0;
        for r in 0..d {
            let den = right[r + 1] + left[d - r];
            let temp = if den.abs() > ZERO_SPAN_TOL {
                out[r] / den
            } else {
                0.0
            };
            out[r] = saved + right[r + 1] * temp;
            saved = left[d - r] * temp;
        }
        out[d] = saved;
    }
}

/// Evaluates the non-zero basis values at `x` into `values` (length `degree + 1`).
/// Returns the index of the first of them.
#[inline]
pub fn evaluate_sparse_into(
    x: f64,
    degree: usize,
    knots: ArrayView1<'_, f64>,
    values: &mut [f64],
    scratch: &mut BsplineScratch,
) -> usize {
    debug_assert_eq!(values.len(), degree + 1);
    scratch.ensure_degree(degree);
    let mu = find_span(knots, degree, x);
    basis_functions_on_span(
        mu,
        x,
        degree,
        knots,
        values,
        &mut scratch.left,
        &mut scratch.right,
    );
    mu - degree
}

/// Evaluates the `order`-th derivative of the non-zero basis functions at `x`.
///
/// Starts from the degree `degree - order` functions on the same span and
/// applies the derivative recursion
/// `B'_{i,k} = k (B_{i,k-1}/(t_{i+k}-t_i) - B_{i+1,k-1}/(t_{i+k+1}-t_{i+1}))`
/// once per level. Orders above `degree` are identically zero.
pub fn evaluate_derivative_sparse_into(
    x: f64,
    degree: usize,
    order: usize,
    knots: ArrayView1<'_, f64>,
    values: &mut [f64],
    scratch: &mut BsplineScratch,
) -> usize {
    debug_assert_eq!(values.len(), degree + 1);
    if order == 0 {
        return evaluate_sparse_into(x, degree, knots, values, scratch);
    }
    scratch.ensure_degree(degree);
    let mu = find_span(knots, degree, x);
    let start = mu - degree;
    values.fill(0.0);
    if order > degree {
        return start;
    }

    let base_degree = degree - order;
    let BsplineScratch { left, right, lower } = scratch;
    basis_functions_on_span(mu, x, base_degree, knots, lower, left, right);

    for k in (base_degree + 1)..=degree {
        // `lower[..k]` holds level k-1 for indices mu-(k-1)..=mu; level k is
        // written to `values[..=k]` for indices mu-k..=mu.
        for offset in 0..=k {
            let i = mu - k + offset;
            let left_val = if offset >= 1 { lower[offset - 1] } else { 0.0 };
            let right_val = if offset < k { lower[offset] } else { 0.0 };
            let denom_left = knots[i + k] - knots[i];
            let denom_right = knots[i + k + 1] - knots[i + 1];
            let left_term = if denom_left.abs() > ZERO_SPAN_TOL {
                left_val / denom_left
            } else {
                0.0
            };
            let right_term = if denom_right.abs() > ZERO_SPAN_TOL {
                right_val / denom_right
            } else {
                0.0
            };
            values[offset] = (k as f64) * (left_term - right_term);
        }
        lower[..=k].copy_from_slice(&values[..=k]);
    }
    start
}

/// Dense vector of all basis values at `x`.
pub fn evaluate_basis(
    knots: ArrayView1<'_, f64>,
    degree: usize,
    x: f64,
) -> Result<Array1<f64>, BasisError> {
    evaluate_basis_derivative(knots, degree, x, 0)
}

/// Dense vector of the `order`-th derivatives of all basis functions at `x`.
pub fn evaluate_basis_derivative(
    knots: ArrayView1<'_, f64>,
    degree: usize,
    x: f64,
    order: usize,
) -> Result<Array1<f64>, BasisError> {
    validate_knot_vector(knots, degree)?;
    let num_basis = num_basis_functions(knots, degree);
    let mut scratch = BsplineScratch::new(degree);
    let mut local = vec![0.0; degree + 1];
    let start = evaluate_derivative_sparse_into(x, degree, order, knots, &mut local, &mut scratch);
    let mut out = Array1::zeros(num_basis);
    for (offset, &v) in local.iter().enumerate() {
        out[start + offset] = v;
    }
    Ok(out)
}

/// Univariate clamped B-spline basis: a validated knot vector plus degree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnivariateBasis {
    knots: Array1<f64>,
    degree: usize,
}

impl UnivariateBasis {
    pub fn new(knots: Array1<f64>, degree: usize) -> Result<Self, BasisError> {
        validate_knot_vector(knots.view(), degree)?;
        Ok(Self { knots, degree })
    }

    pub fn knots(&self) -> &Array1<f64> {
        &self.knots
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn num_basis_functions(&self) -> usize {
        num_basis_functions(self.knots.view(), self.degree)
    }

    pub fn lower_bound(&self) -> f64 {
        self.knots[0]
    }

    pub fn upper_bound(&self) -> f64 {
        self.knots[self.knots.len() - 1]
    }
}

/// Per-thread buffers for tensor-product evaluation.
pub struct TensorScratch {
    scratch: Vec<BsplineScratch>,
    values: Vec<Vec<f64>>,
    starts: Vec<usize>,
    indices: Vec<usize>,
}

impl TensorScratch {
    pub fn new(basis: &TensorBasis) -> Self {
        let dims = basis.dim();
        Self {
            scratch: basis
                .bases
                .iter()
                .map(|b| BsplineScratch::new(b.degree))
                .collect(),
            values: basis
                .bases
                .iter()
                .map(|b| vec![0.0; b.degree + 1])
                .collect(),
            starts: vec![0; dims],
            indices: vec![0; dims],
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TensorBasisParts {
    knot_vectors: Vec<Array1<f64>>,
    degrees: Vec<usize>,
}

/// Tensor product of univariate bases. Multivariate basis functions are
/// ordered lexicographically by their per-dimension indices with the last
/// dimension varying fastest; coefficient vectors use the same layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorBasisParts", into = "TensorBasisParts")]
pub struct TensorBasis {
    bases: Vec<UnivariateBasis>,
    strides: Vec<usize>,
    total: usize,
}

impl TryFrom<TensorBasisParts> for TensorBasis {
    type Error = BasisError;

    fn try_from(parts: TensorBasisParts) -> Result<Self, Self::Error> {
        TensorBasis::new(parts.knot_vectors, parts.degrees)
    }
}

impl From<TensorBasis> for TensorBasisParts {
    fn from(basis: TensorBasis) -> Self {
        let (knot_vectors, degrees) = basis
            .bases
            .into_iter()
            .map(|b| (b.knots, b.degree))
            .unzip();
        TensorBasisParts {
            knot_vectors,
            degrees,
        }
    }
}

fn compute_tensor_strides(num_basis: &[usize]) -> Result<(Vec<usize>, usize), BasisError> {
    let mut strides = vec![1usize; num_basis.len()];
    let mut acc = 1usize;
    for i in (0..num_basis.len()).rev() {
        strides[i] = acc;
        acc = acc.checked_mul(num_basis[i]).ok_or(BasisError::TooLarge)?;
    }
    Ok((strides, acc))
}

impl TensorBasis {
    pub fn new(knot_vectors: Vec<Array1<f64>>, degrees: Vec<usize>) -> Result<Self, BasisError> {
        if knot_vectors.is_empty() {
            return Err(BasisError::NoDimensions);
        }
        if knot_vectors.len() != degrees.len() {
            return Err(BasisError::ShapeMismatch {
                knot_vectors: knot_vectors.len(),
                degrees: degrees.len(),
            });
        }
        let bases = knot_vectors
            .into_iter()
            .zip(degrees)
            .map(|(knots, degree)| UnivariateBasis::new(knots, degree))
            .collect::<Result<Vec<_>, _>>()?;
        let num_basis: Vec<usize> = bases.iter().map(|b| b.num_basis_functions()).collect();
        let (strides, total) = compute_tensor_strides(&num_basis)?;
        Ok(Self {
            bases,
            strides,
            total,
        })
    }

    pub fn dim(&self) -> usize {
        self.bases.len()
    }

    pub fn bases(&self) -> &[UnivariateBasis] {
        &self.bases
    }

    pub fn degrees(&self) -> Vec<usize> {
        self.bases.iter().map(|b| b.degree).collect()
    }

    pub fn knot_vectors(&self) -> Vec<&Array1<f64>> {
        self.bases.iter().map(|b| &b.knots).collect()
    }

    pub fn num_basis_functions(&self) -> Vec<usize> {
        self.bases.iter().map(|b| b.num_basis_functions()).collect()
    }

    pub fn total_basis_functions(&self) -> usize {
        self.total
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Upper bound on the number of non-zero multivariate functions at a point.
    pub fn support_size(&self) -> usize {
        self.bases
            .iter()
            .fold(1usize, |acc, b| acc.saturating_mul(b.degree + 1))
    }

    pub fn lower_bounds(&self) -> Vec<f64> {
        self.bases.iter().map(|b| b.lower_bound()).collect()
    }

    pub fn upper_bounds(&self) -> Vec<f64> {
        self.bases.iter().map(|b| b.upper_bound()).collect()
    }

    /// True when every coordinate lies in its dimension's domain, allowing a
    /// relative slack of `rel_tol` times the domain width.
    pub fn contains(&self, x: &[f64], rel_tol: f64) -> bool {
        x.len() == self.dim()
            && self.bases.iter().zip(x).all(|(b, &xi)| {
                let slack = rel_tol * (b.upper_bound() - b.lower_bound());
                xi >= b.lower_bound() - slack && xi <= b.upper_bound() + slack
            })
    }

    fn check_point(&self, x: &[f64]) -> Result<(), BasisError> {
        if x.len() != self.dim() {
            return Err(BasisError::DimensionMismatch {
                expected: self.dim(),
                found: x.len(),
            });
        }
        Ok(())
    }

    /// Walks the non-zero tensor-product values at `x`, calling
    /// `write_entry(column, value)` in increasing column order. `orders` selects
    /// a derivative order per dimension (`None` means plain values).
    pub fn for_each_nonzero<F>(
        &self,
        x: &[f64],
        orders: Option<&[usize]>,
        scratch: &mut TensorScratch,
        mut write_entry: F,
    ) -> Result<(), BasisError>
    where
        F: FnMut(usize, f64),
    {
        self.check_point(x)?;
        if let Some(orders) = orders
            && orders.len() != self.dim()
        {
            return Err(BasisError::DimensionMismatch {
                expected: self.dim(),
                found: orders.len(),
            });
        }
        let dims = self.dim();
        for dim in 0..dims {
            let basis = &self.bases[dim];
            let order = orders.map_or(0, |o| o[dim]);
            scratch.starts[dim] = evaluate_derivative_sparse_into(
                x[dim],
                basis.degree,
                order,
                basis.knots.view(),
                &mut scratch.values[dim],
                &mut scratch.scratch[dim],
            );
        }

        scratch.indices.fill(0);
        loop {
            let mut product = 1.0f64;
            let mut col = 0usize;
            for dim in 0..dims {
                product *= scratch.values[dim][scratch.indices[dim]];
                if product == 0.0 {
                    break;
                }
                col += (scratch.starts[dim] + scratch.indices[dim]) * self.strides[dim];
            }
            if product != 0.0 {
                write_entry(col, product);
            }

            let mut carried = true;
            for dim in (0..dims).rev() {
                scratch.indices[dim] += 1;
                if scratch.indices[dim] <= self.bases[dim].degree {
                    carried = false;
                    break;
                }
                scratch.indices[dim] = 0;
            }
            if carried {
                break;
            }
        }
        Ok(())
    }

    /// Non-zero `(column, value)` pairs of the multivariate basis at `x`.
    pub fn eval_sparse(&self, x: &[f64]) -> Result<Vec<(usize, f64)>, BasisError> {
        let mut scratch = TensorScratch::new(self);
        let mut entries = Vec::with_capacity(self.support_size());
        self.for_each_nonzero(x, None, &mut scratch, |col, v| entries.push((col, v)))?;
        Ok(entries)
    }

    /// All multivariate basis values at `x` as a dense vector.
    pub fn eval_dense(&self, x: &[f64]) -> Result<Array1<f64>, BasisError> {
        self.eval_derivative(x, &vec![0; self.dim()])
    }

    /// Mixed partial derivative of every multivariate basis function at `x`,
    /// `orders[d]` times along dimension `d`.
    pub fn eval_derivative(
        &self,
        x: &[f64],
        orders: &[usize],
    ) -> Result<Array1<f64>, BasisError> {
        let mut scratch = TensorScratch::new(self);
        let mut out = Array1::zeros(self.total);
        self.for_each_nonzero(x, Some(orders), &mut scratch, |col, v| out[col] = v)?;
        Ok(out)
    }
}
