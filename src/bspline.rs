use crate::basis::{BasisError, TensorBasis, TensorScratch};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relative slack (of each dimension's width) accepted at the domain edges.
const DOMAIN_REL_TOL: f64 = 1e-10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BSplineError {
    #[error(transparent)]
    Basis(#[from] BasisError),

    #[error("Point has {found} coordinates but the spline takes {expected} inputs.")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Point {point:?} lies outside the spline domain [{lower:?}, {upper:?}].")]
    OutOfDomain {
        point: Vec<f64>,
        lower: Vec<f64>,
        upper: Vec<f64>,
    },

    #[error(
        "Coefficient matrix is {found_rows}x{found_cols} but the basis needs {expected_rows}x{expected_cols}."
    )]
    CoefficientShape {
        expected_rows: usize,
        expected_cols: usize,
        found_rows: usize,
        found_cols: usize,
    },

    #[error("Coefficients must be finite.")]
    NonFiniteCoefficients,
}

/// Tensor-product B-spline `f: R^dim_x -> R^dim_y`.
///
/// Row `j` of `coefficients` belongs to multivariate basis function `j` (in
/// the basis' lexicographic layout); column `k` to output `k`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BSplineParts", into = "BSplineParts")]
pub struct BSpline {
    basis: TensorBasis,
    coefficients: Array2<f64>,
}

#[derive(Serialize, Deserialize)]
struct BSplineParts {
    basis: TensorBasis,
    coefficients: Array2<f64>,
}

impl TryFrom<BSplineParts> for BSpline {
    type Error = BSplineError;

    fn try_from(parts: BSplineParts) -> Result<Self, Self::Error> {
        BSpline::new(parts.basis, parts.coefficients)
    }
}

impl From<BSpline> for BSplineParts {
    fn from(spline: BSpline) -> Self {
        BSplineParts {
            basis: spline.basis,
            coefficients: spline.coefficients,
        }
    }
}

impl BSpline {
    pub fn new(basis: TensorBasis, coefficients: Array2<f64>) -> Result<Self, BSplineError> {
        check_coefficients(&basis, &coefficients)?;
        Ok(Self {
            basis,
            coefficients,
        })
    }

    /// Spline with all coefficients zero, for callers that assign them later.
    pub fn zeros(basis: TensorBasis, dim_y: usize) -> Self {
        let coefficients = Array2::zeros((basis.total_basis_functions(), dim_y));
        Self {
            basis,
            coefficients,
        }
    }

    /// Copy of this spline with its coefficients replaced.
    pub fn with_coefficients(&self, coefficients: Array2<f64>) -> Result<Self, BSplineError> {
        if coefficients.ncols() != self.dim_y() {
            return Err(BSplineError::CoefficientShape {
                expected_rows: self.basis.total_basis_functions(),
                expected_cols: self.dim_y(),
                found_rows: coefficients.nrows(),
                found_cols: coefficients.ncols(),
            });
        }
        Self::new(self.basis.clone(), coefficients)
    }

    pub fn dim_x(&self) -> usize {
        self.basis.dim()
    }

    pub fn dim_y(&self) -> usize {
        self.coefficients.ncols()
    }

    pub fn basis(&self) -> &TensorBasis {
        &self.basis
    }

    pub fn coefficients(&self) -> &Array2<f64> {
        &self.coefficients
    }

    pub fn knot_vectors(&self) -> Vec<&Array1<f64>> {
        self.basis.knot_vectors()
    }

    pub fn degrees(&self) -> Vec<usize> {
        self.basis.degrees()
    }

    pub fn num_basis_functions(&self) -> Vec<usize> {
        self.basis.num_basis_functions()
    }

    pub fn domain_lower_bound(&self) -> Vec<f64> {
        self.basis.lower_bounds()
    }

    pub fn domain_upper_bound(&self) -> Vec<f64> {
        self.basis.upper_bounds()
    }

    fn check_point(&self, x: &[f64]) -> Result<(), BSplineError> {
        if x.len() != self.dim_x() {
            return Err(BSplineError::DimensionMismatch {
                expected: self.dim_x(),
                found: x.len(),
            });
        }
        if !self.basis.contains(x, DOMAIN_REL_TOL) {
            return Err(BSplineError::OutOfDomain {
                point: x.to_vec(),
                lower: self.domain_lower_bound(),
                upper: self.domain_upper_bound(),
            });
        }
        Ok(())
    }

    fn eval_with(
        &self,
        x: &[f64],
        orders: Option<&[usize]>,
        scratch: &mut TensorScratch,
    ) -> Result<Array1<f64>, BSplineError> {
        let mut out = Array1::<f64>::zeros(self.dim_y());
        self.basis.for_each_nonzero(x, orders, scratch, |col, v| {
            out.scaled_add(v, &self.coefficients.row(col));
        })?;
        Ok(out)
    }

    /// Value of every output at `x`.
    pub fn eval(&self, x: &[f64]) -> Result<Array1<f64>, BSplineError> {
        self.check_point(x)?;
        let mut scratch = TensorScratch::new(&self.basis);
        self.eval_with(x, None, &mut scratch)
    }

    /// Evaluates every row of `points` (`n × dim_x`), returning `n × dim_y`.
    pub fn eval_many(&self, points: ArrayView2<'_, f64>) -> Result<Array2<f64>, BSplineError> {
        if points.ncols() != self.dim_x() {
            return Err(BSplineError::DimensionMismatch {
                expected: self.dim_x(),
                found: points.ncols(),
            });
        }
        let mut out = Array2::<f64>::zeros((points.nrows(), self.dim_y()));
        let mut scratch = TensorScratch::new(&self.basis);
        let mut x = vec![0.0; self.dim_x()];
        for (point, mut row) in points.axis_iter(Axis(0)).zip(out.axis_iter_mut(Axis(0))) {
            for (dst, &src) in x.iter_mut().zip(point.iter()) {
                *dst = src;
            }
            self.check_point(&x)?;
            row.assign(&self.eval_with(&x, None, &mut scratch)?);
        }
        Ok(out)
    }

    /// `dim_y × dim_x` matrix of first partial derivatives at `x`.
    pub fn eval_jacobian(&self, x: &[f64]) -> Result<Array2<f64>, BSplineError> {
        self.check_point(x)?;
        let dim_x = self.dim_x();
        let mut jacobian = Array2::<f64>::zeros((self.dim_y(), dim_x));
        let mut scratch = TensorScratch::new(&self.basis);
        let mut orders = vec![0usize; dim_x];
        for dim in 0..dim_x {
            orders.fill(0);
            orders[dim] = 1;
            let column = self.eval_with(x, Some(orders.as_slice()), &mut scratch)?;
            jacobian.column_mut(dim).assign(&column);
        }
        Ok(jacobian)
    }
}

fn check_coefficients(basis: &TensorBasis, coefficients: &Array2<f64>) -> Result<(), BSplineError> {
    let (rows, cols) = coefficients.dim();
    let expected_rows = basis.total_basis_functions();
    if rows != expected_rows || cols == 0 {
        return Err(BSplineError::CoefficientShape {
            expected_rows,
            expected_cols: cols.max(1),
            found_rows: rows,
            found_cols: cols,
        });
    }
    if coefficients.iter().any(|v| !v.is_finite()) {
        return Err(BSplineError::NonFiniteCoefficients);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn linear_1d() -> TensorBasis {
        TensorBasis::new(vec![array![0.0, 0.0, 1.0, 2.0, 2.0]], vec![1]).unwrap()
    }

    #[test]
    fn evaluates_coefficient_combination() {
        let spline = BSpline::new(linear_1d(), array![[0.0], [1.0], [4.0]]).unwrap();
        assert_abs_diff_eq!(spline.eval(&[0.5]).unwrap()[0], 0.5, epsilon = 1e-14);
        assert_abs_diff_eq!(spline.eval(&[1.5]).unwrap()[0], 2.5, epsilon = 1e-14);
        assert_abs_diff_eq!(spline.eval(&[2.0]).unwrap()[0], 4.0, epsilon = 1e-14);
    }

    #[test]
    fn jacobian_of_bilinear_surface() {
        let k = array![0.0, 0.0, 1.0, 1.0];
        let basis = TensorBasis::new(vec![k.clone(), k], vec![1, 1]).unwrap();
        // f(x, y) = x + 2y + 3xy, coefficients at corners (0,0),(0,1),(1,0),(1,1).
        let c = array![[0.0, 1.0], [2.0, 1.0], [1.0, 1.0], [6.0, 1.0]];
        let spline = BSpline::new(basis, c).unwrap();
        let j = spline.eval_jacobian(&[0.25, 0.5]).unwrap();
        assert_eq!(j.dim(), (2, 2));
        assert_abs_diff_eq!(j[[0, 0]], 1.0 + 3.0 * 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(j[[0, 1]], 2.0 + 3.0 * 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(j[[1, 0]], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(j[[1, 1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_points_outside_domain_and_wrong_length() {
        let spline = BSpline::zeros(linear_1d(), 1);
        assert!(matches!(
            spline.eval(&[2.5]),
            Err(BSplineError::OutOfDomain { .. })
        ));
        assert!(matches!(
            spline.eval(&[1.0, 1.0]),
            Err(BSplineError::DimensionMismatch {
                expected: 1,
                found: 2
            })
        ));
    }

    #[test]
    fn with_coefficients_validates_shape() {
        let spline = BSpline::zeros(linear_1d(), 1);
        assert!(matches!(
            spline.with_coefficients(Array2::zeros((2, 1))),
            Err(BSplineError::CoefficientShape { .. })
        ));
        assert!(matches!(
            spline.with_coefficients(Array2::zeros((3, 2))),
            Err(BSplineError::CoefficientShape { .. })
        ));
        assert!(matches!(
            spline.with_coefficients(array![[0.0], [f64::INFINITY], [0.0]]),
            Err(BSplineError::NonFiniteCoefficients)
        ));
        let filled = spline.with_coefficients(array![[1.0], [1.0], [1.0]]).unwrap();
        assert_abs_diff_eq!(filled.eval(&[0.7]).unwrap()[0], 1.0, epsilon = 1e-14);
        assert_eq!(spline.coefficients().sum(), 0.0);
    }

    #[test]
    fn serialized_model_is_validated_on_load() {
        let spline = BSpline::new(linear_1d(), array![[1.0], [2.0], [3.0]]).unwrap();
        let json = serde_json::to_string(&spline).unwrap();
        let restored: BSpline = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, spline);

        // Drop one coefficient row; the basis still has three functions.
        let mut value: serde_json::Value = serde_json::from_str(&json).unwrap();
        value["coefficients"] = serde_json::to_value(array![[1.0], [2.0]]).unwrap();
        assert!(serde_json::from_value::<BSpline>(value).is_err());
    }

    #[test]
    fn eval_many_matches_pointwise_eval() {
        let spline = BSpline::new(linear_1d(), array![[1.0], [-1.0], [2.0]]).unwrap();
        let points = Array2::from_shape_vec((4, 1), vec![0.0, 0.3, 1.2, 2.0]).unwrap();
        let many = spline.eval_many(points.view()).unwrap();
        for (i, &x) in [0.0, 0.3, 1.2, 2.0].iter().enumerate() {
            assert_eq!(many[[i, 0]], spline.eval(&[x]).unwrap()[0]);
        }
    }
}
