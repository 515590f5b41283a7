//! Tensor-product B-spline fitting.
//!
//! Samples go through per-dimension knot construction ([`knots`]), basis
//! evaluation ([`basis`]), weighted design-matrix assembly ([`design`]), and a
//! regularized least-squares solve ([`solver`]); [`BSplineBuilder::fit`] drives
//! the whole pipeline and returns an immutable [`BSpline`].

pub mod basis;
pub mod bspline;
pub mod builder;
pub mod data;
pub mod design;
pub mod knots;
pub mod linalg;
pub mod penalty;
pub mod solver;
pub mod types;

pub use basis::{BasisError, TensorBasis, UnivariateBasis, evaluate_basis, evaluate_basis_derivative};
pub use bspline::{BSpline, BSplineError};
pub use builder::{
    BSplineBuilder, FitError, FitOptions, bspline_interpolator, bspline_smoother,
    bspline_unfitted,
};
pub use data::{DataError, DataPoint, DataTable};
pub use design::{DesignError, DesignMatrix, LinearSystem, assemble_system};
pub use knots::{KnotError, build_knot_vector, validate_knot_vector};
pub use penalty::{
    difference_penalty_1d, identity_penalty, tensor_difference_penalty,
    tensor_difference_penalty_upper,
};
pub use solver::{NormalMatrix, SolverError, normal_equations, residual_sum_of_squares, solve};
pub use types::{DEFAULT_ALPHA, DEFAULT_DEGREE, KnotSpacing, Smoothing};
